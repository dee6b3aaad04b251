use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::credential::{Credential, CredentialKind};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Refresh this long before the recorded expiry to absorb clock skew.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("expected a GCP credential")]
    WrongKind,
    #[error("jwt encoding failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token endpoint error: {0}")]
    Http(String),
    #[error("token response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// A freshly minted access token plus its expiry, to be written back into the
/// pool's credential record.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: i64,
}

pub fn token_is_fresh(credential: &Credential, now: OffsetDateTime) -> bool {
    match &credential.kind {
        CredentialKind::Gcp {
            access_token,
            token_expires_at,
            ..
        } => {
            !access_token.trim().is_empty()
                && now.unix_timestamp() + EXPIRY_SLACK_SECS < *token_expires_at
        }
        _ => false,
    }
}

/// Exchanges the service-account key for a bearer token via the RS256
/// JWT-bearer grant.
pub async fn refresh_access_token(
    client: &wreq::Client,
    credential: &Credential,
    now: OffsetDateTime,
) -> Result<RefreshedToken, OAuthError> {
    use jsonwebtoken::{Algorithm, EncodingKey, Header};

    let (client_email, private_key) = match &credential.kind {
        CredentialKind::Gcp {
            client_email,
            private_key,
            ..
        } => (client_email.as_str(), private_key.as_str()),
        _ => return Err(OAuthError::WrongKind),
    };

    let iat = now.unix_timestamp();
    let exp = iat + 3600;
    let claims = JwtClaims {
        iss: client_email,
        scope: DEFAULT_SCOPE,
        aud: DEFAULT_TOKEN_URI,
        exp,
        iat,
    };
    let header = Header::new(Algorithm::RS256);
    let key = EncodingKey::from_rsa_pem(private_key.as_bytes())?;
    let jwt = jsonwebtoken::encode(&header, &claims, &key)?;

    let body = format!(
        "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion={}",
        urlencoding::encode(&jwt)
    );
    let resp = client
        .post(DEFAULT_TOKEN_URI)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|err| OAuthError::Http(err.to_string()))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| OAuthError::Http(err.to_string()))?;
    if !status.is_success() {
        return Err(OAuthError::Http(format!(
            "oauth token failed: {} {}",
            status,
            String::from_utf8_lossy(&bytes)
        )));
    }
    let token: TokenResponse = serde_json::from_slice(&bytes)?;
    Ok(RefreshedToken {
        access_token: token.access_token,
        expires_at: iat + token.expires_in.unwrap_or(3600),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialSeed;
    use mproxy_registry::Service;

    #[test]
    fn freshness_respects_slack() {
        let now = OffsetDateTime::from_unix_timestamp(1_000_000).unwrap();
        let mut credential = Credential::from_seed(CredentialSeed {
            secret: "sa".to_string(),
            service: Service::Gcp,
            model_families: None,
            kind: Some(CredentialKind::Gcp {
                region: "us-east5".to_string(),
                project_id: "p".to_string(),
                client_email: "sa@p.iam.gserviceaccount.com".to_string(),
                private_key: String::new(),
                access_token: "tok".to_string(),
                token_expires_at: 1_000_000 + 120,
            }),
        });
        assert!(token_is_fresh(&credential, now));
        if let CredentialKind::Gcp {
            token_expires_at, ..
        } = &mut credential.kind
        {
            *token_expires_at = 1_000_000 + 30;
        }
        assert!(!token_is_fresh(&credential, now));
    }
}
