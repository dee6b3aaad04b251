use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

type HmacSha256 = Hmac<Sha256>;

const AMZ_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const DATE_STAMP_FORMAT: &[FormatItem<'static>] = format_description!("[year][month][day]");

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("malformed AWS credential secret (expected access_key:secret_key)")]
    MalformedSecret,
    #[error("timestamp format error: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// A request ready to be signed: the caller has already finalized the body.
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub body: &'a [u8],
}

/// Headers produced by signing: callers attach these verbatim.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

/// AWS Signature Version 4 over the canonical request
/// (host + x-amz-content-sha256 + x-amz-date are the signed headers).
pub fn sign(
    secret: &str,
    input: &SigningInput<'_>,
    now: OffsetDateTime,
) -> Result<SignedHeaders, SigningError> {
    let (access_key, secret_key) = secret
        .split_once(':')
        .ok_or(SigningError::MalformedSecret)?;

    let amz_date = now.format(&AMZ_DATE_FORMAT)?;
    let date_stamp = now.format(&DATE_STAMP_FORMAT)?;

    let payload_hash = hex::encode(Sha256::digest(input.body));
    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        input.host, payload_hash, amz_date
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        canonical_uri(input.path),
        input.query,
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, input.region, input.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, input.region.as_bytes());
    let k_service = hmac(&k_region, input.service.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );

    Ok(SignedHeaders {
        authorization,
        amz_date,
        content_sha256: payload_hash,
    })
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Each path segment percent-encoded, slashes preserved. Model ids contain
/// `:` (e.g. `...-v1:0`) which must be encoded for the canonical form.
fn canonical_uri(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<String>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn signature_is_deterministic() {
        let input = SigningInput {
            method: "POST",
            host: "bedrock-runtime.us-east-1.amazonaws.com",
            path: "/model/anthropic.claude-3-sonnet-20240229-v1:0/invoke",
            query: "",
            region: "us-east-1",
            service: "bedrock",
            body: br#"{"max_tokens":10}"#,
        };
        let now = datetime!(2025-06-01 12:00:00 UTC);
        let a = sign("AKIAEXAMPLE:secretkey", &input, now).unwrap();
        let b = sign("AKIAEXAMPLE:secretkey", &input, now).unwrap();
        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20250601T120000Z");
        assert!(a.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20250601/"));
    }

    #[test]
    fn colon_in_model_id_is_encoded() {
        assert_eq!(
            canonical_uri("/model/anthropic.claude-v2:1/invoke"),
            "/model/anthropic.claude-v2%3A1/invoke"
        );
    }

    #[test]
    fn missing_separator_is_rejected() {
        let input = SigningInput {
            method: "GET",
            host: "h",
            path: "/",
            query: "",
            region: "us-east-1",
            service: "bedrock",
            body: b"",
        };
        assert!(matches!(
            sign("no-separator", &input, OffsetDateTime::UNIX_EPOCH),
            Err(SigningError::MalformedSecret)
        ));
    }
}
