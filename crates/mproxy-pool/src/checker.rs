use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use mproxy_registry::{ModelFamily, Service};

use crate::auth::{gcp, sigv4};
use crate::credential::{Credential, CredentialKind, CredentialPatch, DisabledReason};
use crate::pool::CredentialPool;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Outcome of one credential probe.
#[derive(Debug)]
enum CheckResult {
    Ok(CredentialPatch),
    Revoked,
    OverQuota,
    /// Transient problem; leave the credential alone and retry next cycle.
    Inconclusive(String),
}

/// Periodic per-provider credential prober. Runs once at startup and then on
/// a fixed cadence; outcomes are written back through `pool.update`.
pub struct HealthChecker {
    pool: Arc<CredentialPool>,
    client: wreq::Client,
}

impl HealthChecker {
    pub fn new(pool: Arc<CredentialPool>, proxy: Option<&str>) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(PROBE_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Self {
            pool,
            client: builder.build()?,
        })
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.run_once().await;
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        });
    }

    pub async fn run_once(&self) {
        for service in Service::all() {
            for credential in self.pool.list(*service).await {
                if credential.is_revoked {
                    continue;
                }
                self.check_and_apply(&credential).await;
            }
        }
    }

    /// On-demand recheck of one credential (e.g. an OpenRouter paid key
    /// whose balance is due for refresh).
    pub async fn check_one(&self, hash: &str) {
        if let Some(credential) = self.pool.get(hash).await
            && !credential.is_revoked
        {
            self.check_and_apply(&credential).await;
        }
    }

    async fn check_and_apply(&self, credential: &Credential) {
        let hash = credential.hash.clone();
        let service = credential.service;
        match self.check_credential(credential).await {
            CheckResult::Ok(mut patch) => {
                patch.last_checked = Some(OffsetDateTime::now_utc());
                self.pool.update(&hash, patch).await;
                info!(event = "credential_checked", credential = %hash, service = %service);
            }
            CheckResult::Revoked => {
                self.pool.disable(&hash, DisabledReason::Revoked).await;
            }
            CheckResult::OverQuota => {
                self.pool.disable(&hash, DisabledReason::Quota).await;
            }
            CheckResult::Inconclusive(message) => {
                warn!(
                    event = "credential_check_inconclusive",
                    credential = %hash,
                    service = %service,
                    message = %message
                );
            }
        }
    }

    async fn check_credential(&self, credential: &Credential) -> CheckResult {
        match credential.service {
            Service::Openai => self.check_openai(credential).await,
            Service::Anthropic => self.check_anthropic(credential).await,
            Service::Aws => self.check_aws(credential).await,
            Service::Gcp => self.check_gcp(credential).await,
            Service::GoogleAi => {
                self.check_bearerless_models(
                    credential,
                    &format!(
                        "https://generativelanguage.googleapis.com/v1beta/models?key={}",
                        credential.secret
                    ),
                )
                .await
            }
            Service::MistralAi => {
                self.check_bearer_models(credential, "https://api.mistral.ai/v1/models")
                    .await
            }
            Service::Openrouter => self.check_openrouter(credential).await,
            Service::Moonshot => {
                self.check_bearer_models(credential, "https://api.moonshot.ai/v1/models")
                    .await
            }
            Service::Qwen => {
                self.check_bearer_models(
                    credential,
                    "https://dashscope-intl.aliyuncs.com/compatible-mode/v1/models",
                )
                .await
            }
            Service::Glm => {
                self.check_bearer_models(
                    credential,
                    "https://open.bigmodel.cn/api/paas/v4/models",
                )
                .await
            }
            Service::Cohere => {
                self.check_bearer_models(credential, "https://api.cohere.com/v1/models")
                    .await
            }
            Service::Azure => self.check_azure(credential).await,
        }
    }

    /// GET with bearer auth against a models-list endpoint; the cheapest
    /// possible liveness probe for OpenAI-compatible providers.
    async fn check_bearer_models(&self, credential: &Credential, url: &str) -> CheckResult {
        let resp = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", credential.secret))
            .send()
            .await;
        self.classify_probe_status(resp).await
    }

    async fn check_bearerless_models(&self, _credential: &Credential, url: &str) -> CheckResult {
        let resp = self.client.get(url).send().await;
        self.classify_probe_status(resp).await
    }

    async fn classify_probe_status(
        &self,
        resp: Result<wreq::Response, wreq::Error>,
    ) -> CheckResult {
        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match status {
                    200..=299 => CheckResult::Ok(CredentialPatch::default()),
                    401 | 403 => CheckResult::Revoked,
                    402 => CheckResult::OverQuota,
                    429 => {
                        // Rate limited is alive; quota exhaustion hides in the body.
                        let body = resp.text().await.unwrap_or_default();
                        if body.contains("insufficient_quota") || body.contains("billing") {
                            CheckResult::OverQuota
                        } else {
                            CheckResult::Ok(CredentialPatch::default())
                        }
                    }
                    _ => CheckResult::Inconclusive(format!("status {status}")),
                }
            }
            Err(err) => CheckResult::Inconclusive(err.to_string()),
        }
    }

    async fn check_openai(&self, credential: &Credential) -> CheckResult {
        let base = self
            .check_bearer_models(credential, "https://api.openai.com/v1/models")
            .await;
        let CheckResult::Ok(mut patch) = base else {
            return base;
        };

        // Organization verification: attempt a one-token stream of a
        // verification-gated model. Unverified orgs get a 400 naming the
        // verification requirement and lose the verified-only families.
        if credential.model_families.contains(&ModelFamily::GptImage)
            || credential.model_families.contains(&ModelFamily::O3)
        {
            let probe = json!({
                "model": "o3",
                "messages": [{"role": "user", "content": "hi"}],
                "max_completion_tokens": 1,
                "stream": true,
            });
            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", credential.secret))
                .json(&probe)
                .send()
                .await;
            if let Ok(resp) = resp
                && resp.status().as_u16() == 400
            {
                let body = resp.text().await.unwrap_or_default();
                if body.contains("verif") {
                    let families: BTreeSet<ModelFamily> = credential
                        .model_families
                        .iter()
                        .copied()
                        .filter(|family| {
                            !matches!(family, ModelFamily::GptImage | ModelFamily::O3)
                        })
                        .collect();
                    info!(
                        event = "openai_org_unverified",
                        credential = %credential.hash
                    );
                    patch.model_families = Some(families);
                }
            }
        }
        CheckResult::Ok(patch)
    }

    async fn check_anthropic(&self, credential: &Credential) -> CheckResult {
        // A one-token completion with a cache marker doubles as liveness and
        // prompt-cache sanity probe.
        let probe = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "system": [{
                "type": "text",
                "text": "You are a connectivity probe.",
                "cache_control": {"type": "ephemeral"}
            }],
            "messages": [{"role": "user", "content": "hi"}],
        });
        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", credential.secret.clone())
            .header("anthropic-version", "2023-06-01")
            .json(&probe)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match status {
                    200..=299 => {
                        let body: Value = resp.json().await.unwrap_or(Value::Null);
                        let usage = &body["usage"];
                        let cache_seen = usage["cache_creation_input_tokens"]
                            .as_u64()
                            .unwrap_or(0)
                            + usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                        if cache_seen == 0 {
                            error!(
                                event = "prompt_cache_sanity_failed",
                                credential = %credential.hash,
                                "cached probe returned no cache metrics"
                            );
                        }
                        CheckResult::Ok(CredentialPatch::default())
                    }
                    401 | 403 => CheckResult::Revoked,
                    400 => {
                        // Billing problems surface as invalid_request on this
                        // endpoint; the key itself is alive.
                        let body = resp.text().await.unwrap_or_default();
                        if body.contains("credit balance") {
                            CheckResult::OverQuota
                        } else {
                            CheckResult::Ok(CredentialPatch::default())
                        }
                    }
                    429 => CheckResult::Ok(CredentialPatch::default()),
                    _ => CheckResult::Inconclusive(format!("status {status}")),
                }
            }
            Err(err) => CheckResult::Inconclusive(err.to_string()),
        }
    }

    async fn check_aws(&self, credential: &Credential) -> CheckResult {
        let CredentialKind::Aws { region, .. } = &credential.kind else {
            return CheckResult::Inconclusive("missing aws extension".to_string());
        };
        let region = region.clone();
        let host = format!("bedrock.{region}.amazonaws.com");

        let models = match self
            .signed_get(credential, &host, &region, "/foundation-models")
            .await
        {
            Ok(body) => body,
            Err(result) => return result,
        };
        let model_ids: Vec<String> = models["modelSummaries"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row["modelId"].as_str().map(|id| id.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let profiles = self
            .signed_get(credential, &host, &region, "/inference-profiles")
            .await
            .ok();
        let inference_profile_ids: Vec<String> = profiles
            .as_ref()
            .and_then(|body| body["inferenceProfileSummaries"].as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        row["inferenceProfileId"].as_str().map(|id| id.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();

        let logging = self
            .signed_get(credential, &host, &region, "/logging/modelinvocations")
            .await
            .ok();
        let logging_enabled = logging
            .as_ref()
            .map(|body| !body["loggingConfig"].is_null());
        if logging_enabled == Some(true) {
            warn!(
                event = "aws_invocation_logging_enabled",
                credential = %credential.hash
            );
        }

        CheckResult::Ok(CredentialPatch {
            kind: Some(CredentialKind::Aws {
                region,
                logging_enabled,
                model_ids,
                inference_profile_ids,
            }),
            ..Default::default()
        })
    }

    async fn signed_get(
        &self,
        credential: &Credential,
        host: &str,
        region: &str,
        path: &str,
    ) -> Result<Value, CheckResult> {
        let input = sigv4::SigningInput {
            method: "GET",
            host,
            path,
            query: "",
            region,
            service: "bedrock",
            body: b"",
        };
        let signed = sigv4::sign(&credential.secret, &input, OffsetDateTime::now_utc())
            .map_err(|err| CheckResult::Inconclusive(err.to_string()))?;
        let resp = self
            .client
            .get(format!("https://{host}{path}"))
            .header("Authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .send()
            .await
            .map_err(|err| CheckResult::Inconclusive(err.to_string()))?;
        let status = resp.status().as_u16();
        match status {
            200..=299 => resp
                .json()
                .await
                .map_err(|err| CheckResult::Inconclusive(err.to_string())),
            401 | 403 => Err(CheckResult::Revoked),
            _ => Err(CheckResult::Inconclusive(format!("status {status}"))),
        }
    }

    async fn check_gcp(&self, credential: &Credential) -> CheckResult {
        // A successful token mint is the probe; the refreshed token is cached
        // on the credential for the outbound path.
        let now = OffsetDateTime::now_utc();
        if gcp::token_is_fresh(credential, now) {
            return CheckResult::Ok(CredentialPatch::default());
        }
        match gcp::refresh_access_token(&self.client, credential, now).await {
            Ok(token) => {
                let CredentialKind::Gcp {
                    region,
                    project_id,
                    client_email,
                    private_key,
                    ..
                } = &credential.kind
                else {
                    return CheckResult::Inconclusive("missing gcp extension".to_string());
                };
                CheckResult::Ok(CredentialPatch {
                    kind: Some(CredentialKind::Gcp {
                        region: region.clone(),
                        project_id: project_id.clone(),
                        client_email: client_email.clone(),
                        private_key: private_key.clone(),
                        access_token: token.access_token,
                        token_expires_at: token.expires_at,
                    }),
                    ..Default::default()
                })
            }
            Err(gcp::OAuthError::Http(message)) if message.contains("invalid_grant") => {
                CheckResult::Revoked
            }
            Err(err) => CheckResult::Inconclusive(err.to_string()),
        }
    }

    async fn check_openrouter(&self, credential: &Credential) -> CheckResult {
        let resp = self
            .client
            .get("https://openrouter.ai/api/v1/key")
            .header("Authorization", format!("Bearer {}", credential.secret))
            .send()
            .await;
        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == 401 || status == 403 {
                    return CheckResult::Revoked;
                }
                if !(200..300).contains(&status) {
                    return CheckResult::Inconclusive(format!("status {status}"));
                }
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                let data = &body["data"];
                let key_limit = data["limit"].as_f64();
                let usage = data["usage"].as_f64().unwrap_or(0.0);
                let limit_remaining = data["limit_remaining"]
                    .as_f64()
                    .or_else(|| key_limit.map(|limit| (limit - usage).max(0.0)));
                let is_free_tier = data["is_free_tier"].as_bool().unwrap_or(false);
                CheckResult::Ok(CredentialPatch {
                    kind: Some(CredentialKind::Openrouter {
                        is_free_tier,
                        account_balance: data["balance"].as_f64(),
                        limit_remaining,
                        key_limit,
                    }),
                    ..Default::default()
                })
            }
            Err(err) => CheckResult::Inconclusive(err.to_string()),
        }
    }

    async fn check_azure(&self, credential: &Credential) -> CheckResult {
        let CredentialKind::Azure {
            resource_name,
            api_version,
        } = &credential.kind
        else {
            return CheckResult::Inconclusive("missing azure extension".to_string());
        };
        let url = format!(
            "https://{resource_name}.openai.azure.com/openai/deployments?api-version={api_version}"
        );
        let resp = self
            .client
            .get(url)
            .header("api-key", credential.secret.clone())
            .send()
            .await;
        self.classify_probe_status(resp).await
    }
}
