use std::time::Duration;

use mproxy_registry::Service;

/// Output of the upstream error classifier. Exactly one classification per
/// failed attempt, produced in `handle_upstream_errors`; the dispatch loop
/// acts on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Client error; surfaced as 400 with a sanitized provider message.
    BadRequest(String),
    /// Upstream rejected the credential itself.
    Unauthorized,
    /// Credential account out of funds.
    CredentialOverQuota,
    /// 429 on the credential; lockout and rotate.
    RateLimited,
    /// This credential cannot serve this model (family over quota, missing
    /// model); rotate to a different one.
    ModelUnavailable,
    /// Moderation refusal; refund the admission charge and explain.
    ContentFiltered(String),
    /// 5xx-ish transient; backoff and retry.
    UpstreamTransient,
    /// Unrecognized; do not disable the credential.
    Fatal(String),
}

/// Maps `(service, status, error body)` to a classification. The rules are
/// provider-specific where providers disagree about what a status means.
pub fn classify_upstream_error(service: Service, status: u16, body: &str) -> ErrorClass {
    let lower = body.to_ascii_lowercase();

    match status {
        401 | 403 => ErrorClass::Unauthorized,
        402 => ErrorClass::CredentialOverQuota,
        404 => {
            if lower.contains("model") {
                ErrorClass::ModelUnavailable
            } else {
                ErrorClass::BadRequest(sanitize_message(service, body))
            }
        }
        429 => match service {
            Service::Openai | Service::Azure => {
                if lower.contains("insufficient_quota") || lower.contains("billing") {
                    ErrorClass::CredentialOverQuota
                } else {
                    ErrorClass::RateLimited
                }
            }
            Service::GoogleAi => {
                // AI Studio reports per-model daily quota exhaustion as 429;
                // that key is done for the family, not merely hot.
                if lower.contains("quota") && lower.contains("day") {
                    ErrorClass::ModelUnavailable
                } else {
                    ErrorClass::RateLimited
                }
            }
            _ => ErrorClass::RateLimited,
        },
        400 | 422 => {
            if is_content_filter(service, &lower) {
                ErrorClass::ContentFiltered(sanitize_message(service, body))
            } else if service == Service::Aws && lower.contains("modelnotready") {
                ErrorClass::UpstreamTransient
            } else {
                ErrorClass::BadRequest(sanitize_message(service, body))
            }
        }
        500 | 502 | 503 | 504 => ErrorClass::UpstreamTransient,
        // Anthropic's overloaded_error.
        529 => ErrorClass::UpstreamTransient,
        _ => ErrorClass::Fatal(format!("unexpected upstream status {status}")),
    }
}

fn is_content_filter(service: Service, lower_body: &str) -> bool {
    match service {
        Service::Openai | Service::Azure | Service::Openrouter => {
            lower_body.contains("content_policy")
                || lower_body.contains("content_filter")
                || lower_body.contains("moderation")
        }
        Service::Anthropic | Service::Aws | Service::Gcp => {
            lower_body.contains("content filtering")
        }
        Service::GoogleAi => {
            lower_body.contains("blocked") || lower_body.contains("prohibited_content")
        }
        _ => false,
    }
}

/// Strips provider internals from a message before it reaches a client.
/// OpenAI organization ids in particular must never leak.
pub fn sanitize_message(_service: Service, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value["error"]["message"]
                .as_str()
                .or_else(|| value["message"].as_str())
                .map(|text| text.to_string())
        })
        .unwrap_or_else(|| body.chars().take(256).collect());
    redact_org_ids(&message)
}

fn redact_org_ids(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(index) = rest.find("org-") {
        out.push_str(&rest[..index]);
        out.push_str("org-***");
        let after = &rest[index + 4..];
        let end = after
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(after.len());
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

/// Per-service retry budget for rotate-and-retry outcomes.
pub fn retry_budget(service: Service) -> u32 {
    match service {
        Service::Moonshot => 3,
        Service::Qwen => 5,
        Service::Anthropic | Service::Aws | Service::Gcp => 3,
        _ => 2,
    }
}

/// Backoff before a head re-enqueue. Qwen's 500s back off exponentially with
/// a hard cap; Moonshot runs a little longer than the default.
pub fn retry_backoff(service: Service, attempt: u32) -> Duration {
    match service {
        Service::Qwen => {
            let secs = 2u64.saturating_pow(attempt.min(6)).min(30);
            Duration::from_secs(secs)
        }
        Service::Moonshot => Duration::from_secs(u64::from(attempt.min(3)) * 2).min(
            Duration::from_secs(6),
        ),
        _ => Duration::from_secs(u64::from(attempt.clamp(1, 5))),
    }
}

/// The user-visible note when a service's retry budget is exhausted on 429s.
pub fn rate_limit_note(service: Service) -> String {
    format!(
        "Too many requests to the {} API. Please try again later.",
        service_display_name(service)
    )
}

fn service_display_name(service: Service) -> &'static str {
    match service {
        Service::Openai => "OpenAI",
        Service::Anthropic => "Anthropic",
        Service::Aws => "AWS Bedrock",
        Service::Gcp => "GCP Vertex",
        Service::GoogleAi => "Google AI",
        Service::MistralAi => "Mistral",
        Service::Openrouter => "OpenRouter",
        Service::Moonshot => "Moonshot",
        Service::Qwen => "Qwen",
        Service::Glm => "GLM",
        Service::Cohere => "Cohere",
        Service::Azure => "Azure OpenAI",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_classify_as_unauthorized() {
        assert_eq!(
            classify_upstream_error(Service::Anthropic, 401, "{}"),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            classify_upstream_error(Service::Openai, 403, "{}"),
            ErrorClass::Unauthorized
        );
    }

    #[test]
    fn openai_quota_429_differs_from_rate_limit() {
        assert_eq!(
            classify_upstream_error(
                Service::Openai,
                429,
                r#"{"error":{"type":"insufficient_quota","message":"You exceeded your current quota"}}"#
            ),
            ErrorClass::CredentialOverQuota
        );
        assert_eq!(
            classify_upstream_error(Service::Openai, 429, r#"{"error":{"type":"rate_limit_error"}}"#),
            ErrorClass::RateLimited
        );
    }

    #[test]
    fn google_daily_quota_is_model_unavailable() {
        assert_eq!(
            classify_upstream_error(
                Service::GoogleAi,
                429,
                r#"{"error":{"message":"Quota exceeded for quota metric per day"}}"#
            ),
            ErrorClass::ModelUnavailable
        );
    }

    #[test]
    fn aws_model_not_ready_is_transient() {
        assert_eq!(
            classify_upstream_error(Service::Aws, 400, r#"{"__type":"ModelNotReadyException"}"#),
            ErrorClass::UpstreamTransient
        );
    }

    #[test]
    fn anthropic_content_filter_detected() {
        let class = classify_upstream_error(
            Service::Anthropic,
            400,
            r#"{"error":{"message":"Output blocked by content filtering policy"}}"#,
        );
        assert!(matches!(class, ErrorClass::ContentFiltered(_)));
    }

    #[test]
    fn org_ids_are_redacted() {
        let class = classify_upstream_error(
            Service::Openai,
            400,
            r#"{"error":{"message":"Organization org-abc123XYZ is not allowed"}}"#,
        );
        let ErrorClass::BadRequest(message) = class else {
            panic!("expected bad request");
        };
        assert!(message.contains("org-***"));
        assert!(!message.contains("abc123XYZ"));
    }

    #[test]
    fn moonshot_retry_note_matches_contract() {
        assert_eq!(
            rate_limit_note(Service::Moonshot),
            "Too many requests to the Moonshot API. Please try again later."
        );
    }

    #[test]
    fn qwen_backoff_caps_at_thirty_seconds() {
        assert!(retry_backoff(Service::Qwen, 10) <= Duration::from_secs(30));
        assert!(retry_backoff(Service::Qwen, 1) >= Duration::from_secs(2));
    }
}
