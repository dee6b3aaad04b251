use bytes::Bytes;
use serde_json::json;

use mproxy_pool::{Credential, FingerprintSet};
use mproxy_protocol::ApiFormat;
use mproxy_registry::{ModelFamily, Service};
use mproxy_transform::RequestBody;

use crate::change::ChangeManager;
use crate::tokens::TokenizerInfo;
use crate::upstream::ByteStream;

/// Which front-door operation the path selected; decides how the raw body
/// parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    ChatCompletions,
    Messages,
    Complete,
    Embeddings,
    ImageGenerations,
    GenerateContent,
}

/// What the router hands the engine: routing facts plus the raw body.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub trace_id: String,
    pub service: Service,
    pub inbound_format: ApiFormat,
    pub op: RouteOp,
    pub raw_body: Bytes,
    /// Model taken from the path for Google-style routes; bodies carry it
    /// everywhere else.
    pub model_from_path: Option<String>,
    /// `alt=sse` / `:streamGenerateContent` style streaming requested via the
    /// URL rather than the body.
    pub stream_from_path: bool,
    pub user_token: Option<String>,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// The pipeline's per-request state, created by stage A and carried through
/// dispatch and response handling. Must either complete or fail; there is no
/// third state.
pub struct RequestContext {
    pub trace_id: String,
    pub service: Service,
    pub inbound_format: ApiFormat,
    pub outbound_format: ApiFormat,
    pub model: String,
    pub family: ModelFamily,
    pub body: RequestBody,
    pub is_streaming: bool,
    pub prompt_tokens: u64,
    /// The client's claimed output budget, used for admission.
    pub output_tokens: u64,
    pub retry_count: u32,
    pub tokenizer: Option<TokenizerInfo>,
    pub fingerprints: Option<FingerprintSet>,
    pub user_token: Option<String>,
    pub credential: Option<Credential>,
    pub changes: ChangeManager,
    /// Extra beta identifiers the outbound mutators must send.
    pub anthropic_beta: Vec<String>,
}

/// The terminal shape handed back to the HTTP layer.
#[derive(Debug)]
pub enum ClientResponse {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        content_type: &'static str,
        body: ByteStream,
    },
}

/// A user-visible failure: status plus an OpenAI-style error object carrying
/// a `proxy_note` explaining what the proxy did.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request failed with status {status}")]
pub struct RequestError {
    pub status: u16,
    pub body: serde_json::Value,
}

impl RequestError {
    pub fn new(status: u16, kind: &str, message: impl Into<String>, proxy_note: &str) -> Self {
        let message = message.into();
        Self {
            status,
            body: json!({
                "error": { "type": kind, "message": message },
                "proxy_note": proxy_note,
            }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "invalid_request_error", message, "rejected before dispatch")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "authentication_error", message, "user token rejected")
    }

    pub fn quota(family: ModelFamily) -> Self {
        let mut err = Self::new(
            402,
            "insufficient_quota",
            "Token quota exceeded for this model family.",
            "quota admission refused the request",
        );
        err.body["family"] = json!(family.as_str());
        err
    }

    pub fn no_credentials(family: ModelFamily) -> Self {
        let mut err = Self::new(
            503,
            "service_unavailable",
            "No upstream credential can serve this model right now.",
            "credential pool exhausted",
        );
        err.body["family"] = json!(family.as_str());
        err
    }

    pub fn rate_limited(proxy_note: &str) -> Self {
        Self::new(429, "rate_limit_error", proxy_note.to_string(), proxy_note)
    }

    pub fn upstream(status: u16, message: impl Into<String>, proxy_note: &str) -> Self {
        Self::new(status, "upstream_error", message, proxy_note)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "proxy_error", message, "unexpected proxy failure")
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.body["model"] = json!(model);
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_names_family() {
        let err = RequestError::quota(ModelFamily::Claude);
        assert_eq!(err.status, 402);
        assert_eq!(err.body["family"], "claude");
        assert!(err.body["proxy_note"].is_string());
    }

    #[test]
    fn with_model_attaches_model() {
        let err = RequestError::bad_request("nope").with_model("gpt-4o");
        assert_eq!(err.body["model"], "gpt-4o");
    }
}
