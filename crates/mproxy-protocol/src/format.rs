use serde::{Deserialize, Serialize};

/// Wire dialect of a request or response body. A client speaks the inbound
/// format; the upstream provider speaks the outbound format; when they differ
/// a transform bridges them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiFormat {
    Openai,
    OpenaiResponses,
    OpenaiImage,
    AnthropicChat,
    AnthropicText,
    GoogleAi,
    MistralAi,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::Openai => "openai",
            ApiFormat::OpenaiResponses => "openai-responses",
            ApiFormat::OpenaiImage => "openai-image",
            ApiFormat::AnthropicChat => "anthropic-chat",
            ApiFormat::AnthropicText => "anthropic-text",
            ApiFormat::GoogleAi => "google-ai",
            ApiFormat::MistralAi => "mistral-ai",
        }
    }

    /// Whether the dialect has an SSE stream shape at all.
    pub fn supports_streaming(&self) -> bool {
        !matches!(self, ApiFormat::OpenaiImage)
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
