use serde::{Deserialize, Serialize};

/// Upstream provider identity. This is a closed set; adding a provider means
/// extending the classification tables and the outbound mutators together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    Openai,
    Anthropic,
    Aws,
    Gcp,
    GoogleAi,
    MistralAi,
    Openrouter,
    Moonshot,
    Qwen,
    Glm,
    Cohere,
    Azure,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Openai => "openai",
            Service::Anthropic => "anthropic",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::GoogleAi => "google-ai",
            Service::MistralAi => "mistral-ai",
            Service::Openrouter => "openrouter",
            Service::Moonshot => "moonshot",
            Service::Qwen => "qwen",
            Service::Glm => "glm",
            Service::Cohere => "cohere",
            Service::Azure => "azure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(Service::Openai),
            "anthropic" => Some(Service::Anthropic),
            "aws" => Some(Service::Aws),
            "gcp" => Some(Service::Gcp),
            "google-ai" => Some(Service::GoogleAi),
            "mistral-ai" => Some(Service::MistralAi),
            "openrouter" => Some(Service::Openrouter),
            "moonshot" => Some(Service::Moonshot),
            "qwen" => Some(Service::Qwen),
            "glm" => Some(Service::Glm),
            "cohere" => Some(Service::Cohere),
            "azure" => Some(Service::Azure),
            _ => None,
        }
    }

    pub fn all() -> &'static [Service] {
        &[
            Service::Openai,
            Service::Anthropic,
            Service::Aws,
            Service::Gcp,
            Service::GoogleAi,
            Service::MistralAi,
            Service::Openrouter,
            Service::Moonshot,
            Service::Qwen,
            Service::Glm,
            Service::Cohere,
            Service::Azure,
        ]
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
