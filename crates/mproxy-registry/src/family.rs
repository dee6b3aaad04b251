use serde::{Deserialize, Serialize};

use crate::Service;

/// Coarse partition of models by cost/capability tier. The family is the unit
/// of queueing, quota accounting and pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    // OpenAI
    Turbo,
    Gpt4,
    Gpt4Turbo,
    Gpt4o,
    O1,
    O1Mini,
    O3,
    Gpt5,
    DallE,
    GptImage,
    // Anthropic
    Claude,
    ClaudeOpus,
    // AWS Bedrock
    AwsClaude,
    AwsClaudeOpus,
    AwsMistral,
    // GCP Vertex
    GcpClaude,
    GcpClaudeOpus,
    // Google AI Studio
    GeminiFlash,
    GeminiPro,
    // Mistral
    MistralTiny,
    MistralSmall,
    MistralMedium,
    MistralLarge,
    // Single-family services
    Openrouter,
    Moonshot,
    Qwen,
    Glm,
    Command,
    // Azure OpenAI
    AzureGpt,
    AzureDalle,
    AzureGptImage,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::O1 => "o1",
            ModelFamily::O1Mini => "o1-mini",
            ModelFamily::O3 => "o3",
            ModelFamily::Gpt5 => "gpt5",
            ModelFamily::DallE => "dall-e",
            ModelFamily::GptImage => "gpt-image",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::AwsClaudeOpus => "aws-claude-opus",
            ModelFamily::AwsMistral => "aws-mistral",
            ModelFamily::GcpClaude => "gcp-claude",
            ModelFamily::GcpClaudeOpus => "gcp-claude-opus",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
            ModelFamily::MistralTiny => "mistral-tiny",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralMedium => "mistral-medium",
            ModelFamily::MistralLarge => "mistral-large",
            ModelFamily::Openrouter => "openrouter",
            ModelFamily::Moonshot => "moonshot",
            ModelFamily::Qwen => "qwen",
            ModelFamily::Glm => "glm",
            ModelFamily::Command => "command",
            ModelFamily::AzureGpt => "azure-gpt",
            ModelFamily::AzureDalle => "azure-dall-e",
            ModelFamily::AzureGptImage => "azure-gpt-image",
        }
    }

    /// Families whose responses are priced per generated image rather than per
    /// output token.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            ModelFamily::DallE
                | ModelFamily::GptImage
                | ModelFamily::AzureDalle
                | ModelFamily::AzureGptImage
        )
    }

    /// Families that cannot serve SSE streams.
    pub fn supports_streaming(&self) -> bool {
        !self.is_image()
    }

    pub fn service(&self) -> Service {
        match self {
            ModelFamily::Turbo
            | ModelFamily::Gpt4
            | ModelFamily::Gpt4Turbo
            | ModelFamily::Gpt4o
            | ModelFamily::O1
            | ModelFamily::O1Mini
            | ModelFamily::O3
            | ModelFamily::Gpt5
            | ModelFamily::DallE
            | ModelFamily::GptImage => Service::Openai,
            ModelFamily::Claude | ModelFamily::ClaudeOpus => Service::Anthropic,
            ModelFamily::AwsClaude | ModelFamily::AwsClaudeOpus | ModelFamily::AwsMistral => {
                Service::Aws
            }
            ModelFamily::GcpClaude | ModelFamily::GcpClaudeOpus => Service::Gcp,
            ModelFamily::GeminiFlash | ModelFamily::GeminiPro => Service::GoogleAi,
            ModelFamily::MistralTiny
            | ModelFamily::MistralSmall
            | ModelFamily::MistralMedium
            | ModelFamily::MistralLarge => Service::MistralAi,
            ModelFamily::Openrouter => Service::Openrouter,
            ModelFamily::Moonshot => Service::Moonshot,
            ModelFamily::Qwen => Service::Qwen,
            ModelFamily::Glm => Service::Glm,
            ModelFamily::Command => Service::Cohere,
            ModelFamily::AzureGpt | ModelFamily::AzureDalle | ModelFamily::AzureGptImage => {
                Service::Azure
            }
        }
    }

    pub fn all() -> &'static [ModelFamily] {
        &[
            ModelFamily::Turbo,
            ModelFamily::Gpt4,
            ModelFamily::Gpt4Turbo,
            ModelFamily::Gpt4o,
            ModelFamily::O1,
            ModelFamily::O1Mini,
            ModelFamily::O3,
            ModelFamily::Gpt5,
            ModelFamily::DallE,
            ModelFamily::GptImage,
            ModelFamily::Claude,
            ModelFamily::ClaudeOpus,
            ModelFamily::AwsClaude,
            ModelFamily::AwsClaudeOpus,
            ModelFamily::AwsMistral,
            ModelFamily::GcpClaude,
            ModelFamily::GcpClaudeOpus,
            ModelFamily::GeminiFlash,
            ModelFamily::GeminiPro,
            ModelFamily::MistralTiny,
            ModelFamily::MistralSmall,
            ModelFamily::MistralMedium,
            ModelFamily::MistralLarge,
            ModelFamily::Openrouter,
            ModelFamily::Moonshot,
            ModelFamily::Qwen,
            ModelFamily::Glm,
            ModelFamily::Command,
            ModelFamily::AzureGpt,
            ModelFamily::AzureDalle,
            ModelFamily::AzureGptImage,
        ]
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical model ids advertised on `GET /v1/models` for a family. The
/// upstream accepts more; these are the ids clients are expected to send.
pub fn sample_models(family: ModelFamily) -> &'static [&'static str] {
    match family {
        ModelFamily::Turbo => &["gpt-3.5-turbo", "gpt-3.5-turbo-0125"],
        ModelFamily::Gpt4 => &["gpt-4", "gpt-4-0613"],
        ModelFamily::Gpt4Turbo => &["gpt-4-turbo", "gpt-4-turbo-2024-04-09"],
        ModelFamily::Gpt4o => &["gpt-4o", "gpt-4o-mini", "chatgpt-4o-latest"],
        ModelFamily::O1 => &["o1", "o1-preview"],
        ModelFamily::O1Mini => &["o1-mini"],
        ModelFamily::O3 => &["o3", "o3-mini"],
        ModelFamily::Gpt5 => &["gpt-5", "gpt-5-mini", "gpt-5-pro"],
        ModelFamily::DallE => &["dall-e-3"],
        ModelFamily::GptImage => &["gpt-image-1"],
        ModelFamily::Claude => &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-sonnet-4-20250514",
        ],
        ModelFamily::ClaudeOpus => &["claude-3-opus-20240229", "claude-opus-4-1-20250805"],
        ModelFamily::AwsClaude => &[
            "anthropic.claude-3-sonnet-20240229-v1:0",
            "anthropic.claude-sonnet-4-20250514-v1:0",
        ],
        ModelFamily::AwsClaudeOpus => &["anthropic.claude-opus-4-20250514-v1:0"],
        ModelFamily::AwsMistral => &["mistral.mistral-large-2402-v1:0"],
        ModelFamily::GcpClaude => &["claude-3-5-sonnet@20240620"],
        ModelFamily::GcpClaudeOpus => &["claude-3-opus@20240229"],
        ModelFamily::GeminiFlash => &["gemini-2.5-flash", "gemini-2.0-flash"],
        ModelFamily::GeminiPro => &["gemini-2.5-pro"],
        ModelFamily::MistralTiny => &["open-mistral-7b", "open-mistral-nemo"],
        ModelFamily::MistralSmall => &["mistral-small-latest", "codestral-latest"],
        ModelFamily::MistralMedium => &["mistral-medium-latest"],
        ModelFamily::MistralLarge => &["mistral-large-latest"],
        ModelFamily::Openrouter => &["openrouter/auto"],
        ModelFamily::Moonshot => &["moonshot-v1-8k", "kimi-k2-0711-preview"],
        ModelFamily::Qwen => &["qwen-max", "qwen-plus"],
        ModelFamily::Glm => &["glm-4-plus", "glm-4-flash"],
        ModelFamily::Command => &["command-r-plus", "command-a-03-2025"],
        ModelFamily::AzureGpt => &["gpt-4o"],
        ModelFamily::AzureDalle => &["dall-e-3"],
        ModelFamily::AzureGptImage => &["gpt-image-1"],
    }
}
