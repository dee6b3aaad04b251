use serde::Serialize;

use crate::ModelFamily;

/// USD per million tokens. Image families carry a per-image price instead and
/// report zero here; the response handler prices them via `per_image_usd`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

pub fn price_of(family: ModelFamily) -> ModelPrice {
    let (input_per_million, output_per_million) = match family {
        ModelFamily::Turbo => (0.50, 1.50),
        ModelFamily::Gpt4 => (30.0, 60.0),
        ModelFamily::Gpt4Turbo => (10.0, 30.0),
        ModelFamily::Gpt4o => (2.50, 10.0),
        ModelFamily::O1 => (15.0, 60.0),
        ModelFamily::O1Mini => (1.10, 4.40),
        ModelFamily::O3 => (2.0, 8.0),
        ModelFamily::Gpt5 => (1.25, 10.0),
        ModelFamily::DallE | ModelFamily::GptImage => (0.0, 0.0),
        ModelFamily::Claude => (3.0, 15.0),
        ModelFamily::ClaudeOpus => (15.0, 75.0),
        ModelFamily::AwsClaude => (3.0, 15.0),
        ModelFamily::AwsClaudeOpus => (15.0, 75.0),
        ModelFamily::AwsMistral => (4.0, 12.0),
        ModelFamily::GcpClaude => (3.0, 15.0),
        ModelFamily::GcpClaudeOpus => (15.0, 75.0),
        ModelFamily::GeminiFlash => (0.30, 2.50),
        ModelFamily::GeminiPro => (1.25, 10.0),
        ModelFamily::MistralTiny => (0.25, 0.25),
        ModelFamily::MistralSmall => (0.10, 0.30),
        ModelFamily::MistralMedium => (0.40, 2.0),
        ModelFamily::MistralLarge => (2.0, 6.0),
        ModelFamily::Openrouter => (5.0, 15.0),
        ModelFamily::Moonshot => (0.60, 2.50),
        ModelFamily::Qwen => (0.40, 1.20),
        ModelFamily::Glm => (0.60, 2.20),
        ModelFamily::Command => (2.50, 10.0),
        ModelFamily::AzureGpt => (2.50, 10.0),
        ModelFamily::AzureDalle | ModelFamily::AzureGptImage => (0.0, 0.0),
    };
    ModelPrice {
        input_per_million,
        output_per_million,
    }
}

/// Flat per-image price used by the response handler for image families.
pub fn per_image_usd(family: ModelFamily) -> Option<f64> {
    match family {
        ModelFamily::DallE | ModelFamily::AzureDalle => Some(0.04),
        ModelFamily::GptImage | ModelFamily::AzureGptImage => Some(0.08),
        _ => None,
    }
}
