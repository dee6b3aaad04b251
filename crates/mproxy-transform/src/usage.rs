use serde::{Deserialize, Serialize};

use crate::body::ResponseBody;

/// Token usage as reported by (or reconstructed for) one upstream call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    /// Reasoning tokens bill as output on providers that report them.
    pub reasoning_tokens: Option<u64>,
}

impl UsageSummary {
    pub fn merge(&mut self, incoming: UsageSummary) {
        if incoming.input_tokens.is_some() {
            self.input_tokens = incoming.input_tokens;
        }
        if incoming.output_tokens.is_some() {
            self.output_tokens = incoming.output_tokens;
        }
        if incoming.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = incoming.cache_read_input_tokens;
        }
        if incoming.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = incoming.cache_creation_input_tokens;
        }
        if incoming.reasoning_tokens.is_some() {
            self.reasoning_tokens = incoming.reasoning_tokens;
        }
    }

    pub fn billable_output(&self) -> Option<u64> {
        let output = self.output_tokens?;
        Some(output.saturating_add(self.reasoning_tokens.unwrap_or(0)))
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }

    /// Cache metrics present at all (used by the Anthropic-family sanity
    /// check after a cached request).
    pub fn saw_cache_activity(&self) -> bool {
        self.cache_read_input_tokens.unwrap_or(0) > 0
            || self.cache_creation_input_tokens.unwrap_or(0) > 0
    }
}

/// Authoritative usage extracted from a blocking response, when the provider
/// reports one.
pub fn usage_from_response(body: &ResponseBody) -> Option<UsageSummary> {
    match body {
        ResponseBody::Openai(response) => response.usage.as_ref().map(|usage| UsageSummary {
            input_tokens: Some(usage.prompt_tokens),
            output_tokens: Some(usage.completion_tokens),
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|details| details.cached_tokens),
            cache_creation_input_tokens: None,
            reasoning_tokens: usage
                .completion_tokens_details
                .as_ref()
                .and_then(|details| details.reasoning_tokens),
        }),
        ResponseBody::OpenaiResponses(response) => {
            response.usage.as_ref().map(|usage| UsageSummary {
                input_tokens: Some(usage.input_tokens),
                output_tokens: Some(usage.output_tokens),
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
                reasoning_tokens: None,
            })
        }
        ResponseBody::AnthropicChat(response) => Some(UsageSummary {
            input_tokens: Some(response.usage.input_tokens),
            output_tokens: Some(response.usage.output_tokens),
            cache_read_input_tokens: response.usage.cache_read_input_tokens,
            cache_creation_input_tokens: response.usage.cache_creation_input_tokens,
            reasoning_tokens: None,
        }),
        ResponseBody::GoogleAi(response) => {
            response.usage_metadata.as_ref().map(|usage| UsageSummary {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                cache_read_input_tokens: usage.cached_content_token_count,
                cache_creation_input_tokens: None,
                reasoning_tokens: None,
            })
        }
        ResponseBody::MistralAi(response) => response.usage.as_ref().map(|usage| UsageSummary {
            input_tokens: Some(usage.prompt_tokens),
            output_tokens: Some(usage.completion_tokens),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            reasoning_tokens: None,
        }),
        ResponseBody::AnthropicText(_)
        | ResponseBody::OpenaiImage(_)
        | ResponseBody::Embeddings(_) => None,
    }
}
