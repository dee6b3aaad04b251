use serde_json::Value;

use mproxy_protocol::ApiFormat;
use mproxy_protocol::anthropic::chat::MessagesRequest;
use mproxy_protocol::anthropic::text::CompleteRequest;
use mproxy_protocol::google::GenerateContentRequest;
use mproxy_protocol::mistral::ChatRequest as MistralChatRequest;
use mproxy_protocol::openai::chat::ChatCompletionRequest;
use mproxy_protocol::openai::embeddings::EmbeddingsRequest;
use mproxy_protocol::openai::images::ImageGenerationRequest;
use mproxy_protocol::openai::responses::ResponsesRequest;

/// A validated request body in one concrete dialect. Parsed once at the
/// boundary; every later mutation works on this AST and serialization happens
/// exactly once at finalize time.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Openai(ChatCompletionRequest),
    OpenaiResponses(ResponsesRequest),
    OpenaiImage(ImageGenerationRequest),
    Embeddings(EmbeddingsRequest),
    AnthropicChat(MessagesRequest),
    AnthropicText(CompleteRequest),
    GoogleAi(GenerateContentRequest),
    MistralAi(MistralChatRequest),
}

impl RequestBody {
    pub fn format(&self) -> ApiFormat {
        match self {
            RequestBody::Openai(_) | RequestBody::Embeddings(_) => ApiFormat::Openai,
            RequestBody::OpenaiResponses(_) => ApiFormat::OpenaiResponses,
            RequestBody::OpenaiImage(_) => ApiFormat::OpenaiImage,
            RequestBody::AnthropicChat(_) => ApiFormat::AnthropicChat,
            RequestBody::AnthropicText(_) => ApiFormat::AnthropicText,
            RequestBody::GoogleAi(_) => ApiFormat::GoogleAi,
            RequestBody::MistralAi(_) => ApiFormat::MistralAi,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RequestBody::Openai(body) => body.is_stream(),
            RequestBody::OpenaiResponses(body) => body.stream.unwrap_or(false),
            RequestBody::OpenaiImage(_) | RequestBody::Embeddings(_) => false,
            RequestBody::AnthropicChat(body) => body.is_stream(),
            RequestBody::AnthropicText(body) => body.is_stream(),
            RequestBody::GoogleAi(_) => false,
            RequestBody::MistralAi(body) => body.is_stream(),
        }
    }

    pub fn set_stream(&mut self, stream: bool) {
        match self {
            RequestBody::Openai(body) => body.stream = Some(stream),
            RequestBody::OpenaiResponses(body) => body.stream = Some(stream),
            RequestBody::AnthropicChat(body) => body.stream = Some(stream),
            RequestBody::AnthropicText(body) => body.stream = Some(stream),
            RequestBody::MistralAi(body) => body.stream = Some(stream),
            RequestBody::OpenaiImage(_)
            | RequestBody::Embeddings(_)
            | RequestBody::GoogleAi(_) => {}
        }
    }

    /// The output budget the client claimed, used for quota admission.
    pub fn claimed_output_tokens(&self) -> u64 {
        match self {
            RequestBody::Openai(body) => u64::from(body.max_output_tokens().unwrap_or(16)),
            RequestBody::OpenaiResponses(body) => u64::from(body.max_output_tokens.unwrap_or(16)),
            RequestBody::OpenaiImage(_) | RequestBody::Embeddings(_) => 0,
            RequestBody::AnthropicChat(body) => u64::from(body.max_tokens),
            RequestBody::AnthropicText(body) => u64::from(body.max_tokens_to_sample),
            RequestBody::GoogleAi(body) => u64::from(
                body.generation_config
                    .as_ref()
                    .and_then(|config| config.max_output_tokens)
                    .unwrap_or(1024),
            ),
            RequestBody::MistralAi(body) => u64::from(body.max_tokens.unwrap_or(1024)),
        }
    }

    /// Flattened prompt text fed to the local tokenizer fallback.
    pub fn prompt_text(&self) -> String {
        match self {
            RequestBody::Openai(body) => body
                .messages
                .iter()
                .map(|message| message.content.flat_text())
                .collect::<Vec<String>>()
                .join("\n"),
            RequestBody::OpenaiResponses(body) => match &body.input {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
            RequestBody::OpenaiImage(body) => body.prompt.clone(),
            RequestBody::Embeddings(body) => body.input.flat_text(),
            RequestBody::AnthropicChat(body) => {
                let mut out: Vec<String> = body
                    .system_blocks()
                    .into_iter()
                    .map(|block| block.text)
                    .collect();
                out.extend(
                    body.messages
                        .iter()
                        .map(|message| message.content.flat_text()),
                );
                out.join("\n")
            }
            RequestBody::AnthropicText(body) => body.prompt.clone(),
            RequestBody::GoogleAi(body) => {
                let mut out: Vec<String> = Vec::new();
                if let Some(system) = &body.system_instruction {
                    out.push(system.flat_text());
                }
                out.extend(body.contents.iter().map(|content| content.flat_text()));
                out.join("\n")
            }
            RequestBody::MistralAi(body) => body
                .messages
                .iter()
                .map(|message| message.content.clone())
                .collect::<Vec<String>>()
                .join("\n"),
        }
    }

    /// Number of image parts in the prompt, for the fixed per-image token
    /// surcharge.
    pub fn prompt_image_count(&self) -> usize {
        match self {
            RequestBody::Openai(body) => body
                .messages
                .iter()
                .map(|message| message.content.image_count())
                .sum(),
            RequestBody::AnthropicChat(body) => body
                .messages
                .iter()
                .flat_map(|message| message.content.blocks())
                .filter(|block| {
                    matches!(
                        block,
                        mproxy_protocol::anthropic::chat::ContentBlock::Image { .. }
                    )
                })
                .count(),
            _ => 0,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            RequestBody::Openai(body) => serde_json::to_vec(body),
            RequestBody::OpenaiResponses(body) => serde_json::to_vec(body),
            RequestBody::OpenaiImage(body) => serde_json::to_vec(body),
            RequestBody::Embeddings(body) => serde_json::to_vec(body),
            RequestBody::AnthropicChat(body) => serde_json::to_vec(body),
            RequestBody::AnthropicText(body) => serde_json::to_vec(body),
            RequestBody::GoogleAi(body) => serde_json::to_vec(body),
            RequestBody::MistralAi(body) => serde_json::to_vec(body),
        }
    }
}

/// A parsed upstream response in its outbound dialect, before shaping back to
/// the client's inbound dialect.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Openai(mproxy_protocol::openai::chat::ChatCompletionResponse),
    OpenaiResponses(mproxy_protocol::openai::responses::ResponsesResponse),
    OpenaiImage(mproxy_protocol::openai::images::ImageGenerationResponse),
    Embeddings(Value),
    AnthropicChat(mproxy_protocol::anthropic::chat::MessagesResponse),
    AnthropicText(mproxy_protocol::anthropic::text::CompleteResponse),
    GoogleAi(mproxy_protocol::google::GenerateContentResponse),
    MistralAi(mproxy_protocol::mistral::ChatResponse),
}

impl ResponseBody {
    /// User-visible content concatenation; the quantity preserved by
    /// response-shaping round trips.
    pub fn flat_text(&self) -> String {
        match self {
            ResponseBody::Openai(body) => body
                .choices
                .iter()
                .filter_map(|choice| choice.message.content.as_deref())
                .collect::<Vec<&str>>()
                .concat(),
            ResponseBody::OpenaiResponses(body) => body.flat_text(),
            ResponseBody::OpenaiImage(_) | ResponseBody::Embeddings(_) => String::new(),
            ResponseBody::AnthropicChat(body) => body.flat_text(),
            ResponseBody::AnthropicText(body) => body.completion.clone(),
            ResponseBody::GoogleAi(body) => body.flat_text(),
            ResponseBody::MistralAi(body) => body
                .choices
                .iter()
                .map(|choice| choice.message.content.as_str())
                .collect::<Vec<&str>>()
                .concat(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            ResponseBody::Openai(body) => serde_json::to_vec(body),
            ResponseBody::OpenaiResponses(body) => serde_json::to_vec(body),
            ResponseBody::OpenaiImage(body) => serde_json::to_vec(body),
            ResponseBody::Embeddings(body) => serde_json::to_vec(body),
            ResponseBody::AnthropicChat(body) => serde_json::to_vec(body),
            ResponseBody::AnthropicText(body) => serde_json::to_vec(body),
            ResponseBody::GoogleAi(body) => serde_json::to_vec(body),
            ResponseBody::MistralAi(body) => serde_json::to_vec(body),
        }
    }
}
