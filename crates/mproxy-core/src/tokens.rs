use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use mproxy_registry::{ModelFamily, Service};
use mproxy_transform::RequestBody;
use tokenizers::Tokenizer;

/// Flat surcharge per image part in a prompt. Providers bill vision inputs in
/// tiles; a fixed low-detail figure keeps admission predictable.
const PROMPT_IMAGE_TOKENS: u64 = 85;

#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    pub name: &'static str,
    pub native: bool,
}

/// Local prompt-token counting. Provider-native counting endpoints are
/// preferred by the pipeline when a key is obtainable; everything here is the
/// fallback path and must never fail a request.
pub struct TokenCounter {
    data_dir: PathBuf,
    mistral: Mutex<Option<Arc<Tokenizer>>>,
}

impl TokenCounter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mistral: Mutex::new(None),
        }
    }

    pub fn count_prompt(&self, service: Service, family: ModelFamily, body: &RequestBody) -> (u64, TokenizerInfo) {
        let text = body.prompt_text();
        let image_tokens = body.prompt_image_count() as u64 * PROMPT_IMAGE_TOKENS;
        let (text_tokens, info) = self.count_text(service, family, &text);
        (text_tokens.saturating_add(image_tokens), info)
    }

    pub fn count_text(
        &self,
        service: Service,
        family: ModelFamily,
        text: &str,
    ) -> (u64, TokenizerInfo) {
        match service {
            Service::Openai | Service::Azure | Service::Openrouter | Service::Moonshot
            | Service::Qwen | Service::Glm | Service::Cohere => (
                bpe_count(family, text),
                TokenizerInfo {
                    name: "tiktoken",
                    native: false,
                },
            ),
            Service::Anthropic | Service::Aws | Service::Gcp => (
                // No public Claude tokenizer; cl100k over-counts Claude by a
                // few percent, which errs on the safe side for admission.
                bpe_count(ModelFamily::Gpt4, text),
                TokenizerInfo {
                    name: "tiktoken-approx",
                    native: false,
                },
            ),
            Service::GoogleAi => (
                heuristic_count(text),
                TokenizerInfo {
                    name: "heuristic",
                    native: false,
                },
            ),
            Service::MistralAi => match self.mistral_tokenizer() {
                Some(tokenizer) => {
                    let count = tokenizer
                        .encode(text, false)
                        .map(|encoding| encoding.get_ids().len() as u64)
                        .unwrap_or_else(|_| heuristic_count(text));
                    (
                        count,
                        TokenizerInfo {
                            name: "mistral",
                            native: false,
                        },
                    )
                }
                None => (
                    heuristic_count(text),
                    TokenizerInfo {
                        name: "heuristic",
                        native: false,
                    },
                ),
            },
        }
    }

    /// Loads `<data_dir>/tokenizers/mistral/tokenizer.json` once; absence is
    /// not an error, the heuristic covers it.
    fn mistral_tokenizer(&self) -> Option<Arc<Tokenizer>> {
        let mut guard = self.mistral.lock().ok()?;
        if let Some(tokenizer) = guard.as_ref() {
            return Some(tokenizer.clone());
        }
        let path = self
            .data_dir
            .join("tokenizers")
            .join("mistral")
            .join("tokenizer.json");
        let bytes = std::fs::read(&path).ok()?;
        let tokenizer = Tokenizer::from_bytes(bytes.as_slice()).ok()?;
        let tokenizer = Arc::new(tokenizer);
        *guard = Some(tokenizer.clone());
        Some(tokenizer)
    }
}

fn bpe_count(family: ModelFamily, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let bpe = match family {
        ModelFamily::Turbo | ModelFamily::Gpt4 | ModelFamily::Gpt4Turbo => cl100k(),
        _ => o200k(),
    };
    match bpe {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => heuristic_count(text),
    }
}

fn heuristic_count(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn cl100k() -> Option<&'static tiktoken_rs::CoreBPE> {
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

fn o200k() -> Option<&'static tiktoken_rs::CoreBPE> {
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::chat::{
        ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, ImageUrl, MessageContent,
    };

    fn counter() -> TokenCounter {
        TokenCounter::new("./does-not-exist")
    }

    #[test]
    fn empty_text_counts_zero() {
        let (count, _) = counter().count_text(Service::Openai, ModelFamily::Gpt4o, "");
        assert_eq!(count, 0);
    }

    #[test]
    fn counting_is_monotone_in_text_length() {
        let c = counter();
        let (short, _) = c.count_text(Service::Openai, ModelFamily::Gpt4o, "hello");
        let (long, _) = c.count_text(
            Service::Openai,
            ModelFamily::Gpt4o,
            "hello hello hello hello hello hello",
        );
        assert!(long > short);
        assert!(short >= 1);
    }

    #[test]
    fn images_add_a_fixed_surcharge() {
        let c = counter();
        let body = RequestBody::Openai(ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "describe".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "https://example.com/cat.png".to_string(),
                            detail: None,
                        },
                    },
                ]),
                name: None,
                tool_calls: None,
                tool_call_id: None,
                extra: serde_json::Map::new(),
            }],
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            n: None,
            stop: None,
            stream: None,
            stream_options: None,
            user: None,
            tools: None,
            tool_choice: None,
            logit_bias: None,
            extra: serde_json::Map::new(),
        });
        let (with_image, _) = c.count_prompt(Service::Openai, ModelFamily::Gpt4o, &body);
        let (text_only, _) = c.count_text(Service::Openai, ModelFamily::Gpt4o, "describe");
        assert_eq!(with_image, text_only + PROMPT_IMAGE_TOKENS);
    }

    #[test]
    fn missing_mistral_tokenizer_falls_back_to_heuristic() {
        let (count, info) = counter().count_text(
            Service::MistralAi,
            ModelFamily::MistralSmall,
            "bonjour le monde",
        );
        assert_eq!(info.name, "heuristic");
        assert_eq!(count, heuristic_count("bonjour le monde"));
    }
}
