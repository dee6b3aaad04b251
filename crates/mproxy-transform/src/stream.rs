use mproxy_protocol::ApiFormat;
use mproxy_protocol::anthropic::stream::{ContentDelta, KnownStreamEvent, StreamEvent};
use mproxy_protocol::openai::chat::ChatCompletionChunk;
use mproxy_protocol::sse::SseFrame;

use crate::usage::UsageSummary;

/// The synthetic blocking view of a finished stream: content is the
/// concatenation of deltas, finish reason is the last one observed, usage is
/// whatever the final events carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedStream {
    pub id: Option<String>,
    pub model: Option<String>,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: UsageSummary,
    pub event_count: u64,
}

/// Tees a stream's parsed SSE events into an aggregate so downstream
/// middleware can treat streamed and blocking responses uniformly. The raw
/// bytes still go to the client verbatim; this never writes to the client.
#[derive(Debug)]
pub struct StreamAggregator {
    format: ApiFormat,
    aggregate: AggregatedStream,
}

impl StreamAggregator {
    pub fn new(format: ApiFormat) -> Self {
        Self {
            format,
            aggregate: AggregatedStream::default(),
        }
    }

    pub fn push_frame(&mut self, frame: &SseFrame) {
        if frame.data.is_empty() || frame.data == "[DONE]" {
            return;
        }
        self.aggregate.event_count += 1;
        match self.format {
            ApiFormat::Openai | ApiFormat::MistralAi => self.push_openai(&frame.data),
            ApiFormat::AnthropicChat => self.push_anthropic(&frame.data),
            ApiFormat::AnthropicText => self.push_anthropic_text(&frame.data),
            ApiFormat::GoogleAi => self.push_google(&frame.data),
            ApiFormat::OpenaiResponses => self.push_openai_responses(&frame.data),
            ApiFormat::OpenaiImage => {}
        }
    }

    pub fn finish(self) -> AggregatedStream {
        self.aggregate
    }

    fn push_openai(&mut self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            return;
        };
        if self.aggregate.id.is_none() {
            self.aggregate.id = Some(chunk.id.clone());
        }
        if self.aggregate.model.is_none() && !chunk.model.is_empty() {
            self.aggregate.model = Some(chunk.model.clone());
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.aggregate.content.push_str(content);
            }
            if let Some(reason) = &choice.finish_reason {
                self.aggregate.finish_reason = Some(reason.clone());
            }
        }
        if let Some(usage) = &chunk.usage {
            self.aggregate.usage.merge(UsageSummary {
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
            });
        }
    }

    fn push_anthropic(&mut self, data: &str) {
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
            return;
        };
        let StreamEvent::Known(known) = event else {
            return;
        };
        match known {
            KnownStreamEvent::MessageStart { message } => {
                self.aggregate.id = Some(message.id);
                self.aggregate.model = Some(message.model);
                self.aggregate.usage.merge(UsageSummary {
                    input_tokens: Some(message.usage.input_tokens),
                    output_tokens: Some(message.usage.output_tokens),
                    cache_read_input_tokens: message.usage.cache_read_input_tokens,
                    cache_creation_input_tokens: message.usage.cache_creation_input_tokens,
                    reasoning_tokens: None,
                });
            }
            KnownStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::TextDelta { text } => self.aggregate.content.push_str(&text),
                ContentDelta::InputJsonDelta { partial_json } => {
                    self.aggregate.content.push_str(&partial_json)
                }
                ContentDelta::ThinkingDelta { .. } | ContentDelta::SignatureDelta { .. } => {}
            },
            KnownStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.aggregate.finish_reason = Some(reason);
                }
                self.aggregate.usage.merge(UsageSummary {
                    input_tokens: (usage.input_tokens > 0).then_some(usage.input_tokens),
                    output_tokens: Some(usage.output_tokens),
                    cache_read_input_tokens: usage.cache_read_input_tokens,
                    cache_creation_input_tokens: usage.cache_creation_input_tokens,
                    reasoning_tokens: None,
                });
            }
            _ => {}
        }
    }

    fn push_anthropic_text(&mut self, data: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        if let Some(completion) = value["completion"].as_str() {
            self.aggregate.content.push_str(completion);
        }
        if let Some(reason) = value["stop_reason"].as_str() {
            self.aggregate.finish_reason = Some(reason.to_string());
        }
    }

    fn push_google(&mut self, data: &str) {
        let Ok(response) =
            serde_json::from_str::<mproxy_protocol::google::GenerateContentResponse>(data)
        else {
            return;
        };
        self.aggregate.content.push_str(&response.flat_text());
        if let Some(candidate) = response.candidates.first()
            && let Some(reason) = &candidate.finish_reason
        {
            self.aggregate.finish_reason = Some(reason.clone());
        }
        if let Some(usage) = &response.usage_metadata {
            self.aggregate.usage.merge(UsageSummary {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                cache_read_input_tokens: usage.cached_content_token_count,
                cache_creation_input_tokens: None,
                reasoning_tokens: None,
            });
        }
    }

    fn push_openai_responses(&mut self, data: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        match value["type"].as_str() {
            Some("response.output_text.delta") => {
                if let Some(delta) = value["delta"].as_str() {
                    self.aggregate.content.push_str(delta);
                }
            }
            Some("response.completed") | Some("response.incomplete") => {
                let response = &value["response"];
                if let Some(id) = response["id"].as_str() {
                    self.aggregate.id = Some(id.to_string());
                }
                if let Some(model) = response["model"].as_str() {
                    self.aggregate.model = Some(model.to_string());
                }
                self.aggregate.finish_reason = Some(
                    if value["type"].as_str() == Some("response.incomplete") {
                        "length".to_string()
                    } else {
                        "stop".to_string()
                    },
                );
                let usage = &response["usage"];
                self.aggregate.usage.merge(UsageSummary {
                    input_tokens: usage["input_tokens"].as_u64(),
                    output_tokens: usage["output_tokens"].as_u64(),
                    cache_read_input_tokens: None,
                    cache_creation_input_tokens: None,
                    reasoning_tokens: None,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(payload: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: payload.to_string(),
        }
    }

    #[test]
    fn openai_chunks_concatenate_and_carry_usage() {
        let mut aggregator = StreamAggregator::new(ApiFormat::Openai);
        let chunks = [
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"A"},"finish_reason":null}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"B"},"finish_reason":null}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"C"},"finish_reason":"stop"}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
        ];
        for chunk in chunks {
            aggregator.push_frame(&data(chunk));
        }
        aggregator.push_frame(&data("[DONE]"));
        let aggregate = aggregator.finish();
        assert_eq!(aggregate.content, "ABC");
        assert_eq!(aggregate.finish_reason.as_deref(), Some("stop"));
        assert_eq!(aggregate.usage.input_tokens, Some(7));
        assert_eq!(aggregate.usage.output_tokens, Some(3));
    }

    #[test]
    fn anthropic_events_aggregate() {
        let mut aggregator = StreamAggregator::new(ApiFormat::AnthropicChat);
        let events = [
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":9,"output_tokens":0}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":0,"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        for event in events {
            aggregator.push_frame(&data(event));
        }
        let aggregate = aggregator.finish();
        assert_eq!(aggregate.content, "Hello");
        assert_eq!(aggregate.id.as_deref(), Some("msg_1"));
        assert_eq!(aggregate.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(aggregate.usage.input_tokens, Some(9));
        assert_eq!(aggregate.usage.output_tokens, Some(2));
    }

    #[test]
    fn unknown_payloads_are_ignored() {
        let mut aggregator = StreamAggregator::new(ApiFormat::Openai);
        aggregator.push_frame(&data("not json"));
        let aggregate = aggregator.finish();
        assert!(aggregate.content.is_empty());
        assert!(aggregate.usage.is_empty());
    }
}
