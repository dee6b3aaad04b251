use mproxy_protocol::anthropic::chat::MessagesResponse;
use mproxy_protocol::openai::chat::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionUsage,
};

/// Anthropic messages response → OpenAI chat completion. Content parts are
/// flattened, `stop_reason` carries through as the finish reason, and the id
/// keeps its upstream value under an `ant-` prefix.
pub fn shape_response(response: MessagesResponse, created: i64) -> ChatCompletionResponse {
    let content = response.flat_text();
    let usage = CompletionUsage {
        prompt_tokens: response.usage.input_tokens,
        completion_tokens: response.usage.output_tokens,
        total_tokens: response
            .usage
            .input_tokens
            .saturating_add(response.usage.output_tokens),
        prompt_tokens_details: None,
        completion_tokens_details: None,
    };

    ChatCompletionResponse {
        id: format!("ant-{}", response.id),
        object: "chat.completion".to_string(),
        created,
        model: response.model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: Some(content),
                extra: serde_json::Map::new(),
            },
            finish_reason: response.stop_reason,
        }],
        usage: Some(usage),
        extra: serde_json::Map::new(),
    }
}
