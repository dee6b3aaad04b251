use mproxy_protocol::openai::chat::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionUsage,
};
use mproxy_protocol::openai::responses::ResponsesResponse;

/// Responses-API result → classic chat completion shape.
pub fn shape_response(response: ResponsesResponse, created: i64) -> ChatCompletionResponse {
    let content = response.flat_text();
    let usage = response.usage.as_ref().map(|usage| CompletionUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: None,
        completion_tokens_details: None,
    });
    let finish_reason = match response.status.as_deref() {
        Some("incomplete") => Some("length".to_string()),
        _ => Some("stop".to_string()),
    };

    ChatCompletionResponse {
        id: response.id,
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
            finish_reason,
        }],
        usage,
        extra: serde_json::Map::new(),
    }
}
