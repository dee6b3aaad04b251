use mproxy_protocol::anthropic::text::CompleteResponse;
use mproxy_protocol::openai::chat::{AssistantMessage, ChatChoice, ChatCompletionResponse};

/// Bedrock text-completion response → OpenAI chat completion. Bedrock omits
/// the id (and sometimes the model), so an `aws-<uuid>` id is fabricated and
/// the request's model is used when the upstream left it out.
pub fn shape_response(
    response: CompleteResponse,
    requested_model: &str,
    created: i64,
) -> ChatCompletionResponse {
    let model = if response.model.is_empty() {
        requested_model.to_string()
    } else {
        response.model
    };
    ChatCompletionResponse {
        id: format!("aws-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: Some(response.completion),
                extra: serde_json::Map::new(),
            },
            finish_reason: response.stop_reason,
        }],
        usage: None,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabricates_id_and_preserves_model_fallback() {
        let response = CompleteResponse {
            id: None,
            r#type: "completion".to_string(),
            completion: "hi".to_string(),
            stop_reason: Some("stop_sequence".to_string()),
            model: String::new(),
        };
        let out = shape_response(response, "anthropic.claude-v2:1", 0);
        assert!(out.id.starts_with("aws-"));
        assert_eq!(out.model, "anthropic.claude-v2:1");
        assert_eq!(out.choices[0].message.content.as_deref(), Some("hi"));
    }
}
