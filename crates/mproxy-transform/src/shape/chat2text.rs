use mproxy_protocol::anthropic::chat::MessagesResponse;
use mproxy_protocol::anthropic::text::CompleteResponse;

/// Anthropic messages response → legacy text-completion response, for
/// clients on `/v1/complete` served by a chat-only model.
pub fn shape_response(response: MessagesResponse) -> CompleteResponse {
    CompleteResponse {
        id: Some(format!("ant-{}", response.id)),
        r#type: "completion".to_string(),
        completion: response.flat_text(),
        stop_reason: response.stop_reason,
        model: response.model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::anthropic::chat::{MessagesUsage, ResponseBlock};

    #[test]
    fn emits_completion_with_prefixed_id() {
        let response = MessagesResponse {
            id: "msg_1".to_string(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            content: vec![ResponseBlock::Text {
                text: "howdy".to_string(),
            }],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: MessagesUsage::default(),
        };
        let out = shape_response(response);
        assert_eq!(out.id.as_deref(), Some("ant-msg_1"));
        assert_eq!(out.r#type, "completion");
        assert_eq!(out.completion, "howdy");
    }
}
