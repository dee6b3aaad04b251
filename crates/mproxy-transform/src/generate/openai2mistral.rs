use mproxy_protocol::mistral::{ChatMessage as MistralMessage, ChatRequest};
use mproxy_protocol::openai::chat::{ChatCompletionRequest, ChatRole};

/// Converts an OpenAI chat request into a Mistral chat request. The dialects
/// agree on tool shapes, so tools, tool_calls and tool_call_id pass through;
/// a trailing assistant turn becomes a `prefix: true` continuation, which is
/// the only form Mistral accepts for assistant-last conversations.
pub fn transform_request(request: ChatCompletionRequest) -> ChatRequest {
    let mut messages: Vec<MistralMessage> = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            ChatRole::System | ChatRole::Developer => "system",
            ChatRole::User | ChatRole::Function => "user",
            ChatRole::Tool => "tool",
            ChatRole::Assistant => "assistant",
        };
        messages.push(MistralMessage {
            role: role.to_string(),
            content: message.content.flat_text(),
            prefix: None,
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
        });
    }
    if let Some(last) = messages.last_mut()
        && last.role == "assistant"
        && last.tool_calls.is_none()
    {
        last.prefix = Some(true);
    }

    ChatRequest {
        model: request.model,
        messages,
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop.map(|stop| stop.into_vec()),
        stream: request.stream,
        tools: request.tools,
        random_seed: None,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::chat::{
        ChatMessage, MessageContent, ToolCall, ToolCallFunction, ToolDefinition,
    };

    fn message(role: ChatRole, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: MessageContent::Text(text.to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            extra: serde_json::Map::new(),
        }
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "mistral-large-latest".to_string(),
            messages,
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
        }
    }

    #[test]
    fn trailing_assistant_turn_becomes_prefix() {
        let out = transform_request(request(vec![
            message(ChatRole::User, "write a poem"),
            message(ChatRole::Assistant, "Roses are"),
        ]));
        assert_eq!(out.messages.last().unwrap().prefix, Some(true));
        assert!(out.messages[0].prefix.is_none());
    }

    #[test]
    fn tool_traffic_passes_through() {
        let mut assistant = message(ChatRole::Assistant, "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            },
        }]);
        let mut tool = message(ChatRole::Tool, "42");
        tool.tool_call_id = Some("call_1".to_string());

        let mut input = request(vec![message(ChatRole::User, "q"), assistant, tool]);
        input.tools = Some(vec![ToolDefinition {
            r#type: "function".to_string(),
            function: None,
        }]);
        let out = transform_request(input);

        assert!(out.tools.is_some());
        let assistant = &out.messages[1];
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].function.name, "lookup");
        // A tool-calling assistant turn is not a prefix continuation.
        assert!(assistant.prefix.is_none());
        assert_eq!(out.messages[2].role, "tool");
        assert_eq!(out.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }
}
