use serde_json::Value;

use mproxy_protocol::google::{
    Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerationConfig, GoogleTool, Part, permissive_safety_settings,
};
use mproxy_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, ChatRole, ToolDefinition,
};

/// Converts an OpenAI chat request to a Google `generateContent` body.
/// System turns go to `systemInstruction`; adjacent same-role turns merge
/// (Gemini rejects consecutive turns of one role); tool definitions become
/// function declarations and tool traffic maps to functionCall /
/// functionResponse parts; permissive safety settings are injected.
pub fn transform_request(request: ChatCompletionRequest) -> GenerateContentRequest {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        let (role, parts) = match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content.flat_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
                continue;
            }
            ChatRole::Assistant => ("model", map_assistant_parts(message)),
            ChatRole::Tool => ("user", vec![map_tool_result_part(message)]),
            ChatRole::User | ChatRole::Function => ("user", map_text_parts(message)),
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            // Merge adjacent turns of the same role.
            Some(previous) if previous.role.as_deref() == Some(role) => {
                previous.parts.extend(parts);
            }
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content::text(None, system_texts.join("\n")))
    };

    let generation_config = GenerationConfig {
        max_output_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.map(|stop| stop.into_vec()),
        candidate_count: request.n,
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools: map_tools(request.tools),
        generation_config: Some(generation_config),
        safety_settings: Some(permissive_safety_settings()),
        extra: serde_json::Map::new(),
    }
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<GoogleTool>> {
    let declarations: Vec<FunctionDeclaration> = tools?
        .into_iter()
        .filter_map(|tool| {
            let function = tool.function?;
            Some(FunctionDeclaration {
                name: function.name,
                description: function.description,
                parameters: function.parameters,
            })
        })
        .collect();
    (!declarations.is_empty()).then(|| {
        vec![GoogleTool {
            function_declarations: Some(declarations),
        }]
    })
}

fn map_text_parts(message: &ChatMessage) -> Vec<Part> {
    let text = message.content.flat_text();
    if text.is_empty() {
        return Vec::new();
    }
    vec![Part {
        text: Some(text),
        ..Default::default()
    }]
}

fn map_assistant_parts(message: &ChatMessage) -> Vec<Part> {
    let mut parts = map_text_parts(message);
    for tool_call in message.tool_calls.iter().flatten() {
        let args = serde_json::from_str::<Value>(&tool_call.function.arguments).ok();
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: tool_call.function.name.clone(),
                args,
            }),
            ..Default::default()
        });
    }
    parts
}

/// Gemini correlates results by function name, not call id; fall back to the
/// call id when the client omitted the name.
fn map_tool_result_part(message: &ChatMessage) -> Part {
    let name = message
        .name
        .clone()
        .or_else(|| message.tool_call_id.clone())
        .unwrap_or_else(|| "tool".to_string());
    let text = message.content.flat_text();
    let response = serde_json::from_str::<Value>(&text)
        .unwrap_or_else(|_| serde_json::json!({ "result": text }));
    Part {
        function_response: Some(FunctionResponse { name, response }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::chat::{
        FunctionDefinition, MessageContent, ToolCall, ToolCallFunction,
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
            model: "gemini-2.5-flash".to_string(),
            messages,
            max_tokens: Some(64),
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
    fn merges_adjacent_same_role_turns() {
        let out = transform_request(request(vec![
            message(ChatRole::System, "sys"),
            message(ChatRole::User, "one"),
            message(ChatRole::User, "two"),
            message(ChatRole::Assistant, "reply"),
        ]));
        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[0].parts.len(), 2);
        assert_eq!(out.contents[1].role.as_deref(), Some("model"));
        assert!(out.system_instruction.is_some());
        assert!(out.safety_settings.as_ref().is_some_and(|s| !s.is_empty()));
        assert_eq!(
            out.generation_config.as_ref().unwrap().max_output_tokens,
            Some(64)
        );
    }

    #[test]
    fn tools_become_function_declarations() {
        let mut input = request(vec![message(ChatRole::User, "weather in tokyo")]);
        input.tools = Some(vec![ToolDefinition {
            r#type: "function".to_string(),
            function: Some(FunctionDefinition {
                name: "get_weather".to_string(),
                description: Some("look up weather".to_string()),
                parameters: Some(serde_json::json!({"type": "object"})),
            }),
        }]);
        let out = transform_request(input);
        let tools = out.tools.expect("tools must survive the transform");
        let declarations = tools[0].function_declarations.as_ref().unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, "get_weather");
    }

    #[test]
    fn tool_traffic_maps_to_function_parts() {
        let mut assistant = message(ChatRole::Assistant, "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_9".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "get_weather".to_string(),
                arguments: r#"{"city":"tokyo"}"#.to_string(),
            },
        }]);
        let mut tool = message(ChatRole::Tool, r#"{"temp_c": 21}"#);
        tool.name = Some("get_weather".to_string());
        tool.tool_call_id = Some("call_9".to_string());

        let out = transform_request(request(vec![
            message(ChatRole::User, "weather in tokyo"),
            assistant,
            tool,
        ]));

        let call = out.contents[1].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.args.as_ref().unwrap()["city"], "tokyo");

        let response = out.contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response["temp_c"], 21);
        assert_eq!(out.contents[2].role.as_deref(), Some("user"));
    }
}
