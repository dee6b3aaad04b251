use serde_json::Value;

use mproxy_protocol::anthropic::chat::{
    ContentBlock, ImageSource, MessageContent as AnthropicContent, MessageParam, MessageRole,
    MessagesRequest, SystemParam, Tool as AnthropicTool, ToolChoice as AnthropicToolChoice,
};
use mproxy_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent, ToolCall,
    ToolChoice, ToolDefinition,
};

/// Default max_tokens when the client supplied none; Anthropic requires the
/// field.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Converts an OpenAI chat request into an Anthropic messages request.
/// System and developer turns collect into the system block; assistant
/// tool_calls become tool_use blocks; tool turns become tool_result blocks
/// on a user message; tools and tool_choice carry across.
pub fn transform_request(request: ChatCompletionRequest) -> MessagesRequest {
    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content.flat_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatRole::User => messages.push(MessageParam {
                role: MessageRole::User,
                content: map_user_content(&message.content),
            }),
            ChatRole::Assistant => messages.push(map_assistant_message(message)),
            ChatRole::Tool => messages.push(map_tool_message(message)),
            ChatRole::Function => {
                // Legacy function results have no stable call id; degrade to
                // labeled text.
                let label = message.name.as_deref().unwrap_or("function");
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content: AnthropicContent::Text(format!(
                        "[{label}] {}",
                        message.content.flat_text()
                    )),
                });
            }
        }
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(SystemParam::Text(system_texts.join("\n")))
    };

    MessagesRequest {
        model: request.model,
        max_tokens: request
            .max_completion_tokens
            .or(request.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        tools: map_tools(request.tools),
        tool_choice: request.tool_choice.and_then(map_tool_choice),
        stop_sequences: request.stop.map(|stop| stop.into_vec()),
        stream: request.stream,
        // Anthropic temperature tops out at 1.0.
        temperature: request.temperature.map(|value| value.clamp(0.0, 1.0)),
        top_p: request.top_p,
        top_k: None,
        metadata: None,
        extra: serde_json::Map::new(),
    }
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<AnthropicTool>> {
    let tools: Vec<AnthropicTool> = tools?
        .into_iter()
        .filter_map(|tool| {
            let function = tool.function?;
            Some(AnthropicTool {
                name: function.name,
                description: function.description,
                input_schema: function.parameters,
                cache_control: None,
                extra: serde_json::Map::new(),
            })
        })
        .collect();
    (!tools.is_empty()).then_some(tools)
}

fn map_tool_choice(choice: ToolChoice) -> Option<AnthropicToolChoice> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "none" => Some(AnthropicToolChoice::None),
            "auto" => Some(AnthropicToolChoice::Auto),
            "required" => Some(AnthropicToolChoice::Any),
            _ => None,
        },
        ToolChoice::Named { function, .. } => Some(AnthropicToolChoice::Tool {
            name: function.name,
        }),
    }
}

fn map_assistant_message(message: &ChatMessage) -> MessageParam {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let text = message.content.flat_text();
    if !text.is_empty() {
        blocks.push(ContentBlock::Text {
            text,
            cache_control: None,
        });
    }
    for tool_call in message.tool_calls.iter().flatten() {
        blocks.push(map_tool_call(tool_call));
    }

    let content = match blocks.as_slice() {
        [ContentBlock::Text { text, .. }] => AnthropicContent::Text(text.clone()),
        [] => AnthropicContent::Text(String::new()),
        _ => AnthropicContent::Blocks(blocks),
    };
    MessageParam {
        role: MessageRole::Assistant,
        content,
    }
}

fn map_tool_call(tool_call: &ToolCall) -> ContentBlock {
    ContentBlock::ToolUse {
        id: tool_call.id.clone(),
        name: tool_call.function.name.clone(),
        input: parse_tool_arguments(&tool_call.function.arguments),
        cache_control: None,
    }
}

/// Tool results answer the matching tool_use id; Anthropic wants them on a
/// user turn.
fn map_tool_message(message: &ChatMessage) -> MessageParam {
    let text = message.content.flat_text();
    match &message.tool_call_id {
        Some(tool_use_id) => MessageParam {
            role: MessageRole::User,
            content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: Some(Value::String(text)),
                is_error: None,
                cache_control: None,
            }]),
        },
        // A tool turn without a call id cannot be correlated; keep the text.
        None => MessageParam {
            role: MessageRole::User,
            content: AnthropicContent::Text(format!("[tool] {text}")),
        },
    }
}

/// Arguments are a JSON string on the wire, but clients ship malformed and
/// non-object payloads; wrap anything that is not an object.
fn parse_tool_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "arguments": other }),
        Err(_) => serde_json::json!({ "arguments": arguments }),
    }
}

fn map_user_content(content: &MessageContent) -> AnthropicContent {
    match content {
        MessageContent::Text(text) => AnthropicContent::Text(text.clone()),
        MessageContent::Parts(parts) => {
            let mut blocks: Vec<ContentBlock> = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: text.clone(),
                                cache_control: None,
                            });
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        blocks.push(map_image(&image_url.url));
                    }
                }
            }
            if blocks.len() == 1
                && let ContentBlock::Text { text, .. } = &blocks[0]
            {
                return AnthropicContent::Text(text.clone());
            }
            AnthropicContent::Blocks(blocks)
        }
    }
}

fn map_image(url: &str) -> ContentBlock {
    if let Some((media_type, data)) = parse_data_url(url) {
        return ContentBlock::Image {
            source: ImageSource::Base64 { media_type, data },
            cache_control: None,
        };
    }
    ContentBlock::Image {
        source: ImageSource::Url {
            url: url.to_string(),
        },
        cache_control: None,
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::chat::{
        FunctionDefinition, NamedToolFunction, StopConfig, ToolCallFunction,
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
            model: "claude-3-5-sonnet-latest".to_string(),
            messages,
            max_tokens: Some(10),
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
    fn system_turns_collect_into_system_block() {
        let mut input = request(vec![
            message(ChatRole::System, "persona"),
            message(ChatRole::User, "hi"),
            message(ChatRole::Assistant, "hello"),
        ]);
        input.temperature = Some(1.7);
        input.stop = Some(StopConfig::Single("###".to_string()));
        let out = transform_request(input);
        assert!(matches!(out.system, Some(SystemParam::Text(ref text)) if text == "persona"));
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.max_tokens, 10);
        assert_eq!(out.stop_sequences, Some(vec!["###".to_string()]));
        // Clamped into Anthropic's range.
        assert_eq!(out.temperature, Some(1.0));
    }

    #[test]
    fn tools_and_tool_choice_carry_across() {
        let mut input = request(vec![message(ChatRole::User, "search for rust")]);
        input.tools = Some(vec![ToolDefinition {
            r#type: "function".to_string(),
            function: Some(FunctionDefinition {
                name: "search".to_string(),
                description: Some("web search".to_string()),
                parameters: Some(serde_json::json!({
                    "type": "object",
                    "properties": {"q": {"type": "string"}}
                })),
            }),
        }]);
        input.tool_choice = Some(ToolChoice::Named {
            r#type: "function".to_string(),
            function: NamedToolFunction {
                name: "search".to_string(),
            },
        });
        let out = transform_request(input);
        let tools = out.tools.expect("tools must survive the transform");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description.as_deref(), Some("web search"));
        assert!(tools[0].input_schema.is_some());
        assert_eq!(
            out.tool_choice,
            Some(AnthropicToolChoice::Tool {
                name: "search".to_string()
            })
        );
    }

    #[test]
    fn required_mode_maps_to_any() {
        let mut input = request(vec![message(ChatRole::User, "hi")]);
        input.tool_choice = Some(ToolChoice::Mode("required".to_string()));
        let out = transform_request(input);
        assert_eq!(out.tool_choice, Some(AnthropicToolChoice::Any));
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let mut assistant = message(ChatRole::Assistant, "let me check");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "search".to_string(),
                arguments: r#"{"q":"rust"}"#.to_string(),
            },
        }]);
        let mut tool = message(ChatRole::Tool, "top result: rust-lang.org");
        tool.tool_call_id = Some("call_1".to_string());

        let out = transform_request(request(vec![
            message(ChatRole::User, "search for rust"),
            assistant,
            tool,
        ]));

        let AnthropicContent::Blocks(blocks) = &out.messages[1].content else {
            panic!("expected blocks on the assistant turn");
        };
        assert!(matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "let me check"));
        let ContentBlock::ToolUse {
            id, name, input, ..
        } = &blocks[1]
        else {
            panic!("expected tool_use block");
        };
        assert_eq!(id, "call_1");
        assert_eq!(name, "search");
        assert_eq!(input["q"], "rust");

        let AnthropicContent::Blocks(blocks) = &out.messages[2].content else {
            panic!("expected blocks on the tool turn");
        };
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } = &blocks[0]
        else {
            panic!("expected tool_result block");
        };
        assert_eq!(tool_use_id, "call_1");
        assert_eq!(
            content.as_ref().and_then(|value| value.as_str()),
            Some("top result: rust-lang.org")
        );
        assert_eq!(out.messages[2].role, MessageRole::User);
    }

    #[test]
    fn malformed_tool_arguments_are_wrapped() {
        assert_eq!(parse_tool_arguments("not json")["arguments"], "not json");
        assert_eq!(parse_tool_arguments("[1,2]")["arguments"], serde_json::json!([1, 2]));
        assert_eq!(parse_tool_arguments(r#"{"a":1}"#)["a"], 1);
    }

    #[test]
    fn data_url_becomes_base64_image_block() {
        let input = request(vec![ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is this".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: mproxy_protocol::openai::chat::ImageUrl {
                        url: "data:image/png;base64,AAAA".to_string(),
                        detail: None,
                    },
                },
            ]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            extra: serde_json::Map::new(),
        }]);
        let out = transform_request(input);
        let AnthropicContent::Blocks(blocks) = &out.messages[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(
            &blocks[1],
            ContentBlock::Image {
                source: ImageSource::Base64 { media_type, .. },
                ..
            } if media_type == "image/png"
        ));
    }
}
