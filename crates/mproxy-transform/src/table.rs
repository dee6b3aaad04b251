use mproxy_protocol::ApiFormat;

use crate::body::{RequestBody, ResponseBody};
use crate::{generate, shape};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("no transform from {inbound} to {outbound}")]
    UnsupportedPair {
        inbound: ApiFormat,
        outbound: ApiFormat,
    },
    #[error("request body is {actual}, expected {expected}")]
    FormatMismatch {
        expected: ApiFormat,
        actual: ApiFormat,
    },
}

/// The registry of supported inbound→outbound request transforms. Identity
/// pairs pass through; unknown pairs are rejected before enqueue.
pub fn transform_request(
    outbound: ApiFormat,
    body: RequestBody,
) -> Result<RequestBody, TransformError> {
    let inbound = body.format();
    if inbound == outbound {
        return Ok(body);
    }
    match (inbound, body, outbound) {
        (_, RequestBody::Openai(request), ApiFormat::AnthropicChat) => Ok(
            RequestBody::AnthropicChat(generate::openai2anthropic::transform_request(request)),
        ),
        (_, RequestBody::Openai(request), ApiFormat::GoogleAi) => Ok(RequestBody::GoogleAi(
            generate::openai2google::transform_request(request),
        )),
        (_, RequestBody::Openai(request), ApiFormat::MistralAi) => Ok(RequestBody::MistralAi(
            generate::openai2mistral::transform_request(request),
        )),
        // The Responses mapping happens at finalize time where the serialized
        // form is produced; until then the body stays in chat shape.
        (_, body @ RequestBody::Openai(_), ApiFormat::OpenaiResponses) => Ok(body),
        (_, RequestBody::AnthropicText(request), ApiFormat::AnthropicChat) => Ok(
            RequestBody::AnthropicChat(generate::text2chat::transform_request(request)),
        ),
        (inbound, _, outbound) => Err(TransformError::UnsupportedPair { inbound, outbound }),
    }
}

/// Reverse transforms: shape a parsed upstream response back into the
/// client's dialect. Streaming responses bypass this (forwarded verbatim).
pub fn shape_response(
    inbound: ApiFormat,
    requested_model: &str,
    created: i64,
    body: ResponseBody,
) -> Result<ResponseBody, TransformError> {
    let outbound = match &body {
        ResponseBody::Openai(_) | ResponseBody::Embeddings(_) => ApiFormat::Openai,
        ResponseBody::OpenaiResponses(_) => ApiFormat::OpenaiResponses,
        ResponseBody::OpenaiImage(_) => ApiFormat::OpenaiImage,
        ResponseBody::AnthropicChat(_) => ApiFormat::AnthropicChat,
        ResponseBody::AnthropicText(_) => ApiFormat::AnthropicText,
        ResponseBody::GoogleAi(_) => ApiFormat::GoogleAi,
        ResponseBody::MistralAi(_) => ApiFormat::MistralAi,
    };
    if inbound == outbound {
        return Ok(body);
    }
    match (body, inbound) {
        (ResponseBody::AnthropicChat(response), ApiFormat::Openai) => Ok(ResponseBody::Openai(
            shape::anthropic2openai::shape_response(response, created),
        )),
        (ResponseBody::AnthropicChat(response), ApiFormat::AnthropicText) => Ok(
            ResponseBody::AnthropicText(shape::chat2text::shape_response(response)),
        ),
        (ResponseBody::AnthropicText(response), ApiFormat::Openai) => Ok(ResponseBody::Openai(
            shape::awstext2openai::shape_response(response, requested_model, created),
        )),
        (ResponseBody::GoogleAi(response), ApiFormat::Openai) => Ok(ResponseBody::Openai(
            shape::google2openai::shape_response(response, requested_model, created),
        )),
        (ResponseBody::OpenaiResponses(response), ApiFormat::Openai) => Ok(ResponseBody::Openai(
            shape::responses2openai::shape_response(response, created),
        )),
        // Mistral responses are OpenAI-shaped to the decimal point clients
        // care about; passthrough.
        (ResponseBody::MistralAi(response), ApiFormat::Openai) => {
            Ok(ResponseBody::MistralAi(response))
        }
        (body, inbound) => Err(TransformError::UnsupportedPair {
            inbound,
            outbound: match &body {
                ResponseBody::Openai(_) | ResponseBody::Embeddings(_) => ApiFormat::Openai,
                ResponseBody::OpenaiResponses(_) => ApiFormat::OpenaiResponses,
                ResponseBody::OpenaiImage(_) => ApiFormat::OpenaiImage,
                ResponseBody::AnthropicChat(_) => ApiFormat::AnthropicChat,
                ResponseBody::AnthropicText(_) => ApiFormat::AnthropicText,
                ResponseBody::GoogleAi(_) => ApiFormat::GoogleAi,
                ResponseBody::MistralAi(_) => ApiFormat::MistralAi,
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::anthropic::chat::{MessagesResponse, MessagesUsage, ResponseBlock};
    use mproxy_protocol::openai::chat::{
        ChatCompletionRequest, ChatMessage, ChatRole, MessageContent,
    };

    fn openai_request() -> RequestBody {
        RequestBody::Openai(ChatCompletionRequest {
            model: "claude-3-5-sonnet-latest".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Text("hi".to_string()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
                extra: serde_json::Map::new(),
            }],
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
        })
    }

    #[test]
    fn identity_pairs_pass_through() {
        let body = openai_request();
        let out = transform_request(ApiFormat::Openai, body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn openai_to_anthropic_is_registered() {
        let out = transform_request(ApiFormat::AnthropicChat, openai_request()).unwrap();
        assert!(matches!(out, RequestBody::AnthropicChat(_)));
    }

    #[test]
    fn unsupported_pair_is_an_error() {
        let body = RequestBody::AnthropicChat(
            mproxy_protocol::anthropic::chat::MessagesRequest {
                model: "m".to_string(),
                max_tokens: 1,
                messages: vec![],
                system: None,
                tools: None,
                tool_choice: None,
                stop_sequences: None,
                stream: None,
                temperature: None,
                top_p: None,
                top_k: None,
                metadata: None,
                extra: serde_json::Map::new(),
            },
        );
        assert!(matches!(
            transform_request(ApiFormat::GoogleAi, body),
            Err(TransformError::UnsupportedPair { .. })
        ));
    }

    #[test]
    fn round_trip_preserves_content_concatenation() {
        // Shaping back to the client's dialect must not lose content.
        let upstream = ResponseBody::AnthropicChat(MessagesResponse {
            id: "msg_X".to_string(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            content: vec![ResponseBlock::Text {
                text: "Hello".to_string(),
            }],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: MessagesUsage::default(),
        });
        let flat_before = upstream.flat_text();
        let shaped = shape_response(ApiFormat::Openai, "claude-3-5-sonnet-latest", 0, upstream)
            .unwrap();
        assert_eq!(shaped.flat_text(), flat_before);
    }
}
