use serde_json::{Value, json};
use time::OffsetDateTime;

use mproxy_pool::auth::sigv4;
use mproxy_pool::{Credential, CredentialKind};
use mproxy_protocol::ApiFormat;
use mproxy_protocol::openai::chat::{ChatCompletionRequest, ChatRole};
use mproxy_protocol::openai::responses::ResponsesRequest;
use mproxy_registry::Service;
use mproxy_transform::RequestBody;

use crate::change::OutboundRequest;
use crate::context::{RequestContext, RequestError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const COHERE_VERSION: &str = "2022-12-06";

/// Adds the `global.` cross-region prefix to non-legacy Claude ids. Legacy
/// ids (`claude-3-*`, `claude-v2`, `claude-instant`) never get it, and an
/// already-prefixed id is never double-prefixed.
pub fn aws_model_id(model: &str) -> String {
    for prefix in ["global.", "us.", "eu.", "apac."] {
        if model.starts_with(prefix) {
            return model.to_string();
        }
    }
    let bare = model.strip_prefix("anthropic.").unwrap_or(model);
    let legacy = bare.starts_with("claude-v")
        || bare.starts_with("claude-instant")
        || bare
            .strip_prefix("claude-")
            .and_then(|rest| rest.chars().next())
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false);
    if legacy || !bare.starts_with("claude-") {
        model.to_string()
    } else {
        format!("global.{model}")
    }
}

/// Builds the fully mutated outbound request for the bound credential. Every
/// change goes through the context's change manager so the post-dispatch
/// stages can restore the request to what the client sent.
pub fn build_outbound(
    ctx: &mut RequestContext,
    credential: &Credential,
    gcp_access_token: Option<&str>,
) -> Result<OutboundRequest, RequestError> {
    let (url, stream_url_variant) = upstream_url(ctx, credential)?;
    let mut request = OutboundRequest::new("POST", url, ctx.body.clone());

    // Path/body rewrites before auth, so signatures cover the final form.
    if ctx.is_streaming && let Some(stream_url) = stream_url_variant {
        ctx.changes.set_url(&mut request, stream_url);
    }

    match ctx.service {
        Service::Aws => {
            let mut body = request.body.clone();
            match &mut body {
                RequestBody::AnthropicChat(chat) => {
                    chat.model = String::new();
                    // Bedrock streams via the URL variant; a stream flag in
                    // the body is rejected.
                    chat.stream = None;
                    chat.extra
                        .insert("anthropic_version".to_string(), json!(BEDROCK_ANTHROPIC_VERSION));
                }
                RequestBody::AnthropicText(text) => {
                    text.model = String::new();
                    text.stream = None;
                    text.extra
                        .insert("anthropic_version".to_string(), json!(BEDROCK_ANTHROPIC_VERSION));
                }
                _ => {}
            }
            ctx.changes.set_body(&mut request, body);
        }
        Service::Gcp => {
            let mut body = request.body.clone();
            if let RequestBody::AnthropicChat(chat) = &mut body {
                chat.model = String::new();
                // GCP wants the version in the body, not a header.
                chat.extra
                    .insert("anthropic_version".to_string(), json!(VERTEX_ANTHROPIC_VERSION));
            }
            ctx.changes.set_body(&mut request, body);
        }
        Service::Openai if ctx.outbound_format == ApiFormat::OpenaiResponses => {
            if let RequestBody::Openai(chat) = &request.body {
                let responses = to_responses_request(chat.clone());
                ctx.changes
                    .set_body(&mut request, RequestBody::OpenaiResponses(responses));
            }
        }
        _ => {}
    }

    ctx.changes
        .finalize_body(&mut request)
        .map_err(|err| RequestError::internal(format!("finalize failed: {err}")))?;

    attach_auth(ctx, &mut request, credential, gcp_access_token)?;
    attach_wire_headers(ctx, &mut request);
    Ok(request)
}

fn upstream_url(
    ctx: &RequestContext,
    credential: &Credential,
) -> Result<(String, Option<String>), RequestError> {
    let model = ctx.model.as_str();
    let url = match ctx.service {
        Service::Openai => match ctx.outbound_format {
            ApiFormat::OpenaiResponses => "https://api.openai.com/v1/responses".to_string(),
            ApiFormat::OpenaiImage => {
                "https://api.openai.com/v1/images/generations".to_string()
            }
            _ if matches!(ctx.body, RequestBody::Embeddings(_)) => {
                "https://api.openai.com/v1/embeddings".to_string()
            }
            _ => "https://api.openai.com/v1/chat/completions".to_string(),
        },
        Service::Anthropic => match ctx.outbound_format {
            // OpenAI-style inbound paths land on the native endpoints.
            ApiFormat::AnthropicText => "https://api.anthropic.com/v1/complete".to_string(),
            _ => "https://api.anthropic.com/v1/messages".to_string(),
        },
        Service::Aws => {
            let CredentialKind::Aws { region, .. } = &credential.kind else {
                return Err(RequestError::internal("aws credential missing region"));
            };
            let model_id = aws_model_id(model);
            let base = format!(
                "https://bedrock-runtime.{region}.amazonaws.com/model/{model_id}/invoke"
            );
            let stream = format!("{base}-with-response-stream");
            return Ok((base, Some(stream)));
        }
        Service::Gcp => {
            let CredentialKind::Gcp {
                region, project_id, ..
            } = &credential.kind
            else {
                return Err(RequestError::internal("gcp credential missing project"));
            };
            let action = if ctx.is_streaming {
                "streamRawPredict"
            } else {
                "rawPredict"
            };
            format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{model}:{action}"
            )
        }
        Service::GoogleAi => {
            let action = if ctx.is_streaming {
                "streamGenerateContent?alt=sse&"
            } else {
                "generateContent?"
            };
            format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:{action}key={}",
                credential.secret
            )
        }
        Service::MistralAi => "https://api.mistral.ai/v1/chat/completions".to_string(),
        Service::Openrouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
        Service::Moonshot => "https://api.moonshot.ai/v1/chat/completions".to_string(),
        Service::Qwen => {
            "https://dashscope-intl.aliyuncs.com/compatible-mode/v1/chat/completions".to_string()
        }
        // GLM serves its OpenAI-compatible surface under /v4.
        Service::Glm => "https://open.bigmodel.cn/api/paas/v4/chat/completions".to_string(),
        Service::Cohere => "https://api.cohere.com/compatibility/v1/chat/completions".to_string(),
        Service::Azure => {
            let CredentialKind::Azure {
                resource_name,
                api_version,
            } = &credential.kind
            else {
                return Err(RequestError::internal("azure credential missing resource"));
            };
            let operation = if ctx.outbound_format == ApiFormat::OpenaiImage {
                "images/generations"
            } else {
                "chat/completions"
            };
            format!(
                "https://{resource_name}.openai.azure.com/openai/deployments/{model}/{operation}?api-version={api_version}"
            )
        }
    };
    Ok((url, None))
}

fn attach_auth(
    ctx: &mut RequestContext,
    request: &mut OutboundRequest,
    credential: &Credential,
    gcp_access_token: Option<&str>,
) -> Result<(), RequestError> {
    match ctx.service {
        Service::Anthropic => {
            ctx.changes
                .set_header(request, "x-api-key", &credential.secret);
        }
        Service::Aws => {
            let CredentialKind::Aws { region, .. } = &credential.kind else {
                return Err(RequestError::internal("aws credential missing region"));
            };
            let body = request.serialized.clone().unwrap_or_default();
            let (host, path) = split_host_path(&request.url);
            let input = sigv4::SigningInput {
                method: &request.method,
                host: &host,
                path: &path,
                query: "",
                region,
                service: "bedrock",
                body: &body,
            };
            let signed = sigv4::sign(&credential.secret, &input, OffsetDateTime::now_utc())
                .map_err(|err| RequestError::internal(format!("sigv4: {err}")))?;
            ctx.changes
                .set_header(request, "authorization", &signed.authorization);
            ctx.changes
                .set_header(request, "x-amz-date", &signed.amz_date);
            ctx.changes
                .set_header(request, "x-amz-content-sha256", &signed.content_sha256);
        }
        Service::Gcp => {
            let token = gcp_access_token
                .ok_or_else(|| RequestError::internal("gcp access token unavailable"))?;
            ctx.changes
                .set_header(request, "authorization", &format!("Bearer {token}"));
        }
        // Google AI authenticates via the key query param set in the URL.
        Service::GoogleAi => {}
        Service::Azure => {
            ctx.changes
                .set_header(request, "api-key", &credential.secret);
        }
        _ => {
            let bearer = format!("Bearer {}", credential.secret);
            ctx.changes.set_header(request, "authorization", &bearer);
        }
    }
    Ok(())
}

fn attach_wire_headers(ctx: &mut RequestContext, request: &mut OutboundRequest) {
    match ctx.service {
        Service::Anthropic => {
            ctx.changes
                .set_header(request, "anthropic-version", ANTHROPIC_VERSION);
            if !ctx.anthropic_beta.is_empty() {
                let beta = ctx.anthropic_beta.join(",");
                ctx.changes.set_header(request, "anthropic-beta", &beta);
            }
        }
        Service::Cohere => {
            ctx.changes
                .set_header(request, "Cohere-Version", COHERE_VERSION);
        }
        _ => {}
    }
    if ctx.is_streaming {
        ctx.changes.set_header(request, "accept", "text/event-stream");
    } else {
        ctx.changes.set_header(request, "accept", "application/json");
    }
}

/// Responses-API finalize mapping: `messages` → `input`, `max_tokens` →
/// `max_output_tokens`, system turns → `instructions`; parameters the
/// Responses API refuses (n, logit_bias, stop) are stripped.
pub fn to_responses_request(chat: ChatCompletionRequest) -> ResponsesRequest {
    let mut instructions: Vec<String> = Vec::new();
    let mut input_items: Vec<Value> = Vec::new();
    for message in &chat.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                let text = message.content.flat_text();
                if !text.is_empty() {
                    instructions.push(text);
                }
            }
            _ => input_items.push(json!({
                "role": match message.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                "content": message.content.flat_text(),
            })),
        }
    }

    ResponsesRequest {
        model: chat.model,
        input: Value::Array(input_items),
        instructions: if instructions.is_empty() {
            None
        } else {
            Some(instructions.join("\n"))
        },
        max_output_tokens: chat.max_completion_tokens.or(chat.max_tokens),
        temperature: chat.temperature,
        top_p: chat.top_p,
        stream: chat.stream,
        extra: serde_json::Map::new(),
    }
}

fn split_host_path(url: &str) -> (String, String) {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match rest.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{path}")),
        None => (rest.to_string(), "/".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_prefix_rules() {
        // New-format ids gain the prefix.
        assert_eq!(
            aws_model_id("anthropic.claude-sonnet-4-20250514-v1:0"),
            "global.anthropic.claude-sonnet-4-20250514-v1:0"
        );
        // Never double-prefixed.
        assert_eq!(
            aws_model_id("global.anthropic.claude-sonnet-4-20250514-v1:0"),
            "global.anthropic.claude-sonnet-4-20250514-v1:0"
        );
        // Legacy ids never gain it.
        assert_eq!(
            aws_model_id("anthropic.claude-3-sonnet-20240229-v1:0"),
            "anthropic.claude-3-sonnet-20240229-v1:0"
        );
        assert_eq!(aws_model_id("anthropic.claude-v2:1"), "anthropic.claude-v2:1");
        // Other region prefixes are respected.
        assert_eq!(
            aws_model_id("us.anthropic.claude-sonnet-4-20250514-v1:0"),
            "us.anthropic.claude-sonnet-4-20250514-v1:0"
        );
        // Non-Claude ids pass through.
        assert_eq!(
            aws_model_id("mistral.mistral-large-2402-v1:0"),
            "mistral.mistral-large-2402-v1:0"
        );
    }

    #[test]
    fn responses_mapping_moves_messages_to_input() {
        use mproxy_protocol::openai::chat::{ChatMessage, MessageContent};
        let chat = ChatCompletionRequest {
            model: "gpt-5".to_string(),
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: MessageContent::Text("be brief".to_string()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                    extra: serde_json::Map::new(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: MessageContent::Text("hi".to_string()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                    extra: serde_json::Map::new(),
                },
            ],
            max_tokens: Some(128),
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            n: Some(3),
            stop: None,
            stream: None,
            stream_options: None,
            user: None,
            tools: None,
            tool_choice: None,
            logit_bias: None,
            extra: serde_json::Map::new(),
        };
        let responses = to_responses_request(chat);
        assert_eq!(responses.max_output_tokens, Some(128));
        assert_eq!(responses.instructions.as_deref(), Some("be brief"));
        let Value::Array(items) = &responses.input else {
            panic!("expected array input");
        };
        assert_eq!(items.len(), 1);
        // n has no Responses equivalent and is dropped.
        assert!(responses.extra.is_empty());
    }
}
