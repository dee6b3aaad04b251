use mproxy_protocol::google::GenerateContentResponse;
use mproxy_protocol::openai::chat::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, CompletionUsage,
};

/// Google `generateContent` response → OpenAI chat completion.
pub fn shape_response(
    response: GenerateContentResponse,
    requested_model: &str,
    created: i64,
) -> ChatCompletionResponse {
    let model = response
        .model_version
        .clone()
        .unwrap_or_else(|| requested_model.to_string());
    let finish_reason = response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.clone())
        .map(|reason| match reason.as_str() {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            "SAFETY" | "PROHIBITED_CONTENT" => "content_filter".to_string(),
            other => other.to_ascii_lowercase(),
        });
    let usage = response.usage_metadata.as_ref().map(|usage| CompletionUsage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        prompt_tokens_details: None,
        completion_tokens_details: None,
    });

    ChatCompletionResponse {
        id: format!("goog-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: Some(response.flat_text()),
                extra: serde_json::Map::new(),
            },
            finish_reason,
        }],
        usage,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::google::{Candidate, Content, UsageMetadata};

    #[test]
    fn maps_finish_reason_and_usage() {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content::text(Some("model"), "answer".to_string()),
                finish_reason: Some("MAX_TOKENS".to_string()),
                index: Some(0),
                safety_ratings: None,
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: Some(12),
                candidates_token_count: Some(34),
                total_token_count: Some(46),
                cached_content_token_count: None,
            }),
            model_version: Some("gemini-2.5-flash".to_string()),
            prompt_feedback: None,
        };
        let out = shape_response(response, "gemini-flash-latest", 0);
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(out.model, "gemini-2.5-flash");
        assert_eq!(out.usage.unwrap().completion_tokens, 34);
    }
}
