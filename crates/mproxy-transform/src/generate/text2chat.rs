use mproxy_protocol::anthropic::chat::{
    MessageContent, MessageParam, MessageRole, MessagesRequest, SystemParam,
};
use mproxy_protocol::anthropic::text::CompleteRequest;

const HUMAN: &str = "\n\nHuman:";
const ASSISTANT: &str = "\n\nAssistant:";

/// Converts a legacy text-completion request into a messages request for
/// Claude 3+ models, which no longer serve `/v1/complete`. The prompt is
/// split on the Human/Assistant markers; text before the first marker becomes
/// the system block.
pub fn transform_request(request: CompleteRequest) -> MessagesRequest {
    let (system, turns) = split_prompt(&request.prompt);

    let mut messages: Vec<MessageParam> = turns
        .into_iter()
        .filter(|(_, text)| !text.is_empty())
        .map(|(role, text)| MessageParam {
            role,
            content: MessageContent::Text(text),
        })
        .collect();
    if messages.is_empty() {
        messages.push(MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text(request.prompt.trim().to_string()),
        });
    }

    MessagesRequest {
        model: request.model,
        max_tokens: request.max_tokens_to_sample,
        messages,
        system: system.map(SystemParam::Text),
        // The legacy text dialect has no tool surface to carry over.
        tools: None,
        tool_choice: None,
        stop_sequences: request.stop_sequences,
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        metadata: None,
        extra: serde_json::Map::new(),
    }
}

fn split_prompt(prompt: &str) -> (Option<String>, Vec<(MessageRole, String)>) {
    let mut turns: Vec<(MessageRole, String)> = Vec::new();
    let mut rest = prompt;
    let mut system: Option<String> = None;

    let first_marker = rest.find(HUMAN).or_else(|| rest.find(ASSISTANT));
    match first_marker {
        Some(index) => {
            let head = rest[..index].trim();
            if !head.is_empty() {
                system = Some(head.to_string());
            }
            rest = &rest[index..];
        }
        None => return (None, turns),
    }

    while !rest.is_empty() {
        let (role, marker) = if rest.starts_with(HUMAN) {
            (MessageRole::User, HUMAN)
        } else if rest.starts_with(ASSISTANT) {
            (MessageRole::Assistant, ASSISTANT)
        } else {
            break;
        };
        rest = &rest[marker.len()..];
        let next = rest
            .find(HUMAN)
            .into_iter()
            .chain(rest.find(ASSISTANT))
            .min();
        let (turn, remainder) = match next {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        turns.push((role, turn.trim().to_string()));
        rest = remainder;
    }

    (system, turns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_splits_into_turns() {
        let request = CompleteRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            prompt: "You are terse.\n\nHuman: hi\n\nAssistant: hello\n\nHuman: bye\n\nAssistant:"
                .to_string(),
            max_tokens_to_sample: 32,
            stop_sequences: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stream: None,
            extra: serde_json::Map::new(),
        };
        let out = transform_request(request);
        assert!(matches!(out.system, Some(SystemParam::Text(ref text)) if text == "You are terse."));
        // The empty trailing assistant turn is dropped.
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, MessageRole::User);
        assert_eq!(out.messages[1].role, MessageRole::Assistant);
        assert_eq!(out.messages[2].content.flat_text(), "bye");
        assert_eq!(out.max_tokens, 32);
    }

    #[test]
    fn markerless_prompt_becomes_single_user_turn() {
        let request = CompleteRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            prompt: "just text".to_string(),
            max_tokens_to_sample: 8,
            stop_sequences: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stream: None,
            extra: serde_json::Map::new(),
        };
        let out = transform_request(request);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content.flat_text(), "just text");
    }
}
