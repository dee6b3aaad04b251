use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use mproxy_protocol::anthropic::chat::{ContentBlock, ImageSource, MessagesRequest};

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const EXTENDED_TTL: Duration = Duration::from_secs(60 * 60);

/// The fingerprints of one request: one per cache-control breakpoint, the
/// last one being the full fingerprint used for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintSet {
    pub prefixes: Vec<String>,
    pub ttl: Duration,
}

impl FingerprintSet {
    pub fn full(&self) -> &str {
        // Construction guarantees at least one prefix.
        self.prefixes.last().map(String::as_str).unwrap_or("")
    }
}

fn part_hash(record: &Value) -> String {
    let canonical = canonical_json(record);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..4])
}

/// Deterministic serialization: object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(key, _)| key.as_str());
                let mut out = Map::new();
                for (key, inner) in sorted {
                    out.insert(key.clone(), sort(inner));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Computes the fingerprint set of a request, walking tools, then system
/// blocks, then message content blocks in order. Returns `None` when no part
/// carries a cache-control marker.
///
/// Normalization rules: `cache_control` itself is excluded from every record;
/// image data is replaced by its hash (media type kept); `tool_use_id` is
/// excluded because the upstream assigns it per call. Content appended after
/// the last marker therefore never changes the fingerprint.
pub fn fingerprint(request: &MessagesRequest) -> Option<FingerprintSet> {
    let mut hashes: Vec<String> = Vec::new();
    let mut breakpoints: Vec<usize> = Vec::new();
    let mut extended_ttl = false;

    let mut push = |record: Value, cached: bool, ttl_1h: bool| {
        hashes.push(part_hash(&record));
        if cached {
            breakpoints.push(hashes.len() - 1);
        }
        if ttl_1h {
            extended_ttl = true;
        }
    };

    for tool in request.tools.iter().flatten() {
        let record = json!({
            "kind": "tool",
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.input_schema,
        });
        let (cached, ttl_1h) = cache_marker(tool.cache_control.as_ref());
        push(record, cached, ttl_1h);
    }

    for block in request.system_blocks() {
        let record = json!({ "kind": "system", "text": block.text });
        let (cached, ttl_1h) = cache_marker(block.cache_control.as_ref());
        push(record, cached, ttl_1h);
    }

    for message in &request.messages {
        let role = match message.role {
            mproxy_protocol::anthropic::chat::MessageRole::User => "user",
            mproxy_protocol::anthropic::chat::MessageRole::Assistant => "assistant",
        };
        for block in message.content.blocks() {
            let record = match &block {
                ContentBlock::Text { text, .. } => json!({
                    "kind": "text",
                    "role": role,
                    "text": text,
                }),
                ContentBlock::Image { source, .. } => match source {
                    ImageSource::Base64 { media_type, data } => {
                        let digest = Sha256::digest(data.as_bytes());
                        json!({
                            "kind": "image",
                            "role": role,
                            "media_type": media_type,
                            "data_hash": hex::encode(&digest[..4]),
                        })
                    }
                    ImageSource::Url { url } => json!({
                        "kind": "image",
                        "role": role,
                        "url": url,
                    }),
                },
                ContentBlock::ToolUse { name, input, .. } => json!({
                    "kind": "tool_use",
                    "role": role,
                    "name": name,
                    "input": input,
                }),
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => json!({
                    "kind": "tool_result",
                    "role": role,
                    "content": content,
                    "is_error": is_error,
                }),
                ContentBlock::Thinking { thinking, .. } => json!({
                    "kind": "thinking",
                    "role": role,
                    "thinking": thinking,
                }),
            };
            let (cached, ttl_1h) = cache_marker(block.cache_control());
            push(record, cached, ttl_1h);
        }
    }

    if breakpoints.is_empty() {
        return None;
    }

    let prefixes = breakpoints
        .iter()
        .map(|index| hashes[..=*index].concat())
        .collect();
    Some(FingerprintSet {
        prefixes,
        ttl: if extended_ttl { EXTENDED_TTL } else { DEFAULT_TTL },
    })
}

fn cache_marker(
    control: Option<&mproxy_protocol::anthropic::chat::CacheControl>,
) -> (bool, bool) {
    match control {
        Some(control) => (true, control.ttl.as_deref() == Some("1h")),
        None => (false, false),
    }
}

#[derive(Debug, Clone)]
struct AffinityEntry {
    credential_hash: String,
    last_used: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl AffinityEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_used) >= self.ttl
    }
}

/// Fingerprint → credential memo. Best-effort: a miss or an expired entry
/// never blocks a request, it only loses the cache discount.
#[derive(Debug, Default)]
pub struct CacheRouter {
    entries: std::sync::Mutex<HashMap<String, AffinityEntry>>,
}

impl CacheRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact match first; otherwise the longest stored fingerprint that is a
    /// prefix of the query, or that the query is a prefix of (the breakpoint
    /// moved earlier between requests).
    pub fn preferred_credential(&self, fingerprint: &str) -> Option<String> {
        let now = Instant::now();
        let mut guard = self.entries.lock().ok()?;
        if let Some(entry) = guard.get_mut(fingerprint) {
            if !entry.expired(now) {
                entry.hit_count += 1;
                return Some(entry.credential_hash.clone());
            }
            guard.remove(fingerprint);
        }

        let mut best: Option<(&String, &AffinityEntry)> = None;
        for (key, entry) in guard.iter() {
            if entry.expired(now) {
                continue;
            }
            if fingerprint.starts_with(key.as_str()) || key.starts_with(fingerprint) {
                let better = match best {
                    Some((best_key, _)) => key.len() > best_key.len(),
                    None => true,
                };
                if better {
                    best = Some((key, entry));
                }
            }
        }
        best.map(|(_, entry)| entry.credential_hash.clone())
    }

    /// Records every prefix fingerprint eagerly so later requests whose final
    /// breakpoint moved still match.
    pub fn record_cache_usage(&self, fingerprints: &FingerprintSet, credential_hash: &str) {
        let now = Instant::now();
        let Ok(mut guard) = self.entries.lock() else {
            return;
        };
        for prefix in &fingerprints.prefixes {
            let entry = guard
                .entry(prefix.clone())
                .or_insert_with(|| AffinityEntry {
                    credential_hash: credential_hash.to_string(),
                    last_used: now,
                    ttl: fingerprints.ttl,
                    hit_count: 0,
                });
            entry.credential_hash = credential_hash.to_string();
            entry.last_used = now;
            entry.ttl = fingerprints.ttl;
        }
    }

    /// Minute sweeper entry point.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut guard) = self.entries.lock() else {
            return 0;
        };
        let before = guard.len();
        guard.retain(|_, entry| !entry.expired(now));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test hook: drop all entries.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::anthropic::chat::{
        CacheControl, MessageContent, MessageParam, MessageRole, SystemParam,
    };

    fn text_block(text: &str, cached: bool) -> ContentBlock {
        ContentBlock::Text {
            text: text.to_string(),
            cache_control: cached.then(CacheControl::ephemeral),
        }
    }

    fn request_with(blocks: Vec<ContentBlock>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 100,
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Blocks(blocks),
            }],
            system: Some(SystemParam::Text("persona".to_string())),
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn no_marker_means_no_fingerprint() {
        let request = request_with(vec![text_block("hi", false)]);
        assert!(fingerprint(&request).is_none());
    }

    #[test]
    fn trailing_content_after_marker_is_ignored() {
        let base = request_with(vec![text_block("context", true)]);
        let mut extended = request_with(vec![text_block("context", true)]);
        extended.messages.push(MessageParam {
            role: MessageRole::User,
            content: MessageContent::Text("different tail".to_string()),
        });
        let a = fingerprint(&base).unwrap();
        let b = fingerprint(&extended).unwrap();
        assert_eq!(a.full(), b.full());
    }

    #[test]
    fn marker_position_changes_fingerprint() {
        let a = fingerprint(&request_with(vec![
            text_block("one", true),
            text_block("two", false),
        ]))
        .unwrap();
        let b = fingerprint(&request_with(vec![
            text_block("one", false),
            text_block("two", true),
        ]))
        .unwrap();
        assert_ne!(a.full(), b.full());
        // The shorter fingerprint is a prefix of the longer one.
        assert!(b.full().starts_with(a.full()));
    }

    #[test]
    fn tool_use_id_does_not_affect_fingerprint() {
        let make = |id: &str| {
            request_with(vec![
                ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: "search".to_string(),
                    input: serde_json::json!({"q": "rust"}),
                    cache_control: Some(CacheControl::ephemeral()),
                },
            ])
        };
        let a = fingerprint(&make("toolu_01")).unwrap();
        let b = fingerprint(&make("toolu_02")).unwrap();
        assert_eq!(a.full(), b.full());
    }

    #[test]
    fn one_hour_ttl_is_honored() {
        let mut request = request_with(vec![]);
        request.messages[0].content = MessageContent::Blocks(vec![ContentBlock::Text {
            text: "ctx".to_string(),
            cache_control: Some(CacheControl {
                r#type: "ephemeral".to_string(),
                ttl: Some("1h".to_string()),
            }),
        }]);
        let set = fingerprint(&request).unwrap();
        assert_eq!(set.ttl, EXTENDED_TTL);
    }

    #[test]
    fn router_prefix_lookup_and_sweep() {
        let router = CacheRouter::new();
        let set = FingerprintSet {
            prefixes: vec!["aaaa".to_string(), "aaaabbbb".to_string()],
            ttl: Duration::from_secs(300),
        };
        router.record_cache_usage(&set, "cred-1");
        assert_eq!(router.len(), 2);
        // Exact hit.
        assert_eq!(router.preferred_credential("aaaabbbb").as_deref(), Some("cred-1"));
        // Longer query matches stored prefix.
        assert_eq!(
            router.preferred_credential("aaaabbbbcccc").as_deref(),
            Some("cred-1")
        );
        // Shrunken breakpoint: query is a prefix of a stored key.
        assert_eq!(router.preferred_credential("aaaa").as_deref(), Some("cred-1"));
        assert!(router.preferred_credential("zzzz").is_none());
        router.clear();
        assert!(router.is_empty());
    }
}
