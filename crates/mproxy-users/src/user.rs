use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use mproxy_registry::ModelFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    #[default]
    Normal,
    /// Expires at `expires_at`, is disabled, then purged after a grace window.
    Temporary,
    /// Bypasses quota and IP limits.
    Special,
}

/// Per-family token counters. Deserializes from either the split form or a
/// legacy bare number, which migrates to `{0, 0, legacy_total: n}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub legacy_total: u64,
}

impl TokenCounts {
    pub fn consumed(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.legacy_total)
    }
}

impl<'de> Deserialize<'de> for TokenCounts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Legacy(u64),
            Split {
                #[serde(default)]
                input: u64,
                #[serde(default)]
                output: u64,
                #[serde(default)]
                legacy_total: u64,
            },
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Legacy(n) => TokenCounts {
                input: 0,
                output: 0,
                legacy_total: n,
            },
            Raw::Split {
                input,
                output,
                legacy_total,
            } => TokenCounts {
                input,
                output,
                legacy_total,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub token: String,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: UserKind,
    #[serde(default)]
    pub prompt_count: u64,
    #[serde(default)]
    pub token_counts: BTreeMap<ModelFamily, TokenCounts>,
    /// Flat caps; zero (or absent) means unlimited.
    #[serde(default)]
    pub token_limits: BTreeMap<ModelFamily, u64>,
    /// Increment granted by each quota refresh pass.
    #[serde(default)]
    pub token_refresh: BTreeMap<ModelFamily, u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub disabled_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Per-user override of the global distinct-IP cap.
    #[serde(default)]
    pub max_ips: Option<u32>,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl User {
    pub fn new(token: String, now: OffsetDateTime) -> Self {
        Self {
            token,
            ip: Vec::new(),
            kind: UserKind::Normal,
            prompt_count: 0,
            token_counts: BTreeMap::new(),
            token_limits: BTreeMap::new(),
            token_refresh: BTreeMap::new(),
            created_at: now,
            last_used_at: None,
            disabled_at: None,
            expires_at: None,
            max_ips: None,
            disabled_reason: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }

    pub fn consumed(&self, family: ModelFamily) -> u64 {
        self.token_counts
            .get(&family)
            .map(TokenCounts::consumed)
            .unwrap_or(0)
    }

    /// Admission law: unlimited when the cap is zero, otherwise
    /// `consumed + requested <= limit`.
    pub fn has_available_quota(&self, family: ModelFamily, requested: u64) -> bool {
        if self.kind == UserKind::Special {
            return true;
        }
        let limit = self.token_limits.get(&family).copied().unwrap_or(0);
        if limit == 0 {
            return true;
        }
        self.consumed(family).saturating_add(requested) <= limit
    }

    /// `limit = consumed + refresh`: the user always gains the full refresh
    /// increment regardless of overshoot. `legacy_total` is preserved.
    pub fn refresh_quota(&mut self) {
        for (family, refresh) in self.token_refresh.clone() {
            if refresh == 0 {
                continue;
            }
            let consumed = self.consumed(family);
            self.token_limits
                .insert(family, consumed.saturating_add(refresh));
        }
    }
}

/// Admin-facing partial update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub kind: Option<UserKind>,
    pub token_limits: Option<BTreeMap<ModelFamily, u64>>,
    pub token_refresh: Option<BTreeMap<ModelFamily, u64>>,
    pub expires_at: Option<OffsetDateTime>,
    pub max_ips: Option<u32>,
    pub meta: Option<serde_json::Value>,
}

impl UserPatch {
    pub fn apply(self, user: &mut User) {
        if let Some(kind) = self.kind {
            user.kind = kind;
        }
        if let Some(limits) = self.token_limits {
            user.token_limits = limits;
        }
        if let Some(refresh) = self.token_refresh {
            user.token_refresh = refresh;
        }
        if let Some(expires_at) = self.expires_at {
            user.expires_at = Some(expires_at);
        }
        if let Some(max_ips) = self.max_ips {
            user.max_ips = Some(max_ips);
        }
        if let Some(meta) = self.meta {
            user.meta = meta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_counter_migrates_to_legacy_total() {
        let counts: TokenCounts = serde_json::from_str("12345").unwrap();
        assert_eq!(counts.input, 0);
        assert_eq!(counts.output, 0);
        assert_eq!(counts.legacy_total, 12345);
        assert_eq!(counts.consumed(), 12345);

        let split: TokenCounts =
            serde_json::from_str(r#"{"input": 10, "output": 20}"#).unwrap();
        assert_eq!(split.consumed(), 30);
    }

    #[test]
    fn quota_admission_law() {
        let mut user = User::new("t".to_string(), OffsetDateTime::UNIX_EPOCH);
        user.token_limits.insert(ModelFamily::Claude, 1000);
        user.token_counts.insert(
            ModelFamily::Claude,
            TokenCounts {
                input: 900,
                output: 50,
                legacy_total: 0,
            },
        );
        assert!(user.has_available_quota(ModelFamily::Claude, 50));
        assert!(!user.has_available_quota(ModelFamily::Claude, 100));
        // Zero limit means unlimited.
        assert!(user.has_available_quota(ModelFamily::Gpt4, u64::MAX / 2));
    }

    #[test]
    fn special_bypasses_quota() {
        let mut user = User::new("t".to_string(), OffsetDateTime::UNIX_EPOCH);
        user.kind = UserKind::Special;
        user.token_limits.insert(ModelFamily::Claude, 1);
        user.token_counts.insert(
            ModelFamily::Claude,
            TokenCounts {
                input: 100,
                output: 0,
                legacy_total: 0,
            },
        );
        assert!(user.has_available_quota(ModelFamily::Claude, u64::MAX / 2));
    }

    #[test]
    fn refresh_grants_full_increment_and_keeps_legacy() {
        let mut user = User::new("t".to_string(), OffsetDateTime::UNIX_EPOCH);
        user.token_limits.insert(ModelFamily::Claude, 1000);
        user.token_refresh.insert(ModelFamily::Claude, 500);
        user.token_counts.insert(
            ModelFamily::Claude,
            TokenCounts {
                input: 700,
                output: 600,
                legacy_total: 250,
            },
        );
        user.refresh_quota();
        assert_eq!(user.token_limits[&ModelFamily::Claude], 1550 + 500);
        assert_eq!(
            user.token_counts[&ModelFamily::Claude].legacy_total,
            250,
            "refresh must not clear legacy counters"
        );
    }
}
