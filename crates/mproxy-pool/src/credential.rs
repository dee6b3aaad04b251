use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::time::Instant;

use mproxy_registry::{ModelFamily, Service, classify};

/// Stable public identifier for a credential: first 8 hex chars of the
/// SHA-256 of its secret. Safe to log and expose on admin surfaces.
pub fn credential_hash(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..4])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    Revoked,
    Quota,
    Manual,
    UnsafeLogging,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    /// Carried over from pre-split accounting; never written after migration.
    #[serde(default)]
    pub legacy_total: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.legacy_total)
    }
}

/// Provider-specific extension data, dispatched on by the pool and the
/// outbound mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Aws {
        region: String,
        /// `None` until the logging probe has run; `Some(true)` means
        /// invocation logging is enabled and the key must not serve traffic.
        #[serde(default)]
        logging_enabled: Option<bool>,
        #[serde(default)]
        model_ids: Vec<String>,
        #[serde(default)]
        inference_profile_ids: Vec<String>,
    },
    Gcp {
        region: String,
        project_id: String,
        client_email: String,
        private_key: String,
        #[serde(default)]
        access_token: String,
        #[serde(default)]
        token_expires_at: i64,
    },
    Anthropic {
        #[serde(default)]
        tier: Option<String>,
        #[serde(default)]
        is_pozzed: bool,
        #[serde(default)]
        requires_preamble: bool,
        #[serde(default = "default_true")]
        allows_multimodality: bool,
    },
    Openrouter {
        #[serde(default)]
        is_free_tier: bool,
        #[serde(default)]
        account_balance: Option<f64>,
        #[serde(default)]
        limit_remaining: Option<f64>,
        #[serde(default)]
        key_limit: Option<f64>,
    },
    Google {
        #[serde(default)]
        over_quota_families: BTreeSet<ModelFamily>,
    },
    Azure {
        resource_name: String,
        #[serde(default = "default_azure_api_version")]
        api_version: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_azure_api_version() -> String {
    "2024-12-01-preview".to_string()
}

impl CredentialKind {
    /// Paid OpenRouter keys sort by how much money they can actually spend.
    pub fn effective_balance(&self) -> Option<f64> {
        match self {
            CredentialKind::Openrouter {
                account_balance,
                limit_remaining,
                ..
            } => match (account_balance, limit_remaining) {
                (Some(balance), Some(remaining)) => Some(balance.min(*remaining)),
                (Some(balance), None) => Some(*balance),
                (None, Some(remaining)) => Some(*remaining),
                (None, None) => None,
            },
            _ => None,
        }
    }
}

/// Runtime credential record. Owned by the pool; `select` returns clones.
#[derive(Debug, Clone)]
pub struct Credential {
    pub hash: String,
    pub secret: String,
    pub service: Service,
    pub model_families: BTreeSet<ModelFamily>,
    pub kind: CredentialKind,
    pub is_disabled: bool,
    pub disabled_reason: Option<DisabledReason>,
    pub is_revoked: bool,
    pub prompt_count: u64,
    pub last_used: Option<Instant>,
    pub last_checked: Option<OffsetDateTime>,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub token_usage: BTreeMap<ModelFamily, TokenUsage>,
}

impl Credential {
    pub fn from_seed(seed: CredentialSeed) -> Self {
        let hash = credential_hash(&seed.secret);
        let model_families = match seed.model_families {
            Some(families) if !families.is_empty() => families,
            _ => default_families(seed.service),
        };
        let kind = seed.kind.unwrap_or(default_kind(seed.service));
        Self {
            hash,
            secret: seed.secret,
            service: seed.service,
            model_families,
            kind,
            is_disabled: false,
            disabled_reason: None,
            is_revoked: false,
            prompt_count: 0,
            last_used: None,
            last_checked: None,
            rate_limited_at: None,
            rate_limited_until: None,
            token_usage: BTreeMap::new(),
        }
    }

    pub fn lockout_remaining(&self, now: Instant) -> std::time::Duration {
        match self.rate_limited_until {
            Some(until) if until > now => until - now,
            _ => std::time::Duration::ZERO,
        }
    }

    /// Whether this credential may serve `model` at all, independent of
    /// lockout state.
    pub fn can_serve(&self, model: &str) -> bool {
        if self.is_disabled || self.is_revoked {
            return false;
        }
        let family = classify(self.service, model);
        if !self.model_families.contains(&family) {
            return false;
        }
        match &self.kind {
            // Keys with invocation logging enabled never serve traffic.
            CredentialKind::Aws {
                logging_enabled, ..
            } => !logging_enabled.unwrap_or(false),
            CredentialKind::Google {
                over_quota_families,
            } => !over_quota_families.contains(&family),
            _ => true,
        }
    }
}

fn default_kind(service: Service) -> CredentialKind {
    match service {
        Service::Anthropic => CredentialKind::Anthropic {
            tier: None,
            is_pozzed: false,
            requires_preamble: false,
            allows_multimodality: true,
        },
        Service::Openrouter => CredentialKind::Openrouter {
            is_free_tier: false,
            account_balance: None,
            limit_remaining: None,
            key_limit: None,
        },
        Service::GoogleAi => CredentialKind::Google {
            over_quota_families: BTreeSet::new(),
        },
        _ => CredentialKind::ApiKey,
    }
}

fn default_families(service: Service) -> BTreeSet<ModelFamily> {
    ModelFamily::all()
        .iter()
        .copied()
        .filter(|family| family.service() == service)
        .collect()
}

/// Configuration-file form of a credential. Everything except the secret and
/// service is optional and derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSeed {
    pub secret: String,
    pub service: Service,
    #[serde(default)]
    pub model_families: Option<BTreeSet<ModelFamily>>,
    #[serde(flatten)]
    pub kind: Option<CredentialKind>,
}

/// Partial update applied by health checkers and the response middleware.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub is_disabled: Option<bool>,
    pub disabled_reason: Option<Option<DisabledReason>>,
    pub is_revoked: Option<bool>,
    pub model_families: Option<BTreeSet<ModelFamily>>,
    pub kind: Option<CredentialKind>,
    pub last_checked: Option<OffsetDateTime>,
}

impl CredentialPatch {
    pub fn apply(self, credential: &mut Credential) {
        if let Some(value) = self.is_disabled {
            credential.is_disabled = value;
        }
        if let Some(value) = self.disabled_reason {
            credential.disabled_reason = value;
        }
        if let Some(value) = self.is_revoked {
            credential.is_revoked = value;
        }
        if let Some(value) = self.model_families {
            credential.model_families = value;
        }
        if let Some(value) = self.kind {
            credential.kind = value;
        }
        if let Some(value) = self.last_checked {
            credential.last_checked = Some(value);
        }
    }
}
