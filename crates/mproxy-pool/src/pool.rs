use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use mproxy_registry::{ModelFamily, Service, classify};

use crate::affinity::{CacheRouter, FingerprintSet};
use crate::credential::{Credential, CredentialPatch, DisabledReason};
use crate::lockout::LockoutQueue;
use crate::tunables::{key_reuse_delay, rate_limit_lockout};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    #[error("no usable credential for family {0}")]
    NoKeyAvailable(ModelFamily),
}

/// Inputs to one selection. The fingerprint, when present, was computed from
/// the request body during preprocessing.
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    pub fingerprint: Option<String>,
    /// For OpenRouter: whether the requested model is a `:free` variant.
    pub wants_free_tier: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub input: u64,
    pub output: u64,
}

/// Owner of every credential record. All mutation goes through methods here,
/// atomic with respect to `select`, which hands out snapshots.
pub struct CredentialPool {
    creds: RwLock<HashMap<String, Credential>>,
    by_service: RwLock<HashMap<Service, Vec<String>>>,
    affinity: CacheRouter,
    /// Signaled on every state change that can unblock a queued request.
    changed: Arc<Notify>,
    lockouts: Arc<LockoutQueue>,
}

impl CredentialPool {
    pub fn new() -> Self {
        let changed = Arc::new(Notify::new());
        let lockouts = Arc::new(LockoutQueue::new());
        lockouts.clone().spawn_expiry_task(changed.clone());
        Self {
            creds: RwLock::new(HashMap::new()),
            by_service: RwLock::new(HashMap::new()),
            affinity: CacheRouter::new(),
            changed,
            lockouts,
        }
    }

    pub fn affinity(&self) -> &CacheRouter {
        &self.affinity
    }

    /// Notifier poked whenever a credential becomes usable again (lockout
    /// expiry, re-enable, insert). Queue schedulers wait on this.
    pub fn change_notifier(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    pub async fn insert(&self, credential: Credential) {
        let hash = credential.hash.clone();
        let service = credential.service;
        self.creds.write().await.insert(hash.clone(), credential);
        let mut by_service = self.by_service.write().await;
        let hashes = by_service.entry(service).or_default();
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }
        drop(by_service);
        self.changed.notify_waiters();
    }

    pub async fn get(&self, hash: &str) -> Option<Credential> {
        self.creds.read().await.get(hash).cloned()
    }

    pub async fn list(&self, service: Service) -> Vec<Credential> {
        let hashes = {
            let guard = self.by_service.read().await;
            guard.get(&service).cloned().unwrap_or_default()
        };
        let creds = self.creds.read().await;
        hashes
            .iter()
            .filter_map(|hash| creds.get(hash).cloned())
            .collect()
    }

    /// Remaining time until at least one credential of the family is
    /// selectable. Zero when one is free now, or when the family has no
    /// candidates at all (selection will then fail fast instead of waiting).
    pub async fn lockout_remaining(&self, family: ModelFamily) -> Duration {
        let now = Instant::now();
        let creds = self.creds.read().await;
        let mut soonest: Option<Duration> = None;
        for credential in creds.values() {
            if credential.is_disabled
                || credential.is_revoked
                || !credential.model_families.contains(&family)
            {
                continue;
            }
            let remaining = credential.lockout_remaining(now);
            if remaining.is_zero() {
                return Duration::ZERO;
            }
            soonest = Some(match soonest {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        soonest.unwrap_or(Duration::ZERO)
    }

    /// Number of credentials that could ever serve this family (ignoring
    /// lockouts). Used by the queue to fail fast on empty families.
    pub async fn candidate_count(&self, family: ModelFamily) -> usize {
        let creds = self.creds.read().await;
        creds
            .values()
            .filter(|credential| {
                !credential.is_disabled
                    && !credential.is_revoked
                    && credential.model_families.contains(&family)
            })
            .count()
    }

    /// Selects a credential for `model` on `service` and returns a snapshot.
    ///
    /// Priority: cache affinity, then provider-specific boosts, then least
    /// recently used with a random tie-break. A locked-out candidate is only
    /// returned when every candidate is locked out (the queue should not have
    /// dispatched in that case, but selection must still be total).
    pub async fn select(
        &self,
        model: &str,
        service: Service,
        request: &SelectRequest,
    ) -> Result<Credential, SelectError> {
        let family = classify(service, model);
        let mut creds = self.creds.write().await;
        let now = Instant::now();

        let all: Vec<&Credential> = creds
            .values()
            .filter(|credential| credential.service == service && credential.can_serve(model))
            .collect();
        if all.is_empty() {
            return Err(SelectError::NoKeyAvailable(family));
        }

        let unlocked: Vec<&Credential> = all
            .iter()
            .copied()
            .filter(|credential| credential.lockout_remaining(now).is_zero())
            .collect();
        // When every candidate is locked the caller was not supposed to
        // dispatch; selection stays total and hands back the least-loaded one.
        let candidates: Vec<&Credential> = if unlocked.is_empty() {
            all.clone()
        } else {
            unlocked
        };

        let chosen_hash = self
            .pick(model, service, request, &all, &candidates, now)
            .ok_or(SelectError::NoKeyAvailable(family))?;

        let credential = creds
            .get_mut(&chosen_hash)
            .ok_or(SelectError::NoKeyAvailable(family))?;
        credential.last_used = Some(now);
        credential.prompt_count = credential.prompt_count.saturating_add(1);
        // Reuse throttle: push the lockout forward a beat so an in-flight
        // burst spreads across the pool.
        let reuse_until = now + key_reuse_delay(service);
        if credential
            .rate_limited_until
            .map(|until| until < reuse_until)
            .unwrap_or(true)
        {
            credential.rate_limited_at = Some(now);
            credential.rate_limited_until = Some(reuse_until);
        }
        let snapshot = credential.clone();
        drop(creds);
        self.lockouts.push(reuse_until).await;
        Ok(snapshot)
    }

    fn pick(
        &self,
        model: &str,
        service: Service,
        request: &SelectRequest,
        all: &[&Credential],
        candidates: &[&Credential],
        now: Instant,
    ) -> Option<String> {
        // 1. Cache affinity. A key that is only under the short reuse
        // throttle still wins (the cache hit outweighs burst spreading); a
        // key under a real rate-limit lockout does not.
        if let Some(fingerprint) = request.fingerprint.as_deref()
            && let Some(preferred) = self.affinity.preferred_credential(fingerprint)
            && let Some(candidate) = all.iter().find(|c| c.hash == preferred)
            && candidate.lockout_remaining(now) <= key_reuse_delay(service)
        {
            return Some(preferred);
        }

        // 2. Provider-specific boosts.
        if service == Service::Aws {
            let boosted: Vec<&&Credential> = candidates
                .iter()
                .filter(|credential| match &credential.kind {
                    crate::credential::CredentialKind::Aws {
                        inference_profile_ids,
                        ..
                    } => inference_profile_ids.iter().any(|id| id.contains(model)),
                    _ => false,
                })
                .collect();
            if !boosted.is_empty() {
                return Some(lru_pick(&boosted.into_iter().copied().collect::<Vec<_>>()));
            }
        }
        if service == Service::Openrouter {
            let (paid, free): (Vec<&Credential>, Vec<&Credential>) =
                candidates.iter().copied().partition(|credential| {
                    !matches!(
                        credential.kind,
                        crate::credential::CredentialKind::Openrouter {
                            is_free_tier: true,
                            ..
                        }
                    )
                });
            if request.wants_free_tier {
                if !free.is_empty() {
                    return Some(lru_pick(&free));
                }
            } else if !paid.is_empty() {
                let mut paid = paid;
                paid.sort_by(|a, b| {
                    let balance_a = a.kind.effective_balance().unwrap_or(0.0);
                    let balance_b = b.kind.effective_balance().unwrap_or(0.0);
                    balance_b
                        .partial_cmp(&balance_a)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                return Some(paid[0].hash.clone());
            }
            // Fall through to the other tier when the preferred one is empty.
        }

        // 3. Least recently used, random among ties.
        Some(lru_pick(candidates))
    }

    /// Applies the 429 lockout for the credential's service.
    pub async fn mark_rate_limited(&self, hash: &str) {
        let mut creds = self.creds.write().await;
        let Some(credential) = creds.get_mut(hash) else {
            return;
        };
        let now = Instant::now();
        let until = now + rate_limit_lockout(credential.service);
        credential.rate_limited_at = Some(now);
        credential.rate_limited_until = Some(until);
        drop(creds);
        self.lockouts.push(until).await;
        tracing::info!(event = "credential_rate_limited", credential = %hash);
    }

    pub async fn disable(&self, hash: &str, reason: DisabledReason) {
        let mut creds = self.creds.write().await;
        if let Some(credential) = creds.get_mut(hash) {
            credential.is_disabled = true;
            credential.disabled_reason = Some(reason);
            if reason == DisabledReason::Revoked {
                credential.is_revoked = true;
            }
            tracing::warn!(
                event = "credential_disabled",
                credential = %hash,
                reason = ?reason
            );
        }
    }

    pub async fn update(&self, hash: &str, patch: CredentialPatch) {
        let mut became_usable = false;
        {
            let mut creds = self.creds.write().await;
            if let Some(credential) = creds.get_mut(hash) {
                let was_usable = !credential.is_disabled && !credential.is_revoked;
                patch.apply(credential);
                became_usable =
                    !credential.is_disabled && !credential.is_revoked && !was_usable;
            }
        }
        if became_usable {
            self.changed.notify_waiters();
        }
    }

    /// Marks one family of a Google credential over quota without touching
    /// the rest of the key.
    pub async fn mark_family_over_quota(&self, hash: &str, family: ModelFamily) {
        let mut creds = self.creds.write().await;
        if let Some(credential) = creds.get_mut(hash)
            && let crate::credential::CredentialKind::Google {
                over_quota_families,
            } = &mut credential.kind
        {
            over_quota_families.insert(family);
            tracing::warn!(
                event = "credential_family_over_quota",
                credential = %hash,
                family = %family
            );
        }
    }

    pub async fn increment_usage(&self, hash: &str, family: ModelFamily, delta: UsageDelta) {
        let mut creds = self.creds.write().await;
        if let Some(credential) = creds.get_mut(hash) {
            let usage = credential.token_usage.entry(family).or_default();
            usage.input = usage.input.saturating_add(delta.input);
            usage.output = usage.output.saturating_add(delta.output);
        }
    }

    /// Records that `credential_hash` served the cacheable prefix described
    /// by `fingerprints`, so follow-ups land on the same key.
    pub fn record_cache_usage(&self, fingerprints: &FingerprintSet, credential_hash: &str) {
        self.affinity.record_cache_usage(fingerprints, credential_hash);
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

fn lru_pick(candidates: &[&Credential]) -> String {
    let oldest = candidates
        .iter()
        .map(|credential| credential.last_used)
        .min()
        .flatten();
    let ties: Vec<&&Credential> = match oldest {
        Some(oldest) => candidates
            .iter()
            .filter(|credential| credential.last_used == Some(oldest))
            .collect(),
        None => candidates
            .iter()
            .filter(|credential| credential.last_used.is_none())
            .collect(),
    };
    let pool = if ties.is_empty() {
        candidates.iter().collect::<Vec<_>>()
    } else {
        ties
    };
    let index = if pool.len() == 1 {
        0
    } else {
        rand::rng().random_range(0..pool.len())
    };
    pool[index].hash.clone()
}
