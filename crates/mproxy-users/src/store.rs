use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use mproxy_common::IpLimitPolicy;
use mproxy_registry::{ModelFamily, Service, classify};

use crate::persistence::UserPersistence;
use crate::user::{User, UserKind, UserPatch};

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),
}

#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Success(Box<User>),
    NotFound,
    Disabled,
    /// Token is valid but the request came from one IP too many.
    Limited,
}

/// Inputs to one quota admission check.
#[derive(Debug, Clone)]
pub struct QuotaCheck<'a> {
    pub token: &'a str,
    pub service: Service,
    pub model: &'a str,
    pub requested: u64,
}

pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
    dirty: Mutex<HashSet<String>>,
    flush_in_progress: AtomicBool,
    persistence: Arc<dyn UserPersistence>,
    max_ips_default: u32,
    ip_limit_policy: IpLimitPolicy,
}

impl UserStore {
    pub async fn load(
        persistence: Arc<dyn UserPersistence>,
        max_ips_default: u32,
        ip_limit_policy: IpLimitPolicy,
    ) -> Result<Self, UserStoreError> {
        let rows = persistence.load_all().await?;
        let mut users = HashMap::with_capacity(rows.len());
        for user in rows {
            users.insert(user.token.clone(), user);
        }
        info!(event = "user_store_loaded", count = users.len());
        Ok(Self {
            users: RwLock::new(users),
            dirty: Mutex::new(HashSet::new()),
            flush_in_progress: AtomicBool::new(false),
            persistence,
            max_ips_default,
            ip_limit_policy,
        })
    }

    pub async fn create(&self, patch: UserPatch) -> User {
        let token = uuid::Uuid::new_v4().to_string();
        let mut user = User::new(token.clone(), OffsetDateTime::now_utc());
        patch.apply(&mut user);
        self.users.write().await.insert(token.clone(), user.clone());
        self.mark_dirty(&token).await;
        user
    }

    /// Seeds a user loaded from the config file; keeps an existing record.
    pub async fn seed(&self, user: User) {
        let mut users = self.users.write().await;
        if !users.contains_key(&user.token) {
            let token = user.token.clone();
            users.insert(token.clone(), user);
            drop(users);
            self.mark_dirty(&token).await;
        }
    }

    pub async fn get(&self, token: &str) -> Option<User> {
        self.users.read().await.get(token).cloned()
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn upsert(&self, token: &str, patch: UserPatch) -> Result<User, UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(token).ok_or(UserStoreError::NotFound)?;
        patch.apply(user);
        let snapshot = user.clone();
        drop(users);
        self.mark_dirty(token).await;
        Ok(snapshot)
    }

    /// Authenticates the token and enforces the distinct-IP cap. An unseen IP
    /// is appended; at the cap the policy decides between rejection and
    /// auto-disable. Special users bypass the cap.
    pub async fn authenticate(&self, token: &str, ip: &str) -> AuthOutcome {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(token) else {
            return AuthOutcome::NotFound;
        };
        if user.is_disabled() {
            return AuthOutcome::Disabled;
        }

        let now = OffsetDateTime::now_utc();
        if user.kind == UserKind::Temporary
            && let Some(expires_at) = user.expires_at
            && now >= expires_at
        {
            user.disabled_at = Some(now);
            user.disabled_reason = Some("expired".to_string());
            let token = token.to_string();
            drop(users);
            self.mark_dirty(&token).await;
            return AuthOutcome::Disabled;
        }

        user.last_used_at = Some(now);
        if !user.ip.iter().any(|known| known == ip) {
            let cap = user.max_ips.unwrap_or(self.max_ips_default);
            if user.kind != UserKind::Special && cap > 0 && user.ip.len() as u32 >= cap {
                match self.ip_limit_policy {
                    IpLimitPolicy::AutoBan => {
                        user.disabled_at = Some(now);
                        user.disabled_reason = Some("ip_limit".to_string());
                        warn!(event = "user_auto_banned", token = %redact(token));
                        let token = token.to_string();
                        drop(users);
                        self.mark_dirty(&token).await;
                        return AuthOutcome::Disabled;
                    }
                    IpLimitPolicy::Limit => return AuthOutcome::Limited,
                }
            }
            user.ip.push(ip.to_string());
        }
        let snapshot = user.clone();
        drop(users);
        self.mark_dirty(token).await;
        AuthOutcome::Success(Box::new(snapshot))
    }

    pub async fn has_available_quota(&self, check: QuotaCheck<'_>) -> bool {
        let family = classify(check.service, check.model);
        let users = self.users.read().await;
        match users.get(check.token) {
            Some(user) => user.has_available_quota(family, check.requested),
            None => false,
        }
    }

    pub async fn increment_token_count(
        &self,
        token: &str,
        family: ModelFamily,
        input: u64,
        output: u64,
    ) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(token) {
            let counts = user.token_counts.entry(family).or_default();
            counts.input = counts.input.saturating_add(input);
            counts.output = counts.output.saturating_add(output);
            drop(users);
            self.mark_dirty(token).await;
        }
    }

    /// Returns tokens to the user after a refund (content filter): admission
    /// charged `input` tokens that upstream never billed.
    pub async fn refund_token_count(&self, token: &str, family: ModelFamily, input: u64) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(token) {
            let counts = user.token_counts.entry(family).or_default();
            counts.input = counts.input.saturating_sub(input);
            drop(users);
            self.mark_dirty(token).await;
        }
    }

    pub async fn increment_prompt_count(&self, token: &str) {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(token) {
            user.prompt_count = user.prompt_count.saturating_add(1);
            drop(users);
            self.mark_dirty(token).await;
        }
    }

    pub async fn refresh_quota(&self, token: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(token).ok_or(UserStoreError::NotFound)?;
        user.refresh_quota();
        drop(users);
        self.mark_dirty(token).await;
        Ok(())
    }

    pub async fn refresh_all_quotas(&self) -> usize {
        let mut refreshed = 0;
        let mut users = self.users.write().await;
        let mut dirty: Vec<String> = Vec::new();
        for user in users.values_mut() {
            if user.token_refresh.values().any(|refresh| *refresh > 0) {
                user.refresh_quota();
                dirty.push(user.token.clone());
                refreshed += 1;
            }
        }
        drop(users);
        for token in dirty {
            self.mark_dirty(&token).await;
        }
        info!(event = "quota_refreshed", users = refreshed);
        refreshed
    }

    pub async fn reset_usage(&self, token: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(token).ok_or(UserStoreError::NotFound)?;
        user.token_counts.clear();
        user.prompt_count = 0;
        drop(users);
        self.mark_dirty(token).await;
        Ok(())
    }

    pub async fn disable(&self, token: &str, reason: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(token).ok_or(UserStoreError::NotFound)?;
        user.disabled_at = Some(OffsetDateTime::now_utc());
        user.disabled_reason = Some(reason.to_string());
        drop(users);
        self.mark_dirty(token).await;
        Ok(())
    }

    /// Minute job: expire temporary tokens, purge tokens disabled longer than
    /// the window. Already-admitted requests are not cancelled.
    pub async fn cleanup_expired(&self, purge_window: Duration) -> (usize, usize) {
        let now = OffsetDateTime::now_utc();
        let mut disabled = 0;
        let mut purged: Vec<String> = Vec::new();
        {
            let mut users = self.users.write().await;
            for user in users.values_mut() {
                if user.kind == UserKind::Temporary
                    && !user.is_disabled()
                    && user.expires_at.map(|at| now >= at).unwrap_or(false)
                {
                    user.disabled_at = Some(now);
                    user.disabled_reason = Some("expired".to_string());
                    disabled += 1;
                }
            }
            users.retain(|token, user| {
                let purge = user
                    .disabled_at
                    .map(|at| now - at >= purge_window)
                    .unwrap_or(false);
                if purge {
                    purged.push(token.clone());
                }
                !purge
            });
        }
        for token in &purged {
            self.dirty.lock().await.remove(token);
        }
        if !purged.is_empty()
            && let Err(err) = self.persistence.delete_batch(&purged).await
        {
            warn!(event = "user_purge_failed", error = %err);
        }
        (disabled, purged.len())
    }

    async fn mark_dirty(&self, token: &str) {
        self.dirty.lock().await.insert(token.to_string());
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.lock().await.len()
    }

    /// One flush pass by the single writer task. Guarded by a
    /// flush-in-progress flag; on failure the dirty set is retained.
    pub async fn flush(&self) {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let tokens: Vec<String> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().collect()
        };
        if tokens.is_empty() {
            self.flush_in_progress.store(false, Ordering::Release);
            return;
        }

        let snapshot: Vec<User> = {
            let users = self.users.read().await;
            tokens
                .iter()
                .filter_map(|token| users.get(token).cloned())
                .collect()
        };

        if let Err(err) = self.persistence.upsert_batch(&snapshot).await {
            warn!(event = "user_flush_failed", error = %err, retained = tokens.len());
            let mut dirty = self.dirty.lock().await;
            for token in tokens {
                dirty.insert(token);
            }
        }
        self.flush_in_progress.store(false, Ordering::Release);
    }
}

fn redact(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}***", &token[..8])
}
