use std::time::Duration;

use mproxy_pool::{
    Credential, CredentialPool, CredentialSeed, DisabledReason, FingerprintSet, SelectError,
    SelectRequest, UsageDelta,
};
use mproxy_registry::{ModelFamily, Service};
use tokio::time::Instant;

fn anthropic_key(secret: &str) -> Credential {
    Credential::from_seed(CredentialSeed {
        secret: secret.to_string(),
        service: Service::Anthropic,
        model_families: None,
        kind: None,
    })
}

#[tokio::test]
async fn select_skips_disabled_and_revoked() {
    let pool = CredentialPool::new();
    let good = anthropic_key("sk-ant-good");
    let bad = anthropic_key("sk-ant-bad");
    let bad_hash = bad.hash.clone();
    let good_hash = good.hash.clone();
    pool.insert(good).await;
    pool.insert(bad).await;
    pool.disable(&bad_hash, DisabledReason::Revoked).await;

    for _ in 0..5 {
        let chosen = pool
            .select(
                "claude-3-5-sonnet-20241022",
                Service::Anthropic,
                &SelectRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(chosen.hash, good_hash);
    }
}

#[tokio::test]
async fn no_candidates_fails_with_family() {
    let pool = CredentialPool::new();
    let err = pool
        .select(
            "claude-3-opus-20240229",
            Service::Anthropic,
            &SelectRequest::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SelectError::NoKeyAvailable(ModelFamily::ClaudeOpus)
    ));
}

#[tokio::test]
async fn rate_limit_sets_lockout_and_remaining() {
    let pool = CredentialPool::new();
    let cred = anthropic_key("sk-ant-limited");
    let hash = cred.hash.clone();
    pool.insert(cred).await;

    assert_eq!(
        pool.lockout_remaining(ModelFamily::Claude).await,
        Duration::ZERO
    );
    pool.mark_rate_limited(&hash).await;
    let remaining = pool.lockout_remaining(ModelFamily::Claude).await;
    assert!(remaining > Duration::from_millis(500));

    let stored = pool.get(&hash).await.unwrap();
    let (at, until) = (
        stored.rate_limited_at.unwrap(),
        stored.rate_limited_until.unwrap(),
    );
    assert!(until >= at);
}

#[tokio::test]
async fn select_applies_reuse_throttle() {
    let pool = CredentialPool::new();
    pool.insert(anthropic_key("sk-ant-reuse")).await;

    let first = pool
        .select(
            "claude-3-5-sonnet-20241022",
            Service::Anthropic,
            &SelectRequest::default(),
        )
        .await
        .unwrap();
    let until = first.rate_limited_until.expect("reuse throttle set");
    assert!(until > Instant::now());
    // With a single key the pool still serves it while throttled: the queue,
    // not select, is responsible for pacing.
    let second = pool
        .select(
            "claude-3-5-sonnet-20241022",
            Service::Anthropic,
            &SelectRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(first.hash, second.hash);
}

#[tokio::test]
async fn selection_rotates_by_lru() {
    let pool = CredentialPool::new();
    pool.insert(anthropic_key("sk-ant-a")).await;
    pool.insert(anthropic_key("sk-ant-b")).await;

    let first = pool
        .select(
            "claude-3-5-sonnet-20241022",
            Service::Anthropic,
            &SelectRequest::default(),
        )
        .await
        .unwrap();
    let second = pool
        .select(
            "claude-3-5-sonnet-20241022",
            Service::Anthropic,
            &SelectRequest::default(),
        )
        .await
        .unwrap();
    assert_ne!(first.hash, second.hash, "lru should rotate across the pool");
}

#[tokio::test]
async fn cache_affinity_beats_lru() {
    let pool = CredentialPool::new();
    let a = anthropic_key("sk-ant-sticky-a");
    let sticky = a.hash.clone();
    pool.insert(a).await;
    pool.insert(anthropic_key("sk-ant-sticky-b")).await;

    let fingerprints = FingerprintSet {
        prefixes: vec!["feedface".to_string()],
        ttl: Duration::from_secs(300),
    };
    pool.record_cache_usage(&fingerprints, &sticky);

    for _ in 0..4 {
        let chosen = pool
            .select(
                "claude-3-5-sonnet-20241022",
                Service::Anthropic,
                &SelectRequest {
                    fingerprint: Some("feedface".to_string()),
                    wants_free_tier: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(chosen.hash, sticky);
    }
}

#[tokio::test]
async fn usage_increments_are_saturating_and_per_family() {
    let pool = CredentialPool::new();
    let cred = anthropic_key("sk-ant-usage");
    let hash = cred.hash.clone();
    pool.insert(cred).await;

    pool.increment_usage(
        &hash,
        ModelFamily::Claude,
        UsageDelta {
            input: 10,
            output: 5,
        },
    )
    .await;
    pool.increment_usage(
        &hash,
        ModelFamily::ClaudeOpus,
        UsageDelta {
            input: u64::MAX,
            output: 1,
        },
    )
    .await;
    pool.increment_usage(
        &hash,
        ModelFamily::ClaudeOpus,
        UsageDelta { input: 7, output: 0 },
    )
    .await;

    let stored = pool.get(&hash).await.unwrap();
    assert_eq!(stored.token_usage[&ModelFamily::Claude].input, 10);
    assert_eq!(stored.token_usage[&ModelFamily::Claude].output, 5);
    assert_eq!(stored.token_usage[&ModelFamily::ClaudeOpus].input, u64::MAX);
}
