use std::sync::Arc;

use mproxy_common::IpLimitPolicy;
use mproxy_registry::{ModelFamily, Service};
use mproxy_users::{
    AuthOutcome, MemoryPersistence, QuotaCheck, UserKind, UserPatch, UserStore,
};
use time::OffsetDateTime;

async fn fresh_store(policy: IpLimitPolicy) -> Arc<UserStore> {
    Arc::new(
        UserStore::load(Arc::new(MemoryPersistence::new()), 2, policy)
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn authenticate_tracks_ips_and_limits() {
    let store = fresh_store(IpLimitPolicy::Limit).await;
    let user = store.create(UserPatch::default()).await;

    assert!(matches!(
        store.authenticate(&user.token, "1.1.1.1").await,
        AuthOutcome::Success(_)
    ));
    assert!(matches!(
        store.authenticate(&user.token, "2.2.2.2").await,
        AuthOutcome::Success(_)
    ));
    // Third distinct IP breaches the cap of 2.
    assert!(matches!(
        store.authenticate(&user.token, "3.3.3.3").await,
        AuthOutcome::Limited
    ));
    // A known IP keeps working.
    assert!(matches!(
        store.authenticate(&user.token, "1.1.1.1").await,
        AuthOutcome::Success(_)
    ));
    assert!(matches!(
        store.authenticate("missing", "1.1.1.1").await,
        AuthOutcome::NotFound
    ));
}

#[tokio::test]
async fn auto_ban_policy_disables_token() {
    let store = fresh_store(IpLimitPolicy::AutoBan).await;
    let user = store.create(UserPatch::default()).await;
    store.authenticate(&user.token, "1.1.1.1").await;
    store.authenticate(&user.token, "2.2.2.2").await;
    assert!(matches!(
        store.authenticate(&user.token, "3.3.3.3").await,
        AuthOutcome::Disabled
    ));
    assert!(matches!(
        store.authenticate(&user.token, "1.1.1.1").await,
        AuthOutcome::Disabled
    ));
}

#[tokio::test]
async fn quota_refusal_at_the_boundary() {
    let store = fresh_store(IpLimitPolicy::Limit).await;
    let user = store
        .create(UserPatch {
            token_limits: Some([(ModelFamily::Claude, 1000u64)].into_iter().collect()),
            ..Default::default()
        })
        .await;
    store
        .increment_token_count(&user.token, ModelFamily::Claude, 900, 50)
        .await;

    let admit = |requested| QuotaCheck {
        token: &user.token,
        service: Service::Anthropic,
        model: "claude-3-5-sonnet-20241022",
        requested,
    };
    assert!(store.has_available_quota(admit(50)).await);
    assert!(!store.has_available_quota(admit(100)).await);
}

#[tokio::test]
async fn temporary_user_expires_and_purges() {
    let store = fresh_store(IpLimitPolicy::Limit).await;
    let user = store
        .create(UserPatch {
            kind: Some(UserKind::Temporary),
            expires_at: Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)),
            ..Default::default()
        })
        .await;

    let (disabled, purged) = store.cleanup_expired(time::Duration::days(3)).await;
    assert_eq!(disabled, 1);
    assert_eq!(purged, 0);
    assert!(matches!(
        store.authenticate(&user.token, "1.1.1.1").await,
        AuthOutcome::Disabled
    ));

    // A zero purge window deletes anything already disabled.
    let (_, purged) = store.cleanup_expired(time::Duration::ZERO).await;
    assert_eq!(purged, 1);
    assert!(store.get(&user.token).await.is_none());
}

#[tokio::test]
async fn flush_round_trips_through_persistence() {
    let persistence = Arc::new(MemoryPersistence::new());
    let store = Arc::new(
        UserStore::load(persistence.clone(), 2, IpLimitPolicy::Limit)
            .await
            .unwrap(),
    );
    let user = store.create(UserPatch::default()).await;
    store
        .increment_token_count(&user.token, ModelFamily::Gpt4o, 11, 7)
        .await;
    store.flush().await;
    assert_eq!(store.dirty_count().await, 0);

    let reloaded = UserStore::load(persistence, 2, IpLimitPolicy::Limit)
        .await
        .unwrap();
    let row = reloaded.get(&user.token).await.unwrap();
    assert_eq!(row.token_counts[&ModelFamily::Gpt4o].input, 11);
    assert_eq!(row.token_counts[&ModelFamily::Gpt4o].output, 7);
}

#[tokio::test]
async fn refund_returns_admitted_tokens() {
    let store = fresh_store(IpLimitPolicy::Limit).await;
    let user = store.create(UserPatch::default()).await;
    store
        .increment_token_count(&user.token, ModelFamily::Claude, 100, 0)
        .await;
    store
        .refund_token_count(&user.token, ModelFamily::Claude, 40)
        .await;
    let row = store.get(&user.token).await.unwrap();
    assert_eq!(row.token_counts[&ModelFamily::Claude].input, 60);
    // Refunds clamp at zero rather than underflowing.
    store
        .refund_token_count(&user.token, ModelFamily::Claude, 1000)
        .await;
    let row = store.get(&user.token).await.unwrap();
    assert_eq!(row.token_counts[&ModelFamily::Claude].input, 0);
}
