use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::store::UserStore;

const FLUSH_INTERVAL: Duration = Duration::from_secs(20);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the store's background jobs: the single flush writer, the quota
/// refresh pass and the expiry/purge sweep.
pub fn spawn_store_jobs(
    store: Arc<UserStore>,
    quota_refresh_interval: Duration,
    purge_window: time::Duration,
) {
    {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                store.flush().await;
            }
        });
    }

    {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(quota_refresh_interval).await;
                store.refresh_all_quotas().await;
            }
        });
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            let (disabled, purged) = store.cleanup_expired(purge_window).await;
            if disabled > 0 || purged > 0 {
                info!(event = "user_cleanup", disabled, purged);
            }
        }
    });
}
