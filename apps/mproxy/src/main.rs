use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use mproxy_core::{Engine, EngineConfig, EventHub, TracingSink, UpstreamClientConfig};
use mproxy_pool::checker::HealthChecker;
use mproxy_pool::{Credential, CredentialPool, CredentialSeed};
use mproxy_users::{MemoryPersistence, SqliteStore, User, UserPersistence, UserStore, spawn_store_jobs};

mod cli;

/// On-disk bootstrap file: upstream credentials plus optional seed users.
#[derive(Debug, Deserialize)]
struct FileConfig {
    credentials: Vec<CredentialSeed>,
    #[serde(default)]
    users: Vec<User>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let patch = cli::Cli::parse().into_patch();
    let global = patch.into_config().context("incomplete configuration")?;

    let file: FileConfig = {
        let raw = std::fs::read(&global.config_path)
            .with_context(|| format!("reading {}", global.config_path))?;
        serde_json::from_slice(&raw).context("parsing config file")?
    };

    // Credential pool.
    let pool = Arc::new(CredentialPool::new());
    let mut loaded = 0usize;
    for seed in file.credentials {
        pool.insert(Credential::from_seed(seed)).await;
        loaded += 1;
    }
    info!(event = "credentials_loaded", count = loaded);

    // User store with pluggable persistence.
    let persistence: Arc<dyn UserPersistence> = match &global.dsn {
        Some(dsn) => Arc::new(
            SqliteStore::connect(dsn)
                .await
                .with_context(|| format!("connecting {dsn}"))?,
        ),
        None => Arc::new(MemoryPersistence::new()),
    };
    let users = Arc::new(
        UserStore::load(persistence, global.max_ips_per_user, global.ip_limit_policy)
            .await
            .context("loading user store")?,
    );
    for user in file.users {
        users.seed(user).await;
    }
    spawn_store_jobs(
        users.clone(),
        Duration::from_secs(global.quota_refresh_interval_secs),
        time::Duration::days(i64::from(global.purge_after_days)),
    );

    // Health checkers: once at startup, then on a cadence.
    let checker = Arc::new(
        HealthChecker::new(pool.clone(), global.proxy.as_deref())
            .context("building health checker")?,
    );
    checker.spawn();

    // Cache-affinity sweeper.
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let swept = pool.affinity().sweep_expired();
                if swept > 0 {
                    tracing::debug!(event = "affinity_swept", entries = swept);
                }
            }
        });
    }

    // Events.
    let events = EventHub::new(256);
    events.add_sink(Arc::new(TracingSink)).await;

    // Upstream client + engine.
    let upstream = Arc::new(
        mproxy_core::WreqUpstreamClient::new(UpstreamClientConfig {
            proxy: global.proxy.clone(),
            ..Default::default()
        })
        .context("building upstream client")?,
    );
    let engine = Engine::new(
        pool,
        users,
        upstream,
        events,
        EngineConfig {
            data_dir: global.data_dir.clone(),
            proxy: global.proxy.clone(),
            prefer_native_count: true,
        },
    )
    .context("building engine")?;

    let app = mproxy_router::proxy_router(engine, global.proxy_password.clone());
    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
