use clap::Parser;

use mproxy_common::{GlobalConfigPatch, IpLimitPolicy};

/// Multi-provider LLM reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "mproxy", version, about)]
pub struct Cli {
    /// Bind address.
    #[arg(long, env = "MPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "MPROXY_PORT")]
    pub port: Option<u16>,

    /// Path to the JSON file holding credentials and seed users.
    #[arg(long, env = "MPROXY_CONFIG")]
    pub config: Option<String>,

    /// Shared secret accepted in place of a user token.
    #[arg(long, env = "MPROXY_PASSWORD")]
    pub proxy_password: Option<String>,

    /// Outbound proxy for upstream egress.
    #[arg(long, env = "MPROXY_PROXY")]
    pub proxy: Option<String>,

    /// SQLite DSN for the user store (e.g. sqlite://mproxy.db?mode=rwc).
    #[arg(long, env = "MPROXY_DSN")]
    pub dsn: Option<String>,

    /// Directory for cached artifacts.
    #[arg(long, env = "MPROXY_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Distinct-IP cap per user token.
    #[arg(long, env = "MPROXY_MAX_IPS")]
    pub max_ips: Option<u32>,

    /// Disable tokens that breach the IP cap instead of rejecting requests.
    #[arg(long, env = "MPROXY_IP_AUTOBAN")]
    pub ip_autoban: bool,

    /// Seconds between quota refresh passes.
    #[arg(long, env = "MPROXY_QUOTA_REFRESH_SECS")]
    pub quota_refresh_secs: Option<u64>,
}

impl Cli {
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            config_path: self.config,
            proxy_password: self.proxy_password,
            proxy: self.proxy,
            dsn: self.dsn,
            data_dir: self.data_dir,
            event_redact_sensitive: None,
            max_ips_per_user: self.max_ips,
            ip_limit_policy: self.ip_autoban.then_some(IpLimitPolicy::AutoBan),
            quota_refresh_interval_secs: self.quota_refresh_secs,
            purge_after_days: None,
        }
    }
}
