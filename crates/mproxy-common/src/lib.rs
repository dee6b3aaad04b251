use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Policy applied when a user token is seen from more distinct IPs than its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IpLimitPolicy {
    /// Reject the request but leave the token usable.
    #[default]
    Limit,
    /// Disable the token outright.
    AutoBan,
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Path to the JSON file holding upstream credentials and seed users.
    pub config_path: String,
    /// Shared secret accepted in place of a user token (no quota attached).
    pub proxy_password: Option<String>,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Optional SQLite DSN for the user store; in-memory persistence when absent.
    pub dsn: Option<String>,
    /// Directory for cached artifacts (tokenizers).
    pub data_dir: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Distinct-IP cap applied to users that carry no per-user override.
    pub max_ips_per_user: u32,
    pub ip_limit_policy: IpLimitPolicy,
    /// Seconds between quota refresh passes.
    pub quota_refresh_interval_secs: u64,
    /// Days a disabled token is retained before the cleanup job purges it.
    pub purge_after_days: u32,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config_path: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub data_dir: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub max_ips_per_user: Option<u32>,
    pub ip_limit_policy: Option<IpLimitPolicy>,
    pub quota_refresh_interval_secs: Option<u64>,
    pub purge_after_days: Option<u32>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
        if other.proxy_password.is_some() {
            self.proxy_password = other.proxy_password;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.max_ips_per_user.is_some() {
            self.max_ips_per_user = other.max_ips_per_user;
        }
        if other.ip_limit_policy.is_some() {
            self.ip_limit_policy = other.ip_limit_policy;
        }
        if other.quota_refresh_interval_secs.is_some() {
            self.quota_refresh_interval_secs = other.quota_refresh_interval_secs;
        }
        if other.purge_after_days.is_some() {
            self.purge_after_days = other.purge_after_days;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(7860),
            config_path: self
                .config_path
                .ok_or(GlobalConfigError::MissingField("config_path"))?,
            proxy_password: self.proxy_password,
            proxy: self.proxy,
            dsn: self.dsn,
            data_dir: self.data_dir.unwrap_or_else(|| "./data".to_string()),
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            max_ips_per_user: self.max_ips_per_user.unwrap_or(2),
            ip_limit_policy: self.ip_limit_policy.unwrap_or_default(),
            quota_refresh_interval_secs: self.quota_refresh_interval_secs.unwrap_or(86_400),
            purge_after_days: self.purge_after_days.unwrap_or(3),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            config_path: Some(value.config_path),
            proxy_password: value.proxy_password,
            proxy: value.proxy,
            dsn: value.dsn,
            data_dir: Some(value.data_dir),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            max_ips_per_user: Some(value.max_ips_per_user),
            ip_limit_policy: Some(value.ip_limit_policy),
            quota_refresh_interval_secs: Some(value.quota_refresh_interval_secs),
            purge_after_days: Some(value.purge_after_days),
        }
    }
}

/// Generates a fresh trace id for a downstream request.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(1234),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(4321),
            config_path: Some("keys.json".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4321);
        assert_eq!(config.config_path, "keys.json");
    }

    #[test]
    fn missing_config_path_is_an_error() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("config_path")));
    }
}
