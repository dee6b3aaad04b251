use std::time::Duration;

use mproxy_registry::Service;

/// How long a 429 locks a credential out of selection.
pub fn rate_limit_lockout(service: Service) -> Duration {
    match service {
        Service::Anthropic | Service::Aws | Service::Gcp => Duration::from_secs(2),
        Service::Openai | Service::Azure => Duration::from_secs(4),
        Service::GoogleAi => Duration::from_secs(3),
        Service::Moonshot => Duration::from_secs(5),
        _ => Duration::from_secs(3),
    }
}

/// Short reuse throttle applied on every `select` so a burst cannot pile onto
/// one credential before any response has come back.
pub fn key_reuse_delay(service: Service) -> Duration {
    match service {
        Service::Anthropic | Service::Aws | Service::Gcp => Duration::from_millis(500),
        Service::GoogleAi => Duration::from_millis(400),
        _ => Duration::from_millis(250),
    }
}
