use std::time::Duration;

pub const ADDR_ENV: &str = "CONSUL_HTTP_ADDR";
pub const SSL_ENV: &str = "CONSUL_HTTP_SSL";
pub const TOKEN_ENV: &str = "CONSUL_HTTP_TOKEN";
/// Enables debug-level logging for `consul-lock`.
pub const LOCK_DEBUG_ENV: &str = "CONSUL_LOCK_DEBUG";
/// Routes `consul-sync` logging to syslog when not attached to a terminal.
pub const SYNC_SYSLOG_ENV: &str = "CONSUL_SYNC_SYSLOG";

const DEFAULT_ADDR: &str = "127.0.0.1:8500";

/// How to reach the Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    /// Base address including scheme, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    /// ACL token sent with every request.
    pub token: Option<String>,
    /// Timeout for calls that do not block server-side.
    pub request_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: normalize_address(DEFAULT_ADDR, false),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsulConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ssl = lookup(SSL_ENV).map(|v| parse_flag(&v)).unwrap_or(false);
        let address = lookup(ADDR_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        Self {
            address: normalize_address(&address, ssl),
            token: lookup(TOKEN_ENV).filter(|v| !v.is_empty()),
            ..Self::default()
        }
    }
}

fn normalize_address(raw: &str, ssl: bool) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    let scheme = if ssl { "https" } else { "http" };
    format!("{scheme}://{raw}")
}

/// Timings for `consul-lock`.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Session TTL.
    /// Default: 10s
    pub session_ttl: Duration,
    /// Renewal period, half the TTL so one renewal can be late.
    /// Default: 5s
    pub renew_interval: Duration,
    /// Server-side wait budget for the loss-watch.
    /// Default: 10s
    pub watch_wait: Duration,
    /// Delay between CAS attempts while another session holds the key.
    /// Default: 5s
    pub contention_delay: Duration,
    /// Time a child gets to exit after a forwarded signal before it is killed.
    /// Default: 5s
    pub kill_grace: Duration,
    /// Delay before rebuilding the pipeline after an API failure.
    /// Default: 1s
    pub restart_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(5),
            watch_wait: Duration::from_secs(10),
            contention_delay: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Timings for `consul-sync`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server-side wait budget for every prefix watch.
    /// Default: 30s
    pub watch_wait: Duration,
    /// Delay before a failed watcher is restarted.
    /// Default: 1s
    pub restart_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch_wait: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Reads a boolean toggle from the environment.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_address_is_local_agent() {
        let config = ConsulConfig::from_lookup(lookup(&[]));
        assert_eq!(config.address, "http://127.0.0.1:8500");
        assert_eq!(config.token, None);
    }

    #[test]
    fn bare_host_gets_scheme_from_ssl_flag() {
        let config = ConsulConfig::from_lookup(lookup(&[
            (ADDR_ENV, "consul.service:8501"),
            (SSL_ENV, "true"),
            (TOKEN_ENV, "secret"),
        ]));
        assert_eq!(config.address, "https://consul.service:8501");
        assert_eq!(config.token.as_deref(), Some("secret"));
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let config = ConsulConfig::from_lookup(lookup(&[(ADDR_ENV, "http://10.0.0.1:8500/")]));
        assert_eq!(config.address, "http://10.0.0.1:8500");
    }

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["", "0", "false", "off", "nope"] {
            assert!(!parse_flag(value), "{value}");
        }
    }
}
