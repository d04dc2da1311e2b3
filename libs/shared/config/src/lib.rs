use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_REALTIME_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_REALTIME_PATH: &str = "/ws";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 2000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PREFERENCES_PATH: &str = ".amae/preferences.json";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub realtime: RealtimeConfig,
}

/// Settings shared by the realtime hub (server side) and the realtime
/// channel (client side).
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Origin the application is served from, e.g. `https://app.amae.clinic`.
    pub origin: String,
    pub path: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long the hub waits for the `auth` frame on a fresh socket.
    pub auth_timeout_ms: u64,
    /// Cap on the retained inbound history; `None` keeps everything.
    pub history_limit: Option<usize>,
    pub preferences_path: PathBuf,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_REALTIME_ORIGIN.to_string(),
            path: DEFAULT_REALTIME_PATH.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            history_limit: None,
            preferences_path: PathBuf::from(DEFAULT_PREFERENCES_PATH),
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            bind_addr: env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| {
                    warn!("API_BIND_ADDR not set, using default");
                    DEFAULT_BIND_ADDR.to_string()
                }),
            realtime: RealtimeConfig {
                origin: env::var("REALTIME_ORIGIN")
                    .unwrap_or_else(|_| {
                        warn!("REALTIME_ORIGIN not set, using default");
                        DEFAULT_REALTIME_ORIGIN.to_string()
                    }),
                path: env::var("REALTIME_PATH")
                    .unwrap_or_else(|_| DEFAULT_REALTIME_PATH.to_string()),
                max_reconnect_attempts: parse_var(
                    "REALTIME_MAX_RECONNECT_ATTEMPTS",
                    DEFAULT_MAX_RECONNECT_ATTEMPTS,
                ),
                reconnect_base_delay_ms: parse_var(
                    "REALTIME_RECONNECT_BASE_DELAY_MS",
                    DEFAULT_RECONNECT_BASE_DELAY_MS,
                ),
                connect_timeout_ms: parse_var(
                    "REALTIME_CONNECT_TIMEOUT_MS",
                    DEFAULT_CONNECT_TIMEOUT_MS,
                ),
                auth_timeout_ms: parse_var("REALTIME_AUTH_TIMEOUT_MS", DEFAULT_AUTH_TIMEOUT_MS),
                history_limit: env::var("REALTIME_HISTORY_LIMIT")
                    .ok()
                    .and_then(|raw| match raw.parse::<usize>() {
                        Ok(limit) if limit > 0 => Some(limit),
                        _ => {
                            warn!("REALTIME_HISTORY_LIMIT is invalid ({}), keeping full history", raw);
                            None
                        }
                    }),
                preferences_path: env::var("REALTIME_PREFERENCES_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_PREFERENCES_PATH)),
            },
        };

        if !config.is_secure_origin() {
            warn!("REALTIME_ORIGIN is not https, realtime traffic will not be encrypted");
        }

        config
    }

    pub fn is_secure_origin(&self) -> bool {
        self.realtime.origin.starts_with("https://")
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} is invalid ({}), using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let config = RealtimeConfig::default();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_base_delay(), Duration::from_secs(2));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.history_limit.is_none());
    }

    #[test]
    fn secure_origin_detection() {
        let mut config = AppConfig::default();
        assert!(!config.is_secure_origin());
        config.realtime.origin = "https://app.amae.clinic".to_string();
        assert!(config.is_secure_origin());
    }

    #[test]
    fn invalid_numeric_var_falls_back() {
        env::set_var("AMAE_TEST_PARSE_VAR", "not-a-number");
        assert_eq!(parse_var("AMAE_TEST_PARSE_VAR", 42u32), 42);
        env::set_var("AMAE_TEST_PARSE_VAR", " 7 ");
        assert_eq!(parse_var("AMAE_TEST_PARSE_VAR", 42u32), 7);
        env::remove_var("AMAE_TEST_PARSE_VAR");
        assert_eq!(parse_var("AMAE_TEST_PARSE_VAR", 42u32), 42);
    }
}
