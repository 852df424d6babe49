use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:10101";

#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the execution backend
    pub server_url: String,
    /// Pause between a dropped connection and the next attempt
    pub reconnect_delay: Duration,
    /// Upper bound on one connect + WebSocket handshake
    pub connect_timeout: Duration,
    /// How long a traffic direction stays visible before resetting
    pub direction_reset: Duration,
    /// Quiet period before a burst of keystrokes is sent as one edit
    pub edit_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect_delay: Duration::from_millis(100),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            direction_reset: Duration::from_millis(1000),
            edit_debounce: Duration::from_millis(300),
        }
    }
}

impl Config {
    /// Read configuration from the process environment, loading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let server_url = env_str("SHEETS_SERVER_URL", &defaults.server_url);
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "SHEETS_SERVER_URL",
                reason: format!("expected a ws:// or wss:// URL, got '{server_url}'"),
            });
        }

        Ok(Self {
            server_url,
            reconnect_delay: env_millis("SHEETS_RECONNECT_DELAY_MS", defaults.reconnect_delay)?,
            connect_timeout: env_millis("SHEETS_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            direction_reset: env_millis("SHEETS_DIRECTION_RESET_MS", defaults.direction_reset)?,
            edit_debounce: env_millis("SHEETS_EDIT_DEBOUNCE_MS", defaults.edit_debounce)?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map_err(|e| ConfigError::Parse {
            key,
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
