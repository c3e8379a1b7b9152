//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::BackoffPolicy;

pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay address the session connects to.
    pub relay_addr: String,
    /// Directory holding the per-document queue and state files.
    pub data_dir: PathBuf,
    /// Retention window for unacknowledged queued operations.
    pub retention_days: u64,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            data_dir: PathBuf::from(".cowrite"),
            retention_days: 7,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter_ms: 1_000,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            cap: Duration::from_millis(self.cap_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Relay listen port: `PORT` from the environment, default 3001.
pub fn relay_port() -> u16 {
    match std::env::var("PORT") {
        Ok(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!("ignoring unparsable PORT={raw:?}, using {DEFAULT_PORT}");
                DEFAULT_PORT
            }
        },
        Err(_) => DEFAULT_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.relay_addr, "127.0.0.1:3001");
        assert_eq!(config.retention(), Duration::from_secs(7 * 24 * 60 * 60));
        let policy = config.backoff.policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 10);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"relay_addr":"relay:9000"}"#).unwrap();
        assert_eq!(config.relay_addr, "relay:9000");
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.backoff.max_attempts, 10);
    }
}
