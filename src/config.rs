//! Runtime configuration.
//!
//! The defaults listen on port 8080 on all interfaces and allow
//! 20 concurrent sessions with 5 second deadlines everywhere.  A JSON file can
//! override any subset of the fields:
//!
//! ```
//! let config: sockspy::config::ProxyConfig =
//!     serde_json::from_str(r#"{"listen_addr": "127.0.0.1:1080", "chunk_line_ending": "lf"}"#).unwrap();
//! assert_eq!(config.capacity, 20);
//! assert_eq!(config.chunk_line_ending, sockspy::config::ChunkLineEnding::Lf);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The default listening address.
pub const ADDR: &str = "0.0.0.0:8080";
/// The default number of concurrently admitted sessions.
pub const CAPACITY: usize = 20;
/// The default deadline, in milliseconds, for handshake reads, connects and relay I/O.
pub const TIMEOUT_MS: u64 = 5_000;

/// Line terminator written after each line of a chunked response body.
///
/// Header lines are always forwarded with `\r\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLineEnding {
    /// Each line keeps the terminator it arrived with.
    #[default]
    Verbatim,
    /// Every line is rewritten to end in a bare `\n`.
    Lf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    /// Size of the worker pool and of the admission semaphore.
    pub capacity: usize,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub chunk_line_ending: ChunkLineEnding,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_addr: ADDR.to_string(),
            capacity: CAPACITY,
            handshake_timeout_ms: TIMEOUT_MS,
            connect_timeout_ms: TIMEOUT_MS,
            io_timeout_ms: TIMEOUT_MS,
            chunk_line_ending: ChunkLineEnding::default(),
        }
    }
}

/// Errors that can occur while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

impl ProxyConfig {
    /// Reads a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ProxyConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be at least 1"));
        }
        // std rejects zero durations for socket deadlines
        if self.handshake_timeout_ms == 0 || self.connect_timeout_ms == 0 || self.io_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.capacity, 20);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
        assert_eq!(config.chunk_line_ending, ChunkLineEnding::Verbatim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ProxyConfig = serde_json::from_str(r#"{"capacity": 3}"#).unwrap();
        assert_eq!(config.capacity, 3);
        assert_eq!(config.listen_addr, ADDR);
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let config = ProxyConfig {
            capacity: 0,
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("sockspy-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"io_timeout_ms": 250, "chunk_line_ending": "lf"}"#).unwrap();
        let config = ProxyConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.io_timeout(), Duration::from_millis(250));
        assert_eq!(config.chunk_line_ending, ChunkLineEnding::Lf);
    }

    #[test]
    fn load_reports_bad_json() {
        let path = std::env::temp_dir().join(format!("sockspy-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{not json").unwrap();
        let result = ProxyConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }
}
