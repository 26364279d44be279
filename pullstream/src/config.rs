//! Stream configuration.

use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default write buffer size; one full buffer becomes one request payload.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8192;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeout {
    /// Wait indefinitely.
    #[default]
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    /// Absolute deadline for a wait starting now, `None` when infinite.
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Configuration for a [`ClientStream`](crate::ClientStream).
///
/// Deserializes with defaults for missing fields, so it can sit inside a
/// host application's configuration file:
///
/// ```toml
/// write_buffer_size = 4096
/// read_timeout = "infinite"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes buffered on write before they are sent as one request.
    pub write_buffer_size: usize,
    /// How long a read may block waiting for a response.
    pub read_timeout: Timeout,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_timeout: Timeout::Infinite,
        }
    }
}

impl StreamConfig {
    /// Checks the configuration for values the stream cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroWriteBuffer`] if `write_buffer_size` is 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_buffer_size == 0 {
            return Err(ConfigError::ZeroWriteBuffer);
        }
        Ok(())
    }
}

/// Invalid stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A zero-sized write buffer could never fill.
    #[error("write buffer size must be greater than 0")]
    ZeroWriteBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        assert_eq!(config.write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE);
        assert_eq!(config.read_timeout, Timeout::Infinite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_write_buffer_rejected() {
        let config = StreamConfig {
            write_buffer_size: 0,
            ..StreamConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroWriteBuffer));
    }

    #[test]
    fn test_config_from_toml_fills_defaults() {
        let config: StreamConfig = toml::from_str("write_buffer_size = 100").unwrap();
        assert_eq!(config.write_buffer_size, 100);
        assert_eq!(config.read_timeout, Timeout::Infinite);

        let config: StreamConfig = toml::from_str(r#"read_timeout = "infinite""#).unwrap();
        assert_eq!(config, StreamConfig::default());
    }

    #[test]
    fn test_infinite_timeout_has_no_deadline() {
        assert!(Timeout::Infinite.deadline().is_none());
        let deadline = Timeout::from(Duration::from_secs(5)).deadline().unwrap();
        assert!(deadline > Instant::now());
    }
}
