//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Transport connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL of the Helios server.
    /// Default: ws://127.0.0.1:7000
    #[serde(default = "ConnectionConfig::default_url")]
    pub url: String,

    /// Milliseconds to wait for the socket to reach `connected` before
    /// failing with `CONNECTION_TIMEOUT`.
    /// Default: 10000
    #[serde(default = "ConnectionConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    fn default_url() -> String {
        "ws://127.0.0.1:7000".to_string()
    }

    fn default_connect_timeout_ms() -> u64 {
        10_000
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
        }
    }
}

/// Outbound send-buffer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of buffered outbound frames while disconnected.
    /// Oldest frames are dropped once this is exceeded.
    /// Default: 1000
    #[serde(default = "BufferConfig::default_capacity")]
    pub capacity: usize,
}

impl BufferConfig {
    fn default_capacity() -> usize {
        1000
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `tracing_subscriber::EnvFilter` directive (e.g. "info", "starling_client=debug").
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Transport connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Send-buffer settings.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let conn = ConnectionConfig::default();
        assert_eq!(conn.url, "ws://127.0.0.1:7000");
        assert_eq!(conn.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_buffer_defaults() {
        assert_eq!(BufferConfig::default().capacity, 1000);
    }

    #[test]
    fn test_telemetry_defaults() {
        assert_eq!(TelemetryConfig::default().log_level, "info");
    }
}
