//! Bootstrap configuration - tunable behavior seeded at startup.
//!
//! Unlike `InfraConfig`, nothing here is physically fixed; it just sets the
//! initial parameters for components (`ReconnectionController`,
//! `RequestRegistry`, `StateManager`) that track their own mutable state
//! once the client is running.

use serde::{Deserialize, Serialize};

/// Reconnection backoff policy, seeding `ReconnectionController`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds.
    #[serde(default = "ReconnectConfig::default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum backoff delay in milliseconds.
    #[serde(default = "ReconnectConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the current delay before each wait.
    #[serde(default = "ReconnectConfig::default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum number of reconnection attempts before giving up.
    /// `None` means unbounded.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Quiet time after a successful connect before the attempt counter and
    /// current delay reset to their initial values, in milliseconds.
    #[serde(default = "ReconnectConfig::default_reset_threshold_ms")]
    pub reset_threshold_ms: u64,
}

impl ReconnectConfig {
    fn default_min_delay_ms() -> u64 {
        100
    }

    fn default_max_delay_ms() -> u64 {
        30_000
    }

    fn default_backoff_multiplier() -> f64 {
        1.5
    }

    fn default_reset_threshold_ms() -> u64 {
        60_000
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: Self::default_min_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            max_attempts: None,
            reset_threshold_ms: Self::default_reset_threshold_ms(),
        }
    }
}

/// Outbound-request defaults, seeding `RequestRegistry` and `MethodRegistry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Default per-request timeout in milliseconds, used when a caller does
    /// not supply `options.timeout`.
    #[serde(default = "RequestConfig::default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Ceiling enforced on any caller-supplied request timeout.
    #[serde(default = "RequestConfig::default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Default per-method handler timeout in milliseconds.
    #[serde(default = "RequestConfig::default_method_timeout_ms")]
    pub method_timeout_ms: u64,

    /// Interval at which the pending-request table is swept for expiry.
    #[serde(default = "RequestConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl RequestConfig {
    fn default_timeout_ms() -> u64 {
        30_000
    }

    fn default_max_timeout_ms() -> u64 {
        300_000
    }

    fn default_method_timeout_ms() -> u64 {
        30_000
    }

    fn default_sweep_interval_ms() -> u64 {
        500
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
            max_timeout_ms: Self::default_max_timeout_ms(),
            method_timeout_ms: Self::default_method_timeout_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
        }
    }
}

/// Recovery-token refresh policy, seeding `StateManager`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// How often to proactively refresh the recovery token, in milliseconds.
    #[serde(default = "StateConfig::default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Minimum spacing between non-forced refreshes, in milliseconds.
    #[serde(default = "StateConfig::default_min_refresh_interval_ms")]
    pub min_refresh_interval_ms: u64,

    /// Retry attempts for a single refresh before giving up.
    #[serde(default = "StateConfig::default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between refresh retries, in milliseconds.
    #[serde(default = "StateConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Force a refresh immediately after every successful reconnect.
    #[serde(default = "StateConfig::default_force_refresh_on_reconnect")]
    pub force_refresh_on_reconnect: bool,
}

impl StateConfig {
    fn default_refresh_interval_ms() -> u64 {
        300_000
    }

    fn default_min_refresh_interval_ms() -> u64 {
        60_000
    }

    fn default_retry_attempts() -> u32 {
        3
    }

    fn default_retry_delay_ms() -> u64 {
        1_000
    }

    fn default_force_refresh_on_reconnect() -> bool {
        true
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: Self::default_refresh_interval_ms(),
            min_refresh_interval_ms: Self::default_min_refresh_interval_ms(),
            retry_attempts: Self::default_retry_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            force_refresh_on_reconnect: Self::default_force_refresh_on_reconnect(),
        }
    }
}

/// Bootstrap configuration - seeds runtime, then the runtime owns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Request/method timeout policy.
    #[serde(default)]
    pub request: RequestConfig,

    /// Recovery-token refresh policy.
    #[serde(default)]
    pub state: StateConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults() {
        let r = ReconnectConfig::default();
        assert_eq!(r.min_delay_ms, 100);
        assert_eq!(r.max_delay_ms, 30_000);
        assert_eq!(r.backoff_multiplier, 1.5);
        assert_eq!(r.max_attempts, None);
        assert_eq!(r.reset_threshold_ms, 60_000);
    }

    #[test]
    fn test_request_defaults() {
        let r = RequestConfig::default();
        assert_eq!(r.default_timeout_ms, 30_000);
        assert_eq!(r.max_timeout_ms, 300_000);
        assert_eq!(r.method_timeout_ms, 30_000);
    }

    #[test]
    fn test_state_defaults() {
        let s = StateConfig::default();
        assert_eq!(s.refresh_interval_ms, 300_000);
        assert_eq!(s.min_refresh_interval_ms, 60_000);
        assert_eq!(s.retry_attempts, 3);
        assert!(s.force_refresh_on_reconnect);
    }
}
