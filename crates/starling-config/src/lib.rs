//! Configuration loading for the Helios-Starling client.
//!
//! This crate provides configuration loading with minimal dependencies, so
//! it can be pulled in by `starling-client` and `starling-cli` alike without
//! forcing either to take on the other's dependency tree.
//!
//! # Configuration philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change once the
//!   client is built - the server URL, connect timeout, buffer capacity,
//!   log level.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed the
//!   runtime state owned by `ReconnectionController`, `RequestRegistry`, and
//!   `StateManager`. After startup those components own their own state;
//!   this just supplies the starting parameters.
//!
//! # Config file locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/starling/config.toml` (system)
//! 2. `~/.config/starling/config.toml` (user)
//! 3. `./starling.toml` (local override)
//! 4. Environment variables (`STARLING_*`, plus `RUST_LOG`)
//!
//! # Example config
//!
//! ```toml
//! [connection]
//! url = "wss://starling.example/ws"
//! connect_timeout_ms = 10000
//!
//! [buffer]
//! capacity = 1000
//!
//! [telemetry]
//! log_level = "info"
//!
//! [reconnect]
//! min_delay_ms = 100
//! max_delay_ms = 30000
//! backoff_multiplier = 1.5
//!
//! [request]
//! default_timeout_ms = 30000
//!
//! [state]
//! refresh_interval_ms = 300000
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ReconnectConfig, RequestConfig, StateConfig};
pub use infra::{BufferConfig, ConnectionConfig, InfraConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete Helios-Starling client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarlingConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl StarlingConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/starling/config.toml`
    /// 3. `~/.config/starling/config.toml`
    /// 4. `./starling.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./starling.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from an optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = StarlingConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = StarlingConfig::default();
        let rendered = config.to_toml();
        assert!(rendered.contains("url"));
    }

    #[test]
    fn load_without_any_files_or_env_returns_defaults() {
        // Run in a scratch directory with no starling.toml present.
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = StarlingConfig::load();
        std::env::set_current_dir(original).unwrap();

        let config = result.unwrap();
        assert_eq!(config, StarlingConfig::default());
    }
}
