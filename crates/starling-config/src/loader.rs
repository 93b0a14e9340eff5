//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, InfraConfig, StarlingConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/starling/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("starling/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("starling.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<StarlingConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string.
fn parse_toml(contents: &str, path: &Path) -> Result<StarlingConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();
    if let Some(conn) = table.get("connection").and_then(|v| v.as_table()) {
        if let Some(v) = conn.get("url").and_then(|v| v.as_str()) {
            infra.connection.url = v.to_string();
        }
        if let Some(v) = conn.get("connect_timeout_ms").and_then(|v| v.as_integer()) {
            infra.connection.connect_timeout_ms = v as u64;
        }
    }
    if let Some(buf) = table.get("buffer").and_then(|v| v.as_table()) {
        if let Some(v) = buf.get("capacity").and_then(|v| v.as_integer()) {
            infra.buffer.capacity = v as usize;
        }
    }
    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }

    let mut bootstrap = BootstrapConfig::default();
    if let Some(reconnect) = table.get("reconnect").and_then(|v| v.as_table()) {
        if let Some(v) = reconnect.get("min_delay_ms").and_then(|v| v.as_integer()) {
            bootstrap.reconnect.min_delay_ms = v as u64;
        }
        if let Some(v) = reconnect.get("max_delay_ms").and_then(|v| v.as_integer()) {
            bootstrap.reconnect.max_delay_ms = v as u64;
        }
        if let Some(v) = reconnect.get("backoff_multiplier").and_then(|v| v.as_float()) {
            bootstrap.reconnect.backoff_multiplier = v;
        }
        if let Some(v) = reconnect.get("max_attempts").and_then(|v| v.as_integer()) {
            bootstrap.reconnect.max_attempts = Some(v as u32);
        }
        if let Some(v) = reconnect.get("reset_threshold_ms").and_then(|v| v.as_integer()) {
            bootstrap.reconnect.reset_threshold_ms = v as u64;
        }
    }
    if let Some(request) = table.get("request").and_then(|v| v.as_table()) {
        if let Some(v) = request.get("default_timeout_ms").and_then(|v| v.as_integer()) {
            bootstrap.request.default_timeout_ms = v as u64;
        }
        if let Some(v) = request.get("max_timeout_ms").and_then(|v| v.as_integer()) {
            bootstrap.request.max_timeout_ms = v as u64;
        }
        if let Some(v) = request.get("method_timeout_ms").and_then(|v| v.as_integer()) {
            bootstrap.request.method_timeout_ms = v as u64;
        }
        if let Some(v) = request.get("sweep_interval_ms").and_then(|v| v.as_integer()) {
            bootstrap.request.sweep_interval_ms = v as u64;
        }
    }
    if let Some(state) = table.get("state").and_then(|v| v.as_table()) {
        if let Some(v) = state.get("refresh_interval_ms").and_then(|v| v.as_integer()) {
            bootstrap.state.refresh_interval_ms = v as u64;
        }
        if let Some(v) = state.get("min_refresh_interval_ms").and_then(|v| v.as_integer()) {
            bootstrap.state.min_refresh_interval_ms = v as u64;
        }
        if let Some(v) = state.get("retry_attempts").and_then(|v| v.as_integer()) {
            bootstrap.state.retry_attempts = v as u32;
        }
        if let Some(v) = state.get("retry_delay_ms").and_then(|v| v.as_integer()) {
            bootstrap.state.retry_delay_ms = v as u64;
        }
        if let Some(v) = state.get("force_refresh_on_reconnect").and_then(|v| v.as_bool()) {
            bootstrap.state.force_refresh_on_reconnect = v;
        }
    }

    Ok(StarlingConfig { infra, bootstrap })
}

/// Merge two configs, with `overlay` taking precedence field-by-field.
pub fn merge_configs(base: StarlingConfig, overlay: StarlingConfig) -> StarlingConfig {
    let defaults = StarlingConfig::default();

    StarlingConfig {
        infra: InfraConfig {
            connection: if overlay.infra.connection != defaults.infra.connection {
                overlay.infra.connection
            } else {
                base.infra.connection
            },
            buffer: if overlay.infra.buffer != defaults.infra.buffer {
                overlay.infra.buffer
            } else {
                base.infra.buffer
            },
            telemetry: if overlay.infra.telemetry != defaults.infra.telemetry {
                overlay.infra.telemetry
            } else {
                base.infra.telemetry
            },
        },
        bootstrap: BootstrapConfig {
            reconnect: if overlay.bootstrap.reconnect != defaults.bootstrap.reconnect {
                overlay.bootstrap.reconnect
            } else {
                base.bootstrap.reconnect
            },
            request: if overlay.bootstrap.request != defaults.bootstrap.request {
                overlay.bootstrap.request
            } else {
                base.bootstrap.request
            },
            state: if overlay.bootstrap.state != defaults.bootstrap.state {
                overlay.bootstrap.state
            } else {
                base.bootstrap.state
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut StarlingConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("STARLING_URL") {
        config.infra.connection.url = v;
        sources.env_overrides.push("STARLING_URL".to_string());
    }
    if let Ok(v) = env::var("STARLING_CONNECT_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.connection.connect_timeout_ms = ms;
            sources.env_overrides.push("STARLING_CONNECT_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("STARLING_BUFFER_CAPACITY") {
        if let Ok(cap) = v.parse() {
            config.infra.buffer.capacity = cap;
            sources.env_overrides.push("STARLING_BUFFER_CAPACITY".to_string());
        }
    }
    if let Ok(v) = env::var("STARLING_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("STARLING_LOG_LEVEL".to_string());
    }
    // Also honor the standard RUST_LOG convention.
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("STARLING_RECONNECT_MAX_ATTEMPTS") {
        if let Ok(n) = v.parse() {
            config.bootstrap.reconnect.max_attempts = Some(n);
            sources.env_overrides.push("STARLING_RECONNECT_MAX_ATTEMPTS".to_string());
        }
    }
    if let Ok(v) = env::var("STARLING_REQUEST_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.bootstrap.request.default_timeout_ms = ms;
            sources.env_overrides.push("STARLING_REQUEST_TIMEOUT_MS".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic in whatever environment tests run in.
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[connection]
url = "ws://example.invalid:9000"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.connection.url, "ws://example.invalid:9000");
        // Other values should be defaults.
        assert_eq!(config.infra.connection.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[connection]
url = "wss://starling.example/ws"
connect_timeout_ms = 5000

[buffer]
capacity = 250

[telemetry]
log_level = "debug"

[reconnect]
min_delay_ms = 50
max_delay_ms = 2000
backoff_multiplier = 2.0
max_attempts = 5
reset_threshold_ms = 30000

[request]
default_timeout_ms = 15000
method_timeout_ms = 20000

[state]
refresh_interval_ms = 60000
min_refresh_interval_ms = 10000
retry_attempts = 5
force_refresh_on_reconnect = false
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.connection.url, "wss://starling.example/ws");
        assert_eq!(config.infra.connection.connect_timeout_ms, 5000);
        assert_eq!(config.infra.buffer.capacity, 250);
        assert_eq!(config.infra.telemetry.log_level, "debug");

        assert_eq!(config.bootstrap.reconnect.min_delay_ms, 50);
        assert_eq!(config.bootstrap.reconnect.max_delay_ms, 2000);
        assert_eq!(config.bootstrap.reconnect.backoff_multiplier, 2.0);
        assert_eq!(config.bootstrap.reconnect.max_attempts, Some(5));

        assert_eq!(config.bootstrap.request.default_timeout_ms, 15000);
        assert_eq!(config.bootstrap.request.method_timeout_ms, 20000);

        assert_eq!(config.bootstrap.state.refresh_interval_ms, 60000);
        assert!(!config.bootstrap.state.force_refresh_on_reconnect);
    }

    #[test]
    fn test_env_override_url() {
        // SAFETY-relevant only in that this mutates process env for the
        // duration of the test; tests in this module do not run other env
        // assertions concurrently in a way that would race on this key.
        std::env::set_var("STARLING_URL", "ws://from-env:1234");
        let mut config = StarlingConfig::default();
        let mut sources = ConfigSources::default();
        apply_env_overrides(&mut config, &mut sources);
        assert_eq!(config.infra.connection.url, "ws://from-env:1234");
        assert!(sources.env_overrides.contains(&"STARLING_URL".to_string()));
        std::env::remove_var("STARLING_URL");
    }
}
