//! TOML-based configuration persistence for the server application.
//!
//! Reads and writes [`ServerConfig`] to the platform-appropriate config
//! file:
//! - Windows:  `%APPDATA%\Edgehop\server.toml`
//! - Linux:    `~/.config/edgehop/server.toml`
//! - macOS:    `~/Library/Application Support/Edgehop/server.toml`
//!
//! Fields annotated with `#[serde(default = "…")]` fall back to their
//! defaults when absent, so the server runs correctly on first start
//! (before a config file exists) and when upgrading from an older file
//! that lacks newer fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema ─────────────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
}

/// General server behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// The server screen's logical name.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Bind address and port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind; `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_server_name() -> String {
    "server".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_port() -> u16 {
    24800
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

impl NetworkSection {
    /// The `bind_address:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

// ── Load / save ───────────────────────────────────────────────────────────────

/// Resolves the full path of the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform base
/// directory cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("server.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config, returning defaults when no file exists yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found" and [`ConfigError::Parse`] when the TOML is malformed.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    let path = config_file_path()?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists the config, creating the directory as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] when serialization fails.
pub fn save_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Edgehop"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Edgehop")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("edgehop"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_standard_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.network.port, 24800);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.server.name, "server");
        assert_eq!(cfg.server.log_level, "info");
    }

    #[test]
    fn test_listen_addr_joins_address_and_port() {
        let mut cfg = ServerConfig::default();
        cfg.network.bind_address = "127.0.0.1".to_string();
        cfg.network.port = 9100;
        assert_eq!(cfg.network.listen_addr(), "127.0.0.1:9100");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = ServerConfig::default();
        cfg.server.name = "desk".to_string();
        cfg.network.port = 9000;

        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: ServerConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(restored, cfg);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: ServerConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let cfg: ServerConfig = toml::from_str(
            r#"
[network]
port = 9999
"#,
        )
        .expect("deserialize partial");
        assert_eq!(cfg.network.port, 9999);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.server.name, "server");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let result: Result<ServerConfig, toml::de::Error> = toml::from_str("[[[ nope");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_file() {
        let dir = std::env::temp_dir().join(format!("edgehop_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");

        let mut cfg = ServerConfig::default();
        cfg.network.port = 12345;
        std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded: ServerConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.network.port, 12345);

        std::fs::remove_dir_all(&dir).ok();
    }
}
