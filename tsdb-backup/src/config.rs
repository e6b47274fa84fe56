//! Configuration management for tsdb-backup.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::manifest::FileCompression;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `server.url`.
pub const HOST_ENV: &str = "INFLUX_HOST";
/// Environment variable overriding `server.token`.
pub const TOKEN_ENV: &str = "INFLUX_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the server
    #[serde(default = "default_url")]
    pub url: String,

    /// API token sent as `Authorization: Token <token>`
    #[serde(default)]
    pub token: String,

    /// Connect timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Local compression of backup files (none, gzip)
    #[serde(default)]
    pub compression: FileCompression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BackupError::file(path, e))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("invalid config file {:?}: {}", path, e)))
    }

    /// Load from `path` if given, otherwise start from defaults; then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override server settings from the environment; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(url) = lookup(HOST_ENV) {
            self.server.url = url;
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            self.server.token = token;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.url, "http://localhost:8086");
        assert!(config.server.token.is_empty());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.backup.compression, FileCompression::None);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_file_fills_missing_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tsdb-backup.toml");
        std::fs::write(
            &path,
            "[server]\nurl = \"https://influx.example.com\"\ntoken = \"abc\"\n\n[backup]\ncompression = \"gzip\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.url, "https://influx.example.com");
        assert_eq!(config.server.token, "abc");
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(config.backup.compression, FileCompression::Gzip);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nurl = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        let err = Config::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(HOST_ENV, "http://db:8086"), (TOKEN_ENV, "")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config.server.token = "from-file".to_string();

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.server.url, "http://db:8086");
        assert_eq!(config.server.token, "from-file");
    }
}
