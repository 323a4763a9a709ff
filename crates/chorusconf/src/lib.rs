//! Configuration loading for Chorus.
//!
//! Every chorus crate takes its settings as an explicit struct handed to a
//! constructor. Nothing reads configuration from a global after startup; tests
//! override behaviour by building a different struct.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, table by table):
//! 1. `/etc/chorus/config.toml` (system)
//! 2. `~/.config/chorus/config.toml` (user)
//! 3. `./chorus.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`CHORUS_*`)
//!
//! # Example Config
//!
//! ```toml
//! [server]
//! server_name = "example.org"
//!
//! [database]
//! path = "~/.local/share/chorus/homeserver.db"
//!
//! [caches]
//! global_factor = 2.0
//! change_cache_size = 1000
//!
//! [user_directory]
//! search_all_users = true
//!
//! [telemetry]
//! log_level = "info"
//! log_format = "json"
//!
//! [redis]
//! enabled = true
//!
//! [redis.cache_shards]
//! expire_caches = true
//! cache_entry_ttl = "30m"
//! hosts = [{ host = "cache-1", port = 6379 }]
//! ```

pub mod duration;
pub mod loader;
pub mod redis;
pub mod server;

pub use duration::parse_duration;
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use redis::{CacheShardConfig, CacheShardHost, RedisConfig};
pub use server::{
    CachesConfig, DatabaseConfig, LogFormat, ServerConfig, TelemetryConfig, UserDirectoryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration for {section}: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

/// Complete Chorus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChorusConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub caches: CachesConfig,

    #[serde(default)]
    pub user_directory: UserDirectoryConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Replication bus and shared cache shards. Disabled by default.
    #[serde(default)]
    pub redis: RedisConfig,
}

impl ChorusConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local `./chorus.toml`.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, std::path::Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document without consulting the filesystem or env.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = std::path::Path::new("<string>");
        let table = loader::parse_table(contents, path)?;
        let config = loader::from_table(table, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.server_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                section: "server",
                message: "server_name must not be empty".to_string(),
            });
        }
        if self.caches.global_factor <= 0.0 {
            return Err(ConfigError::Invalid {
                section: "caches",
                message: format!(
                    "global_factor must be positive, got {}",
                    self.caches.global_factor
                ),
            });
        }
        self.redis.validate()
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# Chorus Configuration\n\n");

        output.push_str("[server]\n");
        output.push_str(&format!("server_name = \"{}\"\n", self.server.server_name));

        output.push_str("\n[database]\n");
        output.push_str(&format!("path = \"{}\"\n", self.database.path.display()));

        output.push_str("\n[caches]\n");
        output.push_str(&format!("global_factor = {:?}\n", self.caches.global_factor));
        output.push_str(&format!(
            "change_cache_size = {}\n",
            self.caches.change_cache_size
        ));

        output.push_str("\n[user_directory]\n");
        output.push_str(&format!("enabled = {}\n", self.user_directory.enabled));
        output.push_str(&format!(
            "search_all_users = {}\n",
            self.user_directory.search_all_users
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));
        output.push_str(&format!("log_format = \"{}\"\n", self.telemetry.log_format));
        output.push_str(&format!(
            "otlp_endpoint = \"{}\"\n",
            self.telemetry.otlp_endpoint
        ));

        output.push('\n');
        output.push_str(&self.redis.to_toml());

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChorusConfig::default();
        assert_eq!(config.server.server_name, "localhost");
        assert!(!config.redis.enabled);
        assert!(config.redis.cache_shards.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = ChorusConfig::default();
        config.server.server_name = "example.org".to_string();
        config.user_directory.search_all_users = true;

        let text = config.to_toml();
        assert!(text.contains("[server]"));
        assert!(text.contains("[redis]"));

        let parsed = ChorusConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_empty_server_name_rejected() {
        let err = ChorusConfig::from_toml_str("[server]\nserver_name = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "server", .. }));
    }

    #[test]
    fn test_non_positive_cache_factor_rejected() {
        let err = ChorusConfig::from_toml_str("[caches]\nglobal_factor = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "caches", .. }));
    }
}
