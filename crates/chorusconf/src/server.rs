//! Homeserver identity, storage and cache sizing, logging.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of this homeserver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Domain part of every local user id (`@alice:<server_name>`).
    /// Cannot change once users have been persisted.
    /// Default: localhost
    #[serde(default = "ServerConfig::default_server_name")]
    pub server_name: String,
}

impl ServerConfig {
    fn default_server_name() -> String {
        "localhost".to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: Self::default_server_name(),
        }
    }
}

/// Main database location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file.
    /// Default: ~/.local/share/chorus/homeserver.db
    #[serde(default = "DatabaseConfig::default_path")]
    pub path: PathBuf,
}

impl DatabaseConfig {
    fn default_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/chorus/homeserver.db"))
            .unwrap_or_else(|| PathBuf::from(".local/share/chorus/homeserver.db"))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

/// In-process cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachesConfig {
    /// Multiplier applied to every cache's base capacity.
    /// Default: 0.5
    #[serde(default = "CachesConfig::default_global_factor")]
    pub global_factor: f64,

    /// Base number of history entries kept by each stream change cache,
    /// before `global_factor` is applied.
    /// Default: 10000
    #[serde(default = "CachesConfig::default_change_cache_size")]
    pub change_cache_size: usize,
}

impl CachesConfig {
    fn default_global_factor() -> f64 {
        0.5
    }

    fn default_change_cache_size() -> usize {
        10_000
    }

    /// Scale a base capacity by the global factor, never returning zero.
    pub fn scaled(&self, base: usize) -> usize {
        ((base as f64) * self.global_factor).round().max(1.0) as usize
    }

    /// Effective capacity for stream change caches.
    pub fn change_cache_capacity(&self) -> usize {
        self.scaled(self.change_cache_size)
    }
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            global_factor: Self::default_global_factor(),
            change_cache_size: Self::default_change_cache_size(),
        }
    }
}

/// User directory behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDirectoryConfig {
    /// Maintain the user directory at all.
    /// Default: true
    #[serde(default = "UserDirectoryConfig::default_enabled")]
    pub enabled: bool,

    /// Return every known user from searches, not only users who share a
    /// public room with the searcher.
    /// Default: false
    #[serde(default)]
    pub search_all_users: bool,
}

impl UserDirectoryConfig {
    fn default_enabled() -> bool {
        true
    }
}

impl Default for UserDirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            search_all_users: false,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an
    /// `EnvFilter` expression).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// Default: text
    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint. Empty disables export.
    /// Default: ""
    #[serde(default)]
    pub otlp_endpoint: String,
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
            log_format: LogFormat::default(),
            otlp_endpoint: String::new(),
        }
    }
}
