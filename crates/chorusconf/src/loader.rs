//! Config file discovery, loading, and environment variable overlay.

use crate::{ChorusConfig, ConfigError, LogFormat};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/chorus/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("chorus/config.toml");
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

    let local = PathBuf::from("chorus.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

/// Load a complete config from a single TOML file.
pub fn load_from_file(path: &Path) -> Result<ChorusConfig, ConfigError> {
    from_table(load_table(path)?, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

pub(crate) fn from_table(table: toml::Table, path: &Path) -> Result<ChorusConfig, ConfigError> {
    let mut config: ChorusConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

    config.database.path = expand_path(&config.database.path.to_string_lossy());
    Ok(config)
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ChorusConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |name| env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Tests pass a map instead of
/// mutating the process environment.
pub fn apply_overrides_from<F>(config: &mut ChorusConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut hit = |name: &str| -> Option<String> {
        let value = lookup(name)?;
        sources.env_overrides.push(name.to_string());
        Some(value)
    };

    if let Some(v) = hit("CHORUS_SERVER_NAME") {
        config.server.server_name = v;
    }
    if let Some(v) = hit("CHORUS_DATABASE_PATH") {
        config.database.path = expand_path(&v);
    }
    if let Some(v) = hit("CHORUS_CACHE_FACTOR") {
        if let Ok(factor) = v.parse() {
            config.caches.global_factor = factor;
        }
    }
    if let Some(v) = hit("CHORUS_SEARCH_ALL_USERS") {
        config.user_directory.search_all_users = parse_bool(&v);
    }

    if let Some(v) = hit("CHORUS_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    // Also support RUST_LOG
    if let Some(v) = hit("RUST_LOG") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = hit("CHORUS_LOG_FORMAT") {
        config.telemetry.log_format = match v.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }
    if let Some(v) = hit("CHORUS_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
    }
    // Also support standard OTEL env var
    if let Some(v) = hit("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
    }

    if let Some(v) = hit("CHORUS_REDIS_ENABLED") {
        config.redis.enabled = parse_bool(&v);
    }
    if let Some(v) = hit("CHORUS_REDIS_HOST") {
        config.redis.host = v;
    }
    if let Some(v) = hit("CHORUS_REDIS_PORT") {
        if let Ok(port) = v.parse() {
            config.redis.port = port;
        }
    }
    if let Some(v) = hit("CHORUS_REDIS_PASSWORD") {
        config.redis.password = Some(v);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        return match stripped.split_once('/') {
            Some((var_name, rest)) => env::var(var_name)
                .map(|v| PathBuf::from(v).join(rest))
                .unwrap_or_else(|_| PathBuf::from(path)),
            None => env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path)),
        };
    }

    PathBuf::from(path)
}
