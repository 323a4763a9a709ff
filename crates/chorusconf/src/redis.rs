//! Redis settings: the replication bus connection and the optional tier of
//! shared cache shards used by cooperating worker processes.
//!
//! The shard tier is purely declarative here. The remote cache client reads
//! these values; nothing in chorus mutates them. With `enabled = false` there
//! is no shard tier and every change cache is local to the process.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::duration::{deserialize_opt_duration, format_duration};
use crate::ConfigError;

/// One cache shard endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheShardHost {
    #[serde(default = "RedisConfig::default_host")]
    pub host: String,

    #[serde(default = "RedisConfig::default_port")]
    pub port: u16,
}

/// Long-term shared caches. Should point at instances that evict on memory
/// pressure and are not the replication instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheShardConfig {
    /// Endpoints in shard order.
    #[serde(default)]
    pub hosts: Vec<CacheShardHost>,

    /// Attach a TTL to every entry written to the shards.
    #[serde(default)]
    pub expire_caches: bool,

    /// TTL applied when `expire_caches` is set, e.g. `"30m"`.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub cache_entry_ttl: Option<Duration>,
}

impl CacheShardConfig {
    /// TTL to apply to shard entries, `None` when entries never expire.
    pub fn entry_ttl(&self) -> Option<Duration> {
        if self.expire_caches {
            self.cache_entry_ttl
        } else {
            None
        }
    }
}

/// The `[redis]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Default: localhost
    #[serde(default = "RedisConfig::default_host")]
    pub host: String,

    /// Default: 6379
    #[serde(default = "RedisConfig::default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_shards: Option<CacheShardConfig>,
}

impl RedisConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        6379
    }

    /// The shard tier in effect, if any.
    ///
    /// Returns `None` when redis is disabled even if a `cache_shards` block
    /// is present, and when the block lists no hosts.
    pub fn cache_shard_tier(&self) -> Option<&CacheShardConfig> {
        if !self.enabled {
            return None;
        }
        self.cache_shards
            .as_ref()
            .filter(|shards| !shards.hosts.is_empty())
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                section: "redis",
                message: "port must be non-zero".to_string(),
            });
        }
        if let Some(shards) = &self.cache_shards {
            if let Some(bad) = shards.hosts.iter().find(|h| h.host.is_empty() || h.port == 0) {
                return Err(ConfigError::Invalid {
                    section: "redis.cache_shards",
                    message: format!("invalid shard endpoint {}:{}", bad.host, bad.port),
                });
            }
            if shards.expire_caches && shards.cache_entry_ttl.is_none() {
                return Err(ConfigError::Invalid {
                    section: "redis.cache_shards",
                    message: "expire_caches requires cache_entry_ttl".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Render the section as TOML, as written by `ChorusConfig::to_toml`.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();
        output.push_str("[redis]\n");
        output.push_str(&format!("enabled = {}\n", self.enabled));
        output.push_str(&format!("host = \"{}\"\n", self.host));
        output.push_str(&format!("port = {}\n", self.port));
        if let Some(password) = &self.password {
            output.push_str(&format!("password = \"{}\"\n", password));
        }

        if let Some(shards) = &self.cache_shards {
            output.push_str("\n[redis.cache_shards]\n");
            output.push_str(&format!("expire_caches = {}\n", shards.expire_caches));
            if let Some(ttl) = shards.cache_entry_ttl {
                output.push_str(&format!("cache_entry_ttl = \"{}\"\n", format_duration(ttl)));
            }
            output.push_str("hosts = [\n");
            for host in &shards.hosts {
                output.push_str(&format!(
                    "    {{ host = \"{}\", port = {} }},\n",
                    host.host, host.port
                ));
            }
            output.push_str("]\n");
        }

        output
    }

    /// Commented sample section for generated config files.
    pub fn generate_section() -> &'static str {
        r#"# Redis is required when running workers. It carries replication traffic
# and, optionally, a tier of shared long-term caches.
#
[redis]
# enabled = true

# Host and port of the replication instance. Defaults to localhost:6379.
#
# host = "localhost"
# port = 6379

# Password, if the instance requires one.
#
# password = "<secret_password>"

# One or more instances used for long-term shared caches. They should evict
# on memory pressure and must not be the replication instance.
#
# [redis.cache_shards]
# expire_caches = false
# cache_entry_ttl = "30m"
# hosts = [{ host = "localhost", port = 6379 }]
"#
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: Self::default_host(),
            port: Self::default_port(),
            password: None,
            cache_shards: None,
        }
    }
}

fn serialize_opt_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(d) => serializer.serialize_str(&format_duration(*d)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChorusConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_disabled_by_default() {
        let config = ChorusConfig::from_toml_str("").unwrap();
        assert!(!config.redis.enabled);
        assert!(config.redis.cache_shard_tier().is_none());
    }

    #[test]
    fn test_full_section() {
        let config = ChorusConfig::from_toml_str(
            r#"
[redis]
enabled = true
host = "replication"
port = 6380
password = "hunter2"

[redis.cache_shards]
expire_caches = true
cache_entry_ttl = "30m"
hosts = [{ host = "cache-1", port = 6379 }, { host = "cache-2" }]
"#,
        )
        .unwrap();

        let redis = &config.redis;
        assert_eq!(redis.host, "replication");
        assert_eq!(redis.port, 6380);
        assert_eq!(redis.password.as_deref(), Some("hunter2"));

        let shards = redis.cache_shard_tier().unwrap();
        assert_eq!(
            shards.hosts,
            vec![
                CacheShardHost {
                    host: "cache-1".to_string(),
                    port: 6379
                },
                CacheShardHost {
                    host: "cache-2".to_string(),
                    port: 6379
                },
            ]
        );
        assert_eq!(shards.entry_ttl(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_shards_ignored_when_disabled() {
        let config = ChorusConfig::from_toml_str(
            r#"
[redis.cache_shards]
hosts = [{ host = "cache-1", port = 6379 }]
"#,
        )
        .unwrap();
        assert!(config.redis.cache_shards.is_some());
        assert!(config.redis.cache_shard_tier().is_none());
    }

    #[test]
    fn test_ttl_without_expiry_is_not_applied() {
        let shards = CacheShardConfig {
            hosts: vec![],
            expire_caches: false,
            cache_entry_ttl: Some(Duration::from_secs(60)),
        };
        assert_eq!(shards.entry_ttl(), None);
    }

    #[test]
    fn test_expire_without_ttl_rejected() {
        let err = ChorusConfig::from_toml_str(
            r#"
[redis]
enabled = true

[redis.cache_shards]
expire_caches = true
hosts = [{ host = "cache-1", port = 6379 }]
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                section: "redis.cache_shards",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_ttl_is_parse_error() {
        let err = ChorusConfig::from_toml_str(
            r#"
[redis.cache_shards]
cache_entry_ttl = "forever"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_generated_section_parses_when_uncommented() {
        let uncommented: String = RedisConfig::generate_section()
            .lines()
            .filter_map(|line| line.strip_prefix("# "))
            .filter(|line| {
                line.starts_with('[') || (line.contains(" = ") && !line.contains("<secret"))
            })
            .map(|line| format!("{line}\n"))
            .collect();
        let text = format!("[redis]\n{uncommented}");
        let config = ChorusConfig::from_toml_str(&text).unwrap();
        assert!(config.redis.enabled);
        assert!(config.redis.cache_shard_tier().is_some());
    }
}
