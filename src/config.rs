//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub memstore: MemstoreConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// SQLite page cache size in MB (default: 16).
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            cache_size_mb: default_cache_size_mb(),
        }
    }
}

fn default_database_url() -> String {
    "hitstats.sqlite3".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_cache_size_mb() -> u32 {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemstoreConfig {
    /// How often buffered hits are persisted and aggregated.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    /// Sessions not seen for this long are evicted.
    #[serde(default = "default_session_max_age")]
    pub session_max_age_secs: u64,
    /// How long a session salt stays current before it is rotated.
    #[serde(default = "default_salt_rotation")]
    pub salt_rotation_secs: u64,
    /// How often session eviction and salt rotation run.
    #[serde(default = "default_session_interval")]
    pub session_interval_secs: u64,
}

impl Default for MemstoreConfig {
    fn default() -> Self {
        Self {
            persist_interval_secs: default_persist_interval(),
            session_max_age_secs: default_session_max_age(),
            salt_rotation_secs: default_salt_rotation(),
            session_interval_secs: default_session_interval(),
        }
    }
}

impl MemstoreConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn salt_rotation(&self) -> Duration {
        Duration::from_secs(self.salt_rotation_secs)
    }

    pub fn session_interval(&self) -> Duration {
        Duration::from_secs(self.session_interval_secs)
    }
}

fn default_persist_interval() -> u64 {
    10
}

fn default_session_max_age() -> u64 {
    4 * 3600
}

fn default_salt_rotation() -> u64 {
    4 * 3600
}

fn default_session_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval(),
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_retention_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("HITSTATS").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        let intervals = [
            ("memstore.persist_interval_secs", self.memstore.persist_interval_secs),
            ("memstore.session_max_age_secs", self.memstore.session_max_age_secs),
            ("memstore.salt_rotation_secs", self.memstore.salt_rotation_secs),
            ("memstore.session_interval_secs", self.memstore.session_interval_secs),
            ("retention.interval_secs", self.retention.interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("Invalid {}: 0 is not allowed", name);
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memstore.persist_interval(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = Config::default();
        config.retention.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
