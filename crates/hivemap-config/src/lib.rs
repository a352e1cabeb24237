//! # hivemap-config
//!
//! Configuration management for hivemap.
//!
//! Loads configuration from:
//! 1. `~/.hivemap/config.toml` (global)
//! 2. `.hivemap/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Library crates take the sections they need by value; only binaries use the
//! process-wide [`config()`] accessor.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> =
    Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub views: ViewConfig,
    pub host: HostConfig,
    pub notify: NotifyConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Path::new(".hivemap/config.toml");
        let mut config = Self::load_from(global.as_deref(), Some(project))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load and layer two config files without looking at the environment.
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!(path = %path.display(), "Loading config");
            let contents = std::fs::read_to_string(path)?;
            let table: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, table);
        }

        Ok(Config::deserialize(toml::Value::Table(merged))?)
    }

    /// Global config path: ~/.hivemap/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hivemap/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("HIVEMAP_MAX_VIEWS") {
            self.views.max_views_per_file = n;
        }
        if let Some(n) = env_parse("HIVEMAP_VIEW_SIZE") {
            self.views.view_size = n;
        }
        if let Some(n) = env_parse("HIVEMAP_MAX_MAPPINGS") {
            self.host.max_mappings = Some(n);
        }
        if let Ok(level) = std::env::var("HIVEMAP_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.views;
        if !v.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size {} is not a power of two",
                v.page_size
            )));
        }
        if !v.view_size.is_power_of_two() || v.view_size < v.page_size {
            return Err(ConfigError::Invalid(format!(
                "view_size {} must be a power of two no smaller than page_size {}",
                v.view_size, v.page_size
            )));
        }
        if v.max_views_per_file == 0 {
            return Err(ConfigError::Invalid(
                "max_views_per_file must be at least 1".to_string(),
            ));
        }
        if self.host.max_mappings == Some(0) {
            return Err(ConfigError::Invalid(
                "host.max_mappings must be at least 1 when set".to_string(),
            ));
        }
        if self.logging.level.parse::<logging::LogLevel>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level {:?}",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default().to_toml()
    }

    pub fn to_toml(&self) -> String {
        // Every field is a plain scalar or table, serialization cannot fail.
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Recursively overlay `overlay` onto `base`; tables merge, scalars replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
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

/// View cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Bytes covered by one view; views are aligned to this size
    pub view_size: u32,
    /// Granularity of per-page ownership tracking
    pub page_size: u32,
    /// Soft cap on mapped plus pinned views per backing file
    pub max_views_per_file: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            view_size: 16 * 1024,
            page_size: 4096,
            // 4 MiB of address space per file
            max_views_per_file: 256,
        }
    }
}

/// Host cache manager tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Process-wide limit on live host mappings (None = unlimited)
    pub max_mappings: Option<usize>,
    /// Flush the file range as soon as a pinned view is released
    pub flush_on_unpin: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_mappings: None,
            flush_on_unpin: true,
        }
    }
}

/// Notification delivery tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Bound of the delivery worker queue
    pub worker_queue_capacity: usize,
    /// Default wait for synchronous watches in milliseconds
    pub sync_wait_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            worker_queue_capacity: 1024,
            sync_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
