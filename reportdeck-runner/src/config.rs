//! Deck configuration: TOML file, then environment overrides, then validation.
//!
//! ```toml
//! registry_path = "config/registry.toml"
//! fallback_path = "config/fallbacks.json"
//! metrics_path = "config/metrics.toml"
//!
//! [cache]
//! memory_max_entries = 32
//! memory_ttl_secs = 600
//!
//! [loader]
//! max_concurrency = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use reportdeck_core::{CacheConfig, ExtractConfig};

pub const ENV_MEMORY_MAX_ENTRIES: &str = "REPORTDECK_MEMORY_MAX_ENTRIES";
pub const ENV_MEMORY_TTL_SECS: &str = "REPORTDECK_MEMORY_TTL_SECS";
pub const ENV_DISK_MAX_BYTES: &str = "REPORTDECK_DISK_MAX_BYTES";
pub const ENV_DISK_DIR: &str = "REPORTDECK_DISK_DIR";
pub const ENV_MAX_CONCURRENCY: &str = "REPORTDECK_MAX_CONCURRENCY";
pub const ENV_SOURCE_TIMEOUT_MS: &str = "REPORTDECK_SOURCE_TIMEOUT_MS";
pub const ENV_BATCH_DEADLINE_MS: &str = "REPORTDECK_BATCH_DEADLINE_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {var}='{value}' is invalid: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pool and batch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Worker threads shared by every job in a batch.
    pub max_concurrency: usize,
    /// Upper bound on one `load` call.
    pub batch_deadline_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_deadline_ms: 30_000,
        }
    }
}

impl LoaderConfig {
    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }
}

/// Everything needed to assemble a [`crate::ReportDeck`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckConfig {
    pub cache: CacheConfig,
    pub extract: ExtractConfig,
    pub loader: LoaderConfig,
    /// Source registry TOML. Without one, every key is unknown.
    pub registry_path: Option<PathBuf>,
    /// Fallback datasets JSON.
    pub fallback_path: Option<PathBuf>,
    /// Metric catalog TOML.
    pub metrics_path: Option<PathBuf>,
}

impl DeckConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `REPORTDECK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_MEMORY_MAX_ENTRIES)? {
            self.cache.memory_max_entries = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MEMORY_TTL_SECS)? {
            self.cache.memory_ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_DISK_MAX_BYTES)? {
            self.cache.disk_max_bytes = v;
        }
        if let Some(dir) = lookup(ENV_DISK_DIR).filter(|d| !d.trim().is_empty()) {
            self.cache.disk_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_CONCURRENCY)? {
            self.loader.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SOURCE_TIMEOUT_MS)? {
            self.extract.source_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BATCH_DEADLINE_MS)? {
            self.loader.batch_deadline_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 6] = [
            ("cache.memory_max_entries", self.cache.memory_max_entries == 0),
            ("cache.memory_ttl_secs", self.cache.memory_ttl_secs == 0),
            ("cache.disk_max_bytes", self.cache.disk_max_bytes == 0),
            ("extract.source_timeout_ms", self.extract.source_timeout_ms == 0),
            ("loader.max_concurrency", self.loader.max_concurrency == 0),
            ("loader.batch_deadline_ms", self.loader.batch_deadline_ms == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }
        if self.extract.breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "extract.breaker_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
