//! Cache and extraction settings.
//!
//! Every field has a default so a partial TOML table (or none at all) is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::clock;

/// Tiered cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of datasets held in the memory tier.
    pub memory_max_entries: usize,
    /// Age after which an entry is treated as absent, in both tiers.
    pub memory_ttl_secs: u64,
    /// Total byte budget of the disk tier.
    pub disk_max_bytes: u64,
    /// Directory holding disk-tier records.
    pub disk_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: 64,
            memory_ttl_secs: 15 * 60,
            disk_max_bytes: 256 * 1024 * 1024,
            disk_dir: PathBuf::from(".reportdeck/cache"),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::TimeDelta {
        clock::seconds(self.memory_ttl_secs)
    }
}

/// Extractor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Upper bound on a single source extraction.
    pub source_timeout_ms: u64,
    /// Consecutive failures before a source is refused.
    pub breaker_failure_threshold: u32,
    /// How long a refused source stays refused.
    pub breaker_cooldown_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 10_000,
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 5 * 60,
        }
    }
}

impl ExtractConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}
