//! Static catalog: dataset key -> source documents + normalization schema.
//!
//! Loaded once at startup from TOML and read-only afterwards.
//!
//! ```toml
//! [[dataset]]
//! key = "sector_2025"
//! sources = ["reports/sector_2025", "mirror/sector_2025"]
//!
//! [[dataset.columns]]
//! name = "sector"
//! type = "categorical"
//! header = "Sector"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::schema::{DatasetSchema, SchemaError};

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub key: String,
    /// Source documents, tried in order until one normalizes.
    pub sources: Vec<String>,
    #[serde(flatten)]
    pub schema: DatasetSchema,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse registry: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("dataset key '{0}' is declared more than once")]
    DuplicateKey(String),

    #[error("dataset '{0}' declares no sources")]
    NoSources(String),

    #[error("dataset '{key}' has an invalid schema: {source}")]
    InvalidSchema { key: String, source: SchemaError },
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    dataset: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: BTreeMap<String, SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = SourceEntry>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(entry)?;
        }
        Ok(registry)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(content)?;
        Self::from_entries(file.dataset)
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn insert(&mut self, entry: SourceEntry) -> Result<(), RegistryError> {
        if entry.sources.is_empty() {
            return Err(RegistryError::NoSources(entry.key));
        }
        if let Err(source) = entry.schema.validate() {
            return Err(RegistryError::InvalidSchema {
                key: entry.key,
                source,
            });
        }
        if self.entries.contains_key(&entry.key) {
            return Err(RegistryError::DuplicateKey(entry.key));
        }
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&SourceEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
