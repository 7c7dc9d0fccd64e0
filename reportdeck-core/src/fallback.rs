//! Static fallback datasets, substituted when a key cannot be resolved.
//!
//! Loaded once at startup from JSON and read-only afterwards. Cells are
//! written as plain JSON scalars and run through the same normalizer as
//! extracted tables, so a malformed fallback file fails at load time rather
//! than when a fallback is first needed.
//!
//! ```json
//! [
//!   {
//!     "key": "sector_2025",
//!     "columns": [
//!       {"name": "sector", "type": "categorical"},
//!       {"name": "adoption", "type": "numeric"}
//!     ],
//!     "rows": [["Finance", 0.4], ["Retail", 0.3]]
//!   }
//! ]
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{Column, Dataset, Provenance, RawTable};
use crate::normalize::Normalizer;
use crate::schema::{DatasetSchema, SchemaError};

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("failed to read fallback file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse fallback file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("fallback for '{key}' is invalid: {source}")]
    Invalid { key: String, source: SchemaError },

    #[error("fallback for '{0}' is declared more than once")]
    DuplicateKey(String),
}

#[derive(Deserialize)]
struct FallbackSpec {
    key: String,
    columns: Vec<Column>,
    rows: Vec<Vec<serde_json::Value>>,
}

/// Read-only map from dataset key to canned dataset.
#[derive(Debug, Clone, Default)]
pub struct FallbackProvider {
    datasets: HashMap<String, Arc<Dataset>>,
}

impl FallbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset, retagged as fallback.
    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        let dataset = dataset.with_provenance(Provenance::Fallback);
        self.datasets
            .insert(dataset.key().to_string(), Arc::new(dataset));
        self
    }

    pub fn from_json_str(content: &str, loaded_at: DateTime<Utc>) -> Result<Self, FallbackError> {
        let specs: Vec<FallbackSpec> = serde_json::from_str(content)?;
        let mut provider = Self::new();
        for spec in specs {
            if provider.datasets.contains_key(&spec.key) {
                return Err(FallbackError::DuplicateKey(spec.key));
            }
            let dataset = build(&spec, loaded_at).map_err(|source| FallbackError::Invalid {
                key: spec.key.clone(),
                source,
            })?;
            provider = provider.with_dataset(dataset);
        }
        Ok(provider)
    }

    pub fn from_file(path: &Path, loaded_at: DateTime<Utc>) -> Result<Self, FallbackError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content, loaded_at)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Dataset>> {
        self.datasets.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.datasets.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

fn build(spec: &FallbackSpec, loaded_at: DateTime<Utc>) -> Result<Dataset, SchemaError> {
    let raw = RawTable {
        document_id: format!("fallback:{}", spec.key),
        headers: spec.columns.iter().map(|c| c.name.clone()).collect(),
        rows: spec
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect(),
    };
    let dataset = Normalizer::normalize(
        &spec.key,
        &raw,
        &DatasetSchema::from_columns(&spec.columns),
        loaded_at,
    )?;
    Ok(dataset.with_provenance(Provenance::Fallback))
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;

    const FALLBACKS: &str = r#"[
        {
            "key": "sector_2025",
            "columns": [
                {"name": "sector", "type": "categorical"},
                {"name": "adoption", "type": "numeric", "nullable": true}
            ],
            "rows": [["Finance", 0.4], ["Retail", null]]
        }
    ]"#;

    #[test]
    fn loads_and_tags_as_fallback() {
        let provider = FallbackProvider::from_json_str(FALLBACKS, Utc::now()).unwrap();
        let ds = provider.get("sector_2025").unwrap();
        assert_eq!(ds.provenance(), Provenance::Fallback);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.value(0, "adoption"), Some(&Value::Number(0.4)));
        assert_eq!(ds.value(1, "adoption"), Some(&Value::Missing));
        assert!(provider.get("firm_size").is_none());
    }

    #[test]
    fn malformed_fallback_fails_at_load() {
        let bad = FALLBACKS.replace("0.4", "\"lots\"");
        let err = FallbackProvider::from_json_str(&bad, Utc::now()).unwrap_err();
        assert!(matches!(err, FallbackError::Invalid { ref key, .. } if key == "sector_2025"));
    }

    #[test]
    fn duplicate_fallback_keys_are_rejected() {
        let doubled = format!(
            "[{0},{0}]",
            FALLBACKS.trim().trim_start_matches('[').trim_end_matches(']')
        );
        assert!(matches!(
            FallbackProvider::from_json_str(&doubled, Utc::now()),
            Err(FallbackError::DuplicateKey(_))
        ));
    }
}
