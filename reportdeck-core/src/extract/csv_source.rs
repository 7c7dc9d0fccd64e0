//! CSV documents on the local filesystem as a raw table source.

use std::path::{Path, PathBuf};

use super::{RawSourceError, RawTableSource};
use crate::domain::RawRecord;

/// Reads `<root>/<source_id>.csv`, or `<root>/<source_id>` when the id
/// already carries an extension, as one table record.
#[derive(Debug, Clone)]
pub struct CsvDocumentSource {
    root: PathBuf,
}

impl CsvDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, source_id: &str) -> PathBuf {
        let candidate = self.root.join(source_id);
        if candidate.extension().is_some() {
            candidate
        } else {
            self.root.join(format!("{source_id}.csv"))
        }
    }
}

impl RawTableSource for CsvDocumentSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn extract_raw_tables(&self, source_id: &str) -> Result<Vec<RawRecord>, RawSourceError> {
        let path = self.document_path(source_id);
        if !path.is_file() {
            return Err(RawSourceError::Unreadable(format!(
                "document not found: {}",
                path.display()
            )));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_path(&path)
            .map_err(|e| RawSourceError::Unreadable(format!("{}: {e}", path.display())))?;

        let mut grid = Vec::new();
        for record in reader.records() {
            let record = record
                .map_err(|e| RawSourceError::Undecodable(format!("{}: {e}", path.display())))?;
            grid.push(record.iter().map(str::to_string).collect());
        }

        Ok(vec![RawRecord::table(source_id, grid)])
    }
}
