//! Raw extraction output, before schema validation.

use serde::{Deserialize, Serialize};

/// What kind of content a raw record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Table,
    Chart,
    Text,
}

/// One record produced by the external extraction capability.
///
/// For tables the payload is the grid of cells, header row included.
/// Chart and text records are carried through but never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub document_id: String,
    pub kind: RecordKind,
    pub payload: Vec<Vec<String>>,
}

impl RawRecord {
    pub fn table(document_id: impl Into<String>, payload: Vec<Vec<String>>) -> Self {
        Self {
            document_id: document_id.into(),
            kind: RecordKind::Table,
            payload,
        }
    }
}

/// A header row plus data rows, all cells still strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub document_id: String,
    /// Column names as the document states them.
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Split a table record's payload into header and rows.
    ///
    /// Returns `None` for non-table records and for payloads without a header row.
    pub fn from_record(record: RawRecord) -> Option<Self> {
        if record.kind != RecordKind::Table {
            return None;
        }
        let mut grid = record.payload.into_iter();
        let headers = grid.next()?;
        Some(Self {
            document_id: record.document_id,
            headers,
            rows: grid.collect(),
        })
    }
}
