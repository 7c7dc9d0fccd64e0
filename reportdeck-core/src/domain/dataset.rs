//! The schema-validated, immutable `Dataset` value.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::SchemaError;

/// Declared semantic type of a dataset column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
    Date,
    Identifier,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Numeric => "numeric",
            ColumnType::Categorical => "categorical",
            ColumnType::Date => "date",
            ColumnType::Identifier => "identifier",
        };
        f.write_str(name)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether cells may hold [`Value::Missing`].
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Whether `value` is a legal cell for this column.
    pub fn accepts(&self, value: &Value) -> bool {
        match value {
            Value::Missing => self.nullable,
            Value::Number(_) => self.column_type == ColumnType::Numeric,
            Value::Date(_) => self.column_type == ColumnType::Date,
            Value::Text(_) => matches!(
                self.column_type,
                ColumnType::Categorical | ColumnType::Identifier
            ),
        }
    }
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
    Date(NaiveDate),
    Missing,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    fn size_estimate(&self) -> usize {
        match self {
            Value::Number(_) => 8,
            Value::Text(s) => s.len() + 24,
            Value::Date(_) => 4,
            Value::Missing => 1,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{d}"),
            Value::Missing => f.write_str(""),
        }
    }
}

/// Where a dataset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Extracted,
    Fallback,
}

/// Immutable, schema-validated table.
///
/// Every row has exactly one cell per declared column and every cell matches
/// its column's type. The constructor enforces this, and so does
/// deserialization, so a `Dataset` obtained from disk carries the same
/// guarantee as one produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DatasetParts")]
pub struct Dataset {
    key: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    provenance: Provenance,
    fresh_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DatasetParts {
    key: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    provenance: Provenance,
    fresh_at: DateTime<Utc>,
}

impl TryFrom<DatasetParts> for Dataset {
    type Error = SchemaError;

    fn try_from(parts: DatasetParts) -> Result<Self, Self::Error> {
        Dataset::new(
            parts.key,
            parts.columns,
            parts.rows,
            parts.provenance,
            parts.fresh_at,
        )
    }
}

impl Dataset {
    /// Build a dataset, checking the row/column invariant.
    pub fn new(
        key: impl Into<String>,
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
        provenance: Provenance,
        fresh_at: DateTime<Utc>,
    ) -> Result<Self, SchemaError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }

        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(SchemaError::RowShape {
                    row: row_idx + 1,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            for (column, value) in columns.iter().zip(row) {
                if !column.accepts(value) {
                    return Err(SchemaError::TypeMismatch {
                        row: row_idx + 1,
                        column: column.name.clone(),
                        expected: column.column_type,
                    });
                }
            }
        }

        Ok(Self {
            key: key.into(),
            columns,
            rows,
            provenance,
            fresh_at,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn fresh_at(&self) -> DateTime<Utc> {
        self.fresh_at
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_spec(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Cells of one column, in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Value> + 'a> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// A single cell looked up by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// The same data with a different provenance tag.
    pub fn with_provenance(&self, provenance: Provenance) -> Self {
        Self {
            provenance,
            ..self.clone()
        }
    }

    /// The same data stamped with a new freshness time.
    pub fn with_fresh_at(&self, fresh_at: DateTime<Utc>) -> Self {
        Self {
            fresh_at,
            ..self.clone()
        }
    }

    /// Rough in-memory footprint in bytes.
    pub fn size_estimate(&self) -> usize {
        let header: usize = self.key.len()
            + self
                .columns
                .iter()
                .map(|c| c.name.len() + 16)
                .sum::<usize>();
        let cells: usize = self
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .map(Value::size_estimate)
            .sum();
        header + cells + self.rows.len() * 24
    }

    /// BLAKE3 digest over key, schema and cells.
    ///
    /// Provenance and freshness are excluded, so the same content extracted
    /// at two different times hashes identically.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.key.as_bytes());
        for column in &self.columns {
            hasher.update(column.name.as_bytes());
            hasher.update(column.column_type.to_string().as_bytes());
            hasher.update(&[u8::from(column.nullable)]);
        }
        for row in &self.rows {
            for value in row {
                match value {
                    Value::Number(v) => {
                        hasher.update(b"n");
                        hasher.update(&v.to_le_bytes());
                    }
                    Value::Text(s) => {
                        hasher.update(b"t");
                        hasher.update(&(s.len() as u64).to_le_bytes());
                        hasher.update(s.as_bytes());
                    }
                    Value::Date(d) => {
                        hasher.update(b"d");
                        hasher.update(d.to_string().as_bytes());
                    }
                    Value::Missing => {
                        hasher.update(b"m");
                    }
                }
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}
