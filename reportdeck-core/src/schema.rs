use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Column, ColumnType};

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared shape of one dataset: which columns, of which types, read from
/// which document headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub columns: Vec<ColumnSpec>,
    /// `chrono` format string used for date columns.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Minimum number of valid rows; fewer is an [`SchemaError::EmptyDataset`].
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_min_rows() -> usize {
    1
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Header text in the source document, when it differs from `name`.
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            header: None,
            nullable: false,
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The header this column is read from.
    pub fn header(&self) -> &str {
        self.header.as_deref().unwrap_or(&self.name)
    }

    pub fn to_column(&self) -> Column {
        Column {
            name: self.name.clone(),
            column_type: self.column_type,
            nullable: self.nullable,
        }
    }
}

impl DatasetSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            date_format: default_date_format(),
            min_rows: default_min_rows(),
        }
    }

    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = format.into();
        self
    }

    pub fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    /// Schema built from already-typed columns, reading each from its own name.
    pub fn from_columns(columns: &[Column]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|c| ColumnSpec {
                    name: c.name.clone(),
                    column_type: c.column_type,
                    header: None,
                    nullable: c.nullable,
                })
                .collect(),
        )
    }

    pub fn output_columns(&self) -> Vec<Column> {
        self.columns.iter().map(ColumnSpec::to_column).collect()
    }

    /// Check the schema is usable: at least one column, unique names.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns);
        }
        for (i, spec) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == spec.name) {
                return Err(SchemaError::DuplicateColumn(spec.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema declares no columns")]
    NoColumns,

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("missing required column '{column}' (header '{header}')")]
    MissingColumn { column: String, header: String },

    #[error("header '{header}' for column '{column}' appears more than once")]
    AmbiguousColumn { column: String, header: String },

    #[error("row {row}: cannot read '{value}' in column '{column}' as {expected}")]
    Coercion {
        row: usize,
        column: String,
        value: String,
        expected: ColumnType,
    },

    #[error("row {row}: expected {expected} cells, found {found}")]
    RowShape {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {row}: value in column '{column}' is not {expected}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
    },

    #[error("dataset '{key}' has {rows} valid rows, at least {min_rows} required")]
    EmptyDataset {
        key: String,
        rows: usize,
        min_rows: usize,
    },
}
