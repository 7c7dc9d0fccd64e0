//! Raw table -> validated dataset.
//!
//! Normalization is all-or-nothing: a single cell that fails coercion fails
//! the whole call, so no truncated dataset can ever reach the cache or the
//! metrics layer.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::domain::{ColumnType, Dataset, Provenance, RawTable, Value};
use crate::schema::{ColumnSpec, DatasetSchema, SchemaError};

/// Cell texts read as "no value" in nullable columns.
const MISSING_MARKERS: &[&str] = &["", "-", "n/a", "na", "null"];

/// Schema-driven normalizer.
pub struct Normalizer;

impl Normalizer {
    /// Validate and reshape `raw` into a dataset keyed `key`.
    ///
    /// Rows whose cells are all blank are spacer rows and are skipped. Any
    /// other row must coerce completely or the call fails.
    pub fn normalize(
        key: &str,
        raw: &RawTable,
        schema: &DatasetSchema,
        fresh_at: DateTime<Utc>,
    ) -> Result<Dataset, SchemaError> {
        schema.validate()?;
        let positions = locate_columns(&raw.headers, schema)?;

        let mut rows = Vec::with_capacity(raw.rows.len());
        let mut skipped = 0usize;
        for (idx, raw_row) in raw.rows.iter().enumerate() {
            if raw_row.iter().all(|cell| cell.trim().is_empty()) {
                skipped += 1;
                continue;
            }
            let row_number = idx + 1;
            let row = schema
                .columns
                .iter()
                .zip(&positions)
                .map(|(spec, &pos)| {
                    let cell = raw_row.get(pos).map(String::as_str).unwrap_or("");
                    coerce(cell, spec, &schema.date_format, row_number)
                })
                .collect::<Result<Vec<Value>, SchemaError>>()?;
            rows.push(row);
        }

        let min_rows = schema.min_rows.max(1);
        if rows.len() < min_rows {
            return Err(SchemaError::EmptyDataset {
                key: key.to_string(),
                rows: rows.len(),
                min_rows,
            });
        }

        debug!(
            key,
            document = %raw.document_id,
            rows = rows.len(),
            skipped,
            "normalized dataset"
        );

        Dataset::new(
            key,
            schema.output_columns(),
            rows,
            Provenance::Extracted,
            fresh_at,
        )
    }
}

/// Index of the raw header backing each declared column.
///
/// Headers match after trimming, case-insensitively.
fn locate_columns(headers: &[String], schema: &DatasetSchema) -> Result<Vec<usize>, SchemaError> {
    schema
        .columns
        .iter()
        .map(|spec| {
            let wanted = spec.header().trim();
            let mut matches = headers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.trim().eq_ignore_ascii_case(wanted))
                .map(|(i, _)| i);
            let first = matches.next().ok_or_else(|| SchemaError::MissingColumn {
                column: spec.name.clone(),
                header: wanted.to_string(),
            })?;
            if matches.next().is_some() {
                return Err(SchemaError::AmbiguousColumn {
                    column: spec.name.clone(),
                    header: wanted.to_string(),
                });
            }
            Ok(first)
        })
        .collect()
}

fn coerce(cell: &str, spec: &ColumnSpec, date_format: &str, row: usize) -> Result<Value, SchemaError> {
    let text = cell.trim();
    let fail = || SchemaError::Coercion {
        row,
        column: spec.name.clone(),
        value: cell.to_string(),
        expected: spec.column_type,
    };

    if MISSING_MARKERS.iter().any(|m| text.eq_ignore_ascii_case(m)) {
        return if spec.nullable {
            Ok(Value::Missing)
        } else {
            Err(fail())
        };
    }

    match spec.column_type {
        ColumnType::Numeric => parse_number(text).map(Value::Number).ok_or_else(fail),
        ColumnType::Date => NaiveDate::parse_from_str(text, date_format)
            .map(Value::Date)
            .map_err(|_| fail()),
        ColumnType::Categorical | ColumnType::Identifier => Ok(Value::Text(text.to_string())),
    }
}

/// Strict numeric parse.
///
/// Accepts an optional sign, digits with optional `,` thousands grouping, a
/// decimal part and an exponent. Rejects anything that does not parse to a
/// finite number, including `inf` and `NaN` spellings.
fn parse_number(text: &str) -> Option<f64> {
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | ',' | 'e' | 'E');
    if text.is_empty() || !text.chars().all(allowed) {
        return None;
    }
    if text.contains(',') && !valid_grouping(text) {
        return None;
    }
    let value: f64 = text.replace(',', "").parse().ok()?;
    value.is_finite().then_some(value)
}

/// Commas must separate groups of exactly three digits in the integer part.
fn valid_grouping(text: &str) -> bool {
    let unsigned = text.trim_start_matches(['+', '-']);
    let integer = unsigned
        .split(['.', 'e', 'E'])
        .next()
        .unwrap_or_default();
    if unsigned[integer.len()..].contains(',') {
        return false;
    }
    let mut groups = integer.split(',');
    let head = groups.next().unwrap_or_default();
    (1..=3).contains(&head.len()) && groups.all(|g| g.len() == 3)
}
