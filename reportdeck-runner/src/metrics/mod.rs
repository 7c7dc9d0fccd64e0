//! Cross-dataset derived metrics behind a single validation gate.
//!
//! Every metric declares which `(dataset, column)` inputs it reads. Before any
//! arithmetic runs, the inputs are checked in a fixed order:
//! 1. each dataset is present and non-empty, each column exists and is numeric
//! 2. series combined element-wise have equal length
//! 3. no missing, NaN or infinite value sits at a position the metric uses
//! 4. denominators are non-zero and there are enough rows
//!
//! The first failed check becomes a `fallback` result carrying the metric's
//! declared default and the failure as reason. Arithmetic is only reached
//! with inputs that cannot produce a silently wrong value.
//!
//! ```toml
//! [[metric]]
//! name = "adoptionDelta"
//! kind = "delta"
//! a = { dataset = "sector_2025", column = "adoption" }
//! b = { dataset = "sector_2024", column = "adoption" }
//! default = 0.0
//! ```

pub mod functions;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use reportdeck_core::{ColumnType, Dataset, Value};

/// One numeric input: a column of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub dataset: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(dataset: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.column)
    }
}

/// What a metric computes and from which inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricKind {
    /// Element-wise `a - b`.
    Delta { a: ColumnRef, b: ColumnRef },
    /// Element-wise `numerator / denominator`.
    Ratio {
        numerator: ColumnRef,
        denominator: ColumnRef,
    },
    /// `last / first - 1` over one series.
    GrowthRate { series: ColumnRef },
    /// Growth between each pair of consecutive values.
    PeriodGrowth { series: ColumnRef },
    Mean { series: ColumnRef },
    /// Each value divided by the series total.
    Share { series: ColumnRef },
}

impl MetricKind {
    pub fn inputs(&self) -> Vec<&ColumnRef> {
        match self {
            MetricKind::Delta { a, b } => vec![a, b],
            MetricKind::Ratio {
                numerator,
                denominator,
            } => vec![numerator, denominator],
            MetricKind::GrowthRate { series }
            | MetricKind::PeriodGrowth { series }
            | MetricKind::Mean { series }
            | MetricKind::Share { series } => vec![series],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl MetricValue {
    fn is_finite(&self) -> bool {
        match self {
            MetricValue::Scalar(v) => v.is_finite(),
            MetricValue::Series(vs) => vs.iter().all(|v| v.is_finite()),
        }
    }
}

/// A named metric and the value it reports when its inputs are unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: MetricKind,
    #[serde(default)]
    pub default: Option<MetricValue>,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, default: MetricValue) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Ok,
    Fallback,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub name: String,
    pub value: Option<MetricValue>,
    pub status: MetricStatus,
    /// Set whenever `status` is not `ok`.
    pub reason: Option<String>,
}

/// Why a metric's inputs were refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    #[error("dataset '{dataset}' is not available")]
    MissingDataset { dataset: String },

    #[error("dataset '{dataset}' is empty")]
    EmptyDataset { dataset: String },

    #[error("column '{column}' does not exist")]
    MissingColumn { column: ColumnRef },

    #[error("column '{column}' is {found}, not numeric")]
    NonNumericColumn { column: ColumnRef, found: ColumnType },

    #[error("length mismatch: '{left}' has {left_len} rows, '{right}' has {right_len} ({left_len} vs {right_len})")]
    ShapeMismatch {
        left: ColumnRef,
        left_len: usize,
        right: ColumnRef,
        right_len: usize,
    },

    #[error("missing value in '{column}' at row {row}")]
    MissingValue { column: ColumnRef, row: usize },

    #[error("zero denominator in '{column}' at row {row}")]
    ZeroDenominator { column: ColumnRef, row: usize },

    #[error("'{column}' sums to zero")]
    ZeroTotal { column: ColumnRef },

    #[error("'{column}' has {found} rows, at least {needed} needed")]
    InsufficientRows {
        column: ColumnRef,
        needed: usize,
        found: usize,
    },

    #[error("computation produced a non-finite value")]
    NonFiniteResult,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to read metric catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse metric catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("metric '{0}' is declared more than once")]
    DuplicateMetric(String),
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    metric: Vec<MetricDefinition>,
}

/// Resolved datasets by key, as produced by a load.
pub type DatasetMap = BTreeMap<String, Arc<Dataset>>;

/// A column that passed the presence and type checks. Cells are `None` where
/// the dataset holds a missing or non-finite value.
struct NumericColumn<'a> {
    column: &'a ColumnRef,
    cells: Vec<Option<f64>>,
}

impl NumericColumn<'_> {
    fn len(&self) -> usize {
        self.cells.len()
    }

    /// Values at `rows` (0-based); fails on the first unusable one.
    fn values_at(&self, rows: impl IntoIterator<Item = usize>) -> Result<Vec<f64>, ValidationFailure> {
        rows.into_iter()
            .map(|i| {
                self.cells
                    .get(i)
                    .copied()
                    .flatten()
                    .ok_or_else(|| ValidationFailure::MissingValue {
                        column: self.column.clone(),
                        row: i + 1,
                    })
            })
            .collect()
    }

    fn all_values(&self) -> Result<Vec<f64>, ValidationFailure> {
        self.values_at(0..self.len())
    }

    fn require_rows(&self, needed: usize) -> Result<(), ValidationFailure> {
        if self.len() < needed {
            return Err(ValidationFailure::InsufficientRows {
                column: self.column.clone(),
                needed,
                found: self.len(),
            });
        }
        Ok(())
    }
}

/// Metric catalog plus the validation gate.
#[derive(Debug, Clone, Default)]
pub struct MetricsEngine {
    catalog: BTreeMap<String, MetricDefinition>,
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = MetricDefinition>,
    ) -> Result<Self, MetricsError> {
        let mut engine = Self::new();
        for definition in definitions {
            engine.register(definition)?;
        }
        Ok(engine)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, MetricsError> {
        let file: CatalogFile = toml::from_str(content)?;
        Self::from_definitions(file.metric)
    }

    pub fn from_file(path: &Path) -> Result<Self, MetricsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn register(&mut self, definition: MetricDefinition) -> Result<(), MetricsError> {
        if self.catalog.contains_key(&definition.name) {
            return Err(MetricsError::DuplicateMetric(definition.name));
        }
        self.catalog.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<&MetricDefinition> {
        self.catalog.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.catalog.keys().map(String::as_str)
    }

    /// Dataset keys any catalogued metric reads.
    pub fn required_datasets(&self, name: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .catalog
            .get(name)
            .map(|d| d.kind.inputs().into_iter().map(|c| c.dataset.clone()).collect())
            .unwrap_or_default();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Compute the catalogued metric `name`. Never panics and never errors:
    /// unusable inputs give `fallback`, an unknown name gives `error`.
    pub fn compute(&self, name: &str, datasets: &DatasetMap) -> MetricResult {
        match self.catalog.get(name) {
            Some(definition) => evaluate(definition, datasets),
            None => {
                warn!(metric = name, "unknown metric");
                MetricResult {
                    name: name.to_string(),
                    value: None,
                    status: MetricStatus::Error,
                    reason: Some(format!("unknown metric '{name}'")),
                }
            }
        }
    }

    pub fn compute_many<S: AsRef<str>>(&self, names: &[S], datasets: &DatasetMap) -> Vec<MetricResult> {
        names
            .iter()
            .map(|n| self.compute(n.as_ref(), datasets))
            .collect()
    }
}

/// Run one definition through the gate and, if it passes, the arithmetic.
pub fn evaluate(definition: &MetricDefinition, datasets: &DatasetMap) -> MetricResult {
    let outcome = validate_and_compute(&definition.kind, datasets).and_then(|value| {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ValidationFailure::NonFiniteResult)
        }
    });

    match outcome {
        Ok(value) => {
            debug!(metric = %definition.name, "metric computed");
            MetricResult {
                name: definition.name.clone(),
                value: Some(value),
                status: MetricStatus::Ok,
                reason: None,
            }
        }
        Err(failure) => {
            warn!(metric = %definition.name, "metric fell back: {failure}");
            MetricResult {
                name: definition.name.clone(),
                value: definition.default.clone(),
                status: MetricStatus::Fallback,
                reason: Some(failure.to_string()),
            }
        }
    }
}

fn validate_and_compute(
    kind: &MetricKind,
    datasets: &DatasetMap,
) -> Result<MetricValue, ValidationFailure> {
    // Check 1 runs for every input before any shape check.
    let columns = kind
        .inputs()
        .into_iter()
        .map(|c| numeric_column(c, datasets))
        .collect::<Result<Vec<_>, _>>()?;

    match kind {
        MetricKind::Delta { .. } => {
            let (a, b) = pair(&columns)?;
            Ok(MetricValue::Series(functions::delta(&a, &b)))
        }
        MetricKind::Ratio { .. } => {
            let (n, d) = pair(&columns)?;
            if let Some(row) = d.iter().position(|v| *v == 0.0) {
                return Err(ValidationFailure::ZeroDenominator {
                    column: columns[1].column.clone(),
                    row: row + 1,
                });
            }
            Ok(MetricValue::Series(functions::ratio(&n, &d)))
        }
        MetricKind::GrowthRate { .. } => {
            let series = &columns[0];
            series.require_rows(2)?;
            let ends = series.values_at([0, series.len() - 1])?;
            if ends[0] == 0.0 {
                return Err(ValidationFailure::ZeroDenominator {
                    column: series.column.clone(),
                    row: 1,
                });
            }
            Ok(MetricValue::Scalar(functions::growth_rate(ends[0], ends[1])))
        }
        MetricKind::PeriodGrowth { .. } => {
            let series = &columns[0];
            series.require_rows(2)?;
            let values = series.all_values()?;
            if let Some(row) = values[..values.len() - 1].iter().position(|v| *v == 0.0) {
                return Err(ValidationFailure::ZeroDenominator {
                    column: series.column.clone(),
                    row: row + 1,
                });
            }
            Ok(MetricValue::Series(functions::period_growth(&values)))
        }
        MetricKind::Mean { .. } => {
            let values = columns[0].all_values()?;
            Ok(MetricValue::Scalar(functions::mean(&values)))
        }
        MetricKind::Share { .. } => {
            let values = columns[0].all_values()?;
            if values.iter().sum::<f64>() == 0.0 {
                return Err(ValidationFailure::ZeroTotal {
                    column: columns[0].column.clone(),
                });
            }
            Ok(MetricValue::Series(functions::share(&values)))
        }
    }
}

/// Shape check, then value check, for two element-wise operands.
fn pair(columns: &[NumericColumn<'_>]) -> Result<(Vec<f64>, Vec<f64>), ValidationFailure> {
    let (left, right) = (&columns[0], &columns[1]);
    if left.len() != right.len() {
        return Err(ValidationFailure::ShapeMismatch {
            left: left.column.clone(),
            left_len: left.len(),
            right: right.column.clone(),
            right_len: right.len(),
        });
    }
    Ok((left.all_values()?, right.all_values()?))
}

fn numeric_column<'a>(
    column: &'a ColumnRef,
    datasets: &DatasetMap,
) -> Result<NumericColumn<'a>, ValidationFailure> {
    let dataset = datasets
        .get(&column.dataset)
        .ok_or_else(|| ValidationFailure::MissingDataset {
            dataset: column.dataset.clone(),
        })?;
    if dataset.is_empty() {
        return Err(ValidationFailure::EmptyDataset {
            dataset: column.dataset.clone(),
        });
    }
    let spec = dataset
        .column_spec(&column.column)
        .ok_or_else(|| ValidationFailure::MissingColumn {
            column: column.clone(),
        })?;
    if spec.column_type != ColumnType::Numeric {
        return Err(ValidationFailure::NonNumericColumn {
            column: column.clone(),
            found: spec.column_type,
        });
    }
    let cells: Vec<Option<f64>> = dataset
        .column_values(&column.column)
        .map(|values| {
            values
                .map(|v| match v {
                    Value::Number(x) if x.is_finite() => Some(*x),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(NumericColumn { column, cells })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reportdeck_core::{Column, Provenance};

    fn numeric(key: &str, values: &[Option<f64>]) -> Arc<Dataset> {
        Arc::new(
            Dataset::new(
                key,
                vec![
                    Column::new("label", ColumnType::Categorical),
                    Column::new("v", ColumnType::Numeric).nullable(),
                ],
                values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        vec![
                            Value::Text(format!("row{i}")),
                            v.map(Value::Number).unwrap_or(Value::Missing),
                        ]
                    })
                    .collect(),
                Provenance::Extracted,
                Utc::now(),
            )
            .unwrap(),
        )
    }

    fn datasets(items: Vec<Arc<Dataset>>) -> DatasetMap {
        items
            .into_iter()
            .map(|d| (d.key().to_string(), d))
            .collect()
    }

    fn v(key: &str) -> ColumnRef {
        ColumnRef::new(key, "v")
    }

    #[test]
    fn growth_rate_ignores_missing_interior_values() {
        let data = datasets(vec![numeric("s", &[Some(80.0), None, Some(100.0)])]);
        let def = MetricDefinition::new("g", MetricKind::GrowthRate { series: v("s") });
        let result = evaluate(&def, &data);
        assert_eq!(result.status, MetricStatus::Ok);
        assert_eq!(result.value, Some(MetricValue::Scalar(0.25)));
    }

    #[test]
    fn mean_refuses_missing_value() {
        let data = datasets(vec![numeric("s", &[Some(1.0), None, Some(3.0)])]);
        let def = MetricDefinition::new("m", MetricKind::Mean { series: v("s") })
            .with_default(MetricValue::Scalar(0.0));
        let result = evaluate(&def, &data);
        assert_eq!(result.status, MetricStatus::Fallback);
        assert_eq!(result.value, Some(MetricValue::Scalar(0.0)));
        assert_eq!(result.reason.as_deref(), Some("missing value in 's.v' at row 2"));
    }

    #[test]
    fn ratio_refuses_zero_denominator() {
        let data = datasets(vec![
            numeric("n", &[Some(1.0), Some(2.0)]),
            numeric("d", &[Some(4.0), Some(0.0)]),
        ]);
        let def = MetricDefinition::new(
            "r",
            MetricKind::Ratio {
                numerator: v("n"),
                denominator: v("d"),
            },
        );
        let result = evaluate(&def, &data);
        assert_eq!(result.status, MetricStatus::Fallback);
        assert!(result.reason.unwrap().contains("zero denominator in 'd.v' at row 2"));
    }

    #[test]
    fn categorical_column_is_refused() {
        let data = datasets(vec![numeric("s", &[Some(1.0)])]);
        let def = MetricDefinition::new(
            "m",
            MetricKind::Mean {
                series: ColumnRef::new("s", "label"),
            },
        );
        let result = evaluate(&def, &data);
        assert_eq!(result.status, MetricStatus::Fallback);
        assert!(result.reason.unwrap().contains("not numeric"));
    }

    #[test]
    fn share_and_period_growth() {
        let data = datasets(vec![numeric("s", &[Some(1.0), Some(1.0), Some(2.0)])]);
        let share = evaluate(
            &MetricDefinition::new("sh", MetricKind::Share { series: v("s") }),
            &data,
        );
        assert_eq!(share.value, Some(MetricValue::Series(vec![0.25, 0.25, 0.5])));

        let growth = evaluate(
            &MetricDefinition::new("pg", MetricKind::PeriodGrowth { series: v("s") }),
            &data,
        );
        assert_eq!(growth.value, Some(MetricValue::Series(vec![0.0, 1.0])));
    }

    #[test]
    fn single_row_growth_is_insufficient() {
        let data = datasets(vec![numeric("s", &[Some(5.0)])]);
        let result = evaluate(
            &MetricDefinition::new("g", MetricKind::GrowthRate { series: v("s") }),
            &data,
        );
        assert_eq!(result.status, MetricStatus::Fallback);
        assert!(result.reason.unwrap().contains("at least 2 needed"));
    }

    #[test]
    fn catalog_from_toml() {
        let engine = MetricsEngine::from_toml_str(
            r#"
            [[metric]]
            name = "adoptionDelta"
            kind = "delta"
            a = { dataset = "sector_2025", column = "adoption" }
            b = { dataset = "sector_2024", column = "adoption" }

            [[metric]]
            name = "avgAdoption"
            kind = "mean"
            series = { dataset = "sector_2025", column = "adoption" }
            default = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(engine.names().collect::<Vec<_>>(), vec!["adoptionDelta", "avgAdoption"]);
        assert_eq!(
            engine.definition("avgAdoption").unwrap().default,
            Some(MetricValue::Scalar(0.5))
        );
        assert_eq!(
            engine.required_datasets("adoptionDelta"),
            vec!["sector_2024", "sector_2025"]
        );
    }

    #[test]
    fn duplicate_metric_names_are_rejected() {
        let def = MetricDefinition::new("m", MetricKind::Mean { series: v("s") });
        let err = MetricsEngine::from_definitions([def.clone(), def]).unwrap_err();
        assert!(matches!(err, MetricsError::DuplicateMetric(n) if n == "m"));
    }
}
