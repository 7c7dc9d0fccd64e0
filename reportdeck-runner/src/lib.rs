//! ReportDeck Runner: batch loading, derived metrics, and the deck facade.
//!
//! This crate builds on `reportdeck-core` to provide:
//! - Batch loader with a bounded worker pool, batch deadline and per-key fallback
//! - Metric catalog with a shape/type validation gate
//! - Aggregate configuration (TOML + environment overrides)
//! - `ReportDeck`, the only surface the presentation layer calls

pub mod config;
pub mod deck;
pub mod loader;
pub mod metrics;

pub use config::{ConfigError, DeckConfig, LoaderConfig};
pub use deck::{DeckError, DeckParts, ReportDeck};
pub use loader::{
    KeyError, KeyOutcome, LoadOptions, LoadResult, LoadStatus, Loader, LoaderError, StatusCounts,
};
pub use metrics::{
    ColumnRef, DatasetMap, MetricDefinition, MetricKind, MetricResult, MetricStatus, MetricValue,
    MetricsEngine, MetricsError, ValidationFailure,
};
