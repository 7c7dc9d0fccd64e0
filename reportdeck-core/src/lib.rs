//! ReportDeck Core: dataset model, source catalog, extraction, normalization, tiered cache.
//!
//! This crate contains the leaves of the data-loading pipeline:
//! - Domain types (raw records and tables, typed datasets)
//! - Source registry and normalization schemas
//! - Extractor with per-source timeout, panic isolation and circuit breaker
//! - All-or-nothing normalizer
//! - Two-tier cache (LRU+TTL memory over byte-budgeted disk)
//! - Static fallback datasets

pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod extract;
pub mod fallback;
pub mod normalize;
pub mod registry;
pub mod schema;

pub use cache::{
    CacheError, CacheHit, CacheStatsSnapshot, CacheStatus, CacheTier, TieredCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ExtractConfig};
pub use domain::{Column, ColumnType, Dataset, Provenance, RawRecord, RawTable, RecordKind, Value};
pub use extract::{
    CsvDocumentSource, ExtractError, Extractor, RawSourceError, RawTableSource,
};
pub use fallback::{FallbackError, FallbackProvider};
pub use normalize::Normalizer;
pub use registry::{RegistryError, SourceEntry, SourceRegistry};
pub use schema::{ColumnSpec, DatasetSchema, SchemaError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything the loader shares across worker threads
    /// is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain types
        require_send::<Dataset>();
        require_sync::<Dataset>();
        require_send::<RawTable>();
        require_sync::<RawTable>();

        // Shared services
        require_send::<TieredCache>();
        require_sync::<TieredCache>();
        require_send::<Extractor>();
        require_sync::<Extractor>();
        require_send::<SourceRegistry>();
        require_sync::<SourceRegistry>();
        require_send::<FallbackProvider>();
        require_sync::<FallbackProvider>();
        require_send::<ManualClock>();
        require_sync::<ManualClock>();

        // Errors cross the worker channel
        require_send::<ExtractError>();
        require_send::<SchemaError>();
    }

    /// The extraction boundary is object-safe so backends can be swapped.
    #[test]
    fn raw_table_source_is_object_safe() {
        fn _check(source: &dyn RawTableSource) -> Result<Vec<RawRecord>, RawSourceError> {
            source.extract_raw_tables("doc")
        }
    }
}
