//! The presentation-facing facade.
//!
//! A `ReportDeck` is built once at startup from a [`DeckConfig`] and owns the
//! cache, the catalogs and the loader. Views only ever call [`ReportDeck::load`]
//! and [`ReportDeck::compute`]; cache tiers and extraction stay behind it.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use reportdeck_core::{
    CacheError, CacheStatus, Clock, Extractor, FallbackError, FallbackProvider, RawTableSource,
    RegistryError, SourceRegistry, SystemClock, TieredCache,
};

use crate::config::{ConfigError, DeckConfig, LoaderConfig};
use crate::loader::{LoadOptions, LoadResult, Loader, LoaderError};
use crate::metrics::{DatasetMap, MetricResult, MetricsEngine, MetricsError};

#[derive(Debug, Error)]
pub enum DeckError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Pre-built collaborators, for callers (and tests) that assemble a deck
/// without configuration files.
pub struct DeckParts {
    pub cache: Arc<TieredCache>,
    pub registry: Arc<SourceRegistry>,
    pub extractor: Arc<Extractor>,
    pub fallbacks: Arc<FallbackProvider>,
    pub metrics: MetricsEngine,
    pub clock: Arc<dyn Clock>,
    pub loader: LoaderConfig,
}

pub struct ReportDeck {
    cache: Arc<TieredCache>,
    registry: Arc<SourceRegistry>,
    loader: Loader,
    metrics: MetricsEngine,
}

impl ReportDeck {
    /// Build from configuration, reading the registry, fallback and metric
    /// catalogs it points at.
    pub fn open(config: &DeckConfig, source: Arc<dyn RawTableSource>) -> Result<Self, DeckError> {
        Self::open_with_clock(config, source, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: &DeckConfig,
        source: Arc<dyn RawTableSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeckError> {
        config.validate()?;

        let registry = match &config.registry_path {
            Some(path) => SourceRegistry::from_file(path)?,
            None => SourceRegistry::new(),
        };
        let fallbacks = match &config.fallback_path {
            Some(path) => FallbackProvider::from_file(path, clock.now())?,
            None => FallbackProvider::new(),
        };
        let metrics = match &config.metrics_path {
            Some(path) => MetricsEngine::from_file(path)?,
            None => MetricsEngine::new(),
        };
        let cache = TieredCache::open(&config.cache, Arc::clone(&clock))?;

        info!(
            datasets = registry.len(),
            fallbacks = fallbacks.len(),
            metrics = metrics.names().count(),
            source = source.name(),
            "report deck opened"
        );

        Self::from_parts(DeckParts {
            cache: Arc::new(cache),
            registry: Arc::new(registry),
            extractor: Arc::new(Extractor::new(source, &config.extract)),
            fallbacks: Arc::new(fallbacks),
            metrics,
            clock,
            loader: config.loader.clone(),
        })
    }

    pub fn from_parts(parts: DeckParts) -> Result<Self, DeckError> {
        let loader = Loader::new(
            Arc::clone(&parts.cache),
            Arc::clone(&parts.registry),
            parts.extractor,
            parts.fallbacks,
            parts.clock,
            parts.loader,
        )?;
        Ok(Self {
            cache: parts.cache,
            registry: parts.registry,
            loader,
            metrics: parts.metrics,
        })
    }

    /// Resolve `keys` with default options.
    pub fn load<K: AsRef<str>>(&self, keys: &[K]) -> LoadResult {
        self.loader.load(keys, &LoadOptions::default())
    }

    pub fn load_with<K: AsRef<str>>(&self, keys: &[K], options: &LoadOptions) -> LoadResult {
        self.loader.load(keys, options)
    }

    /// Compute a catalogued metric over datasets already resolved by a load.
    pub fn compute(&self, metric: &str, datasets: &DatasetMap) -> MetricResult {
        self.metrics.compute(metric, datasets)
    }

    /// Load whatever `metric` reads, then compute it.
    pub fn load_and_compute(&self, metric: &str) -> (LoadResult, MetricResult) {
        let keys = self.metrics.required_datasets(metric);
        let loaded = self.load(&keys);
        let result = self.compute(metric, &loaded.datasets());
        (loaded, result)
    }

    /// Drop `key` from both cache tiers.
    pub fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        self.cache.invalidate(key)
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.cache.status()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsEngine {
        &self.metrics
    }

    /// Wait for queued disk writes and stop the cache's writer.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}
