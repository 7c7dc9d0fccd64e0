//! Batch dataset resolution.
//!
//! Given a set of dataset keys, resolves each one and reports how. The policy
//! per key:
//! 1. If the cache holds a fresh entry → use it
//! 2. Otherwise extract + normalize on the worker pool, then cache the result
//! 3. If that fails or misses the batch deadline → substitute the fallback
//!    dataset for that key
//! 4. Otherwise → report the key as failed (no data available)
//!
//! Failures never cross keys and never fail the batch; every requested key
//! gets exactly one outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use reportdeck_core::cache::CacheTier;
use reportdeck_core::{
    CacheHit, Clock, Dataset, ExtractError, Extractor, FallbackProvider, Normalizer, SchemaError,
    SourceEntry, SourceRegistry, TieredCache,
};

use crate::config::LoaderConfig;

/// Why a key could not be resolved from its sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    #[error("dataset '{0}' is not in the source registry")]
    UnknownKey(String),

    #[error(transparent)]
    Extraction(#[from] ExtractError),

    #[error("source '{source_id}' for '{key}' failed normalization: {source}")]
    Schema {
        key: String,
        source_id: String,
        source: SchemaError,
    },

    #[error("'{key}' was not resolved within the {after:?} batch deadline")]
    Timeout { key: String, after: Duration },

    #[error("resolution of '{key}' aborted: {reason}")]
    Aborted { key: String, reason: String },

    #[error("no data available for '{key}': {cause}")]
    NoDataAvailable { key: String, cause: Box<KeyError> },
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// How a key was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum LoadStatus {
    HitMemory,
    HitDisk,
    Extracted,
    Fallback { reason: String },
    Failed { reason: String },
}

impl LoadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LoadStatus::HitMemory => "hit-memory",
            LoadStatus::HitDisk => "hit-disk",
            LoadStatus::Extracted => "extracted",
            LoadStatus::Fallback { .. } => "fallback",
            LoadStatus::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            LoadStatus::Fallback { reason } | LoadStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result for one key. `dataset` is `None` only when the status is `Failed`.
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub dataset: Option<Arc<Dataset>>,
    pub status: LoadStatus,
    pub error: Option<KeyError>,
}

impl KeyOutcome {
    fn hit(hit: CacheHit) -> Self {
        let status = match hit.tier {
            CacheTier::Memory => LoadStatus::HitMemory,
            CacheTier::Disk => LoadStatus::HitDisk,
        };
        Self {
            dataset: Some(hit.dataset),
            status,
            error: None,
        }
    }

    fn extracted(dataset: Arc<Dataset>) -> Self {
        Self {
            dataset: Some(dataset),
            status: LoadStatus::Extracted,
            error: None,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip cache reads; fresh results are still cached.
    pub force_refresh: bool,
    /// Overrides the configured batch deadline for this call.
    pub deadline: Option<Duration>,
}

/// Counts of outcomes by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub hit_memory: usize,
    pub hit_disk: usize,
    pub extracted: usize,
    pub fallback: usize,
    pub failed: usize,
}

/// Every requested key mapped to its outcome.
#[derive(Debug, Clone)]
pub struct LoadResult {
    outcomes: BTreeMap<String, KeyOutcome>,
    elapsed: Duration,
}

impl LoadResult {
    pub fn get(&self, key: &str) -> Option<&KeyOutcome> {
        self.outcomes.get(key)
    }

    pub fn status(&self, key: &str) -> Option<&LoadStatus> {
        self.outcomes.get(key).map(|o| &o.status)
    }

    pub fn dataset(&self, key: &str) -> Option<&Arc<Dataset>> {
        self.outcomes.get(key).and_then(|o| o.dataset.as_ref())
    }

    /// Outcomes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyOutcome)> {
        self.outcomes.iter().map(|(k, o)| (k.as_str(), o))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for outcome in self.outcomes.values() {
            match outcome.status {
                LoadStatus::HitMemory => counts.hit_memory += 1,
                LoadStatus::HitDisk => counts.hit_disk += 1,
                LoadStatus::Extracted => counts.extracted += 1,
                LoadStatus::Fallback { .. } => counts.fallback += 1,
                LoadStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// True when no key needed a fallback or failed.
    pub fn is_fully_fresh(&self) -> bool {
        self.outcomes.values().all(|o| {
            matches!(
                o.status,
                LoadStatus::HitMemory | LoadStatus::HitDisk | LoadStatus::Extracted
            )
        })
    }

    /// Keys the presentation layer must show as unavailable.
    pub fn unavailable_keys(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.dataset.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Every resolved dataset (extracted, cached or fallback) by key.
    pub fn datasets(&self) -> BTreeMap<String, Arc<Dataset>> {
        self.outcomes
            .iter()
            .filter_map(|(k, o)| o.dataset.as_ref().map(|d| (k.clone(), Arc::clone(d))))
            .collect()
    }
}

/// Everything a worker job needs, owned so the job can outlive the batch.
struct ResolveJob {
    entry: SourceEntry,
    extractor: Arc<Extractor>,
    cache: Arc<TieredCache>,
    clock: Arc<dyn Clock>,
    cancelled: Arc<AtomicBool>,
}

impl ResolveJob {
    fn run(self) -> Result<Arc<Dataset>, KeyError> {
        let dataset = Arc::new(self.resolve()?);
        if self.cancelled.load(Ordering::SeqCst) {
            debug!(key = %self.entry.key, "batch deadline passed, discarding late result");
        } else {
            self.cache.put(Arc::clone(&dataset));
        }
        Ok(dataset)
    }

    /// Try each declared source in order; the first that extracts and
    /// normalizes wins. The last failure is reported.
    fn resolve(&self) -> Result<Dataset, KeyError> {
        let key = &self.entry.key;
        let mut last_error = None;
        for source_id in &self.entry.sources {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let raw = match self.extractor.extract(source_id) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(key = %key, source_id = %source_id, "source failed: {e}");
                    last_error = Some(KeyError::Extraction(e));
                    continue;
                }
            };
            match Normalizer::normalize(key, &raw, &self.entry.schema, self.clock.now()) {
                Ok(dataset) => return Ok(dataset),
                Err(source) => {
                    debug!(key = %key, source_id = %source_id, "normalization failed: {source}");
                    last_error = Some(KeyError::Schema {
                        key: key.clone(),
                        source_id: source_id.clone(),
                        source,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| KeyError::Aborted {
            key: key.clone(),
            reason: "cancelled before any source was tried".into(),
        }))
    }
}

/// Resolves batches of keys through the cache, the extractor and the
/// fallback provider on a private, fixed-size worker pool.
pub struct Loader {
    cache: Arc<TieredCache>,
    registry: Arc<SourceRegistry>,
    extractor: Arc<Extractor>,
    fallbacks: Arc<FallbackProvider>,
    clock: Arc<dyn Clock>,
    pool: rayon::ThreadPool,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(
        cache: Arc<TieredCache>,
        registry: Arc<SourceRegistry>,
        extractor: Arc<Extractor>,
        fallbacks: Arc<FallbackProvider>,
        clock: Arc<dyn Clock>,
        config: LoaderConfig,
    ) -> Result<Self, LoaderError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency.max(1))
            .thread_name(|i| format!("reportdeck-load-{i}"))
            .build()?;
        Ok(Self {
            cache,
            registry,
            extractor,
            fallbacks,
            clock,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Resolve every key in `keys`. Duplicates are collapsed and order does
    /// not matter. Never fails as a whole.
    ///
    /// Blocks until every dispatched job has reported or the batch deadline
    /// has passed. Jobs still running at the deadline are abandoned and their
    /// keys fall back.
    pub fn load<K: AsRef<str>>(&self, keys: &[K], options: &LoadOptions) -> LoadResult {
        let started = Instant::now();
        let deadline = options
            .deadline
            .unwrap_or_else(|| self.config.batch_deadline());
        let requested: BTreeSet<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();

        let mut outcomes = BTreeMap::new();
        let mut misses = Vec::new();
        for key in requested {
            if !options.force_refresh {
                if let Some(hit) = self.cache.get(&key) {
                    outcomes.insert(key, KeyOutcome::hit(hit));
                    continue;
                }
            }
            match self.registry.get(&key) {
                Some(entry) => misses.push(entry.clone()),
                None => {
                    let outcome = self.substitute(&key, KeyError::UnknownKey(key.clone()), options);
                    outcomes.insert(key, outcome);
                }
            }
        }

        if !misses.is_empty() {
            self.dispatch(misses, started + deadline, deadline, options, &mut outcomes);
        }

        let result = LoadResult {
            outcomes,
            elapsed: started.elapsed(),
        };
        let counts = result.counts();
        info!(
            keys = result.len(),
            hit_memory = counts.hit_memory,
            hit_disk = counts.hit_disk,
            extracted = counts.extracted,
            fallback = counts.fallback,
            failed = counts.failed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "load complete"
        );
        result
    }

    fn dispatch(
        &self,
        misses: Vec<SourceEntry>,
        deadline_at: Instant,
        deadline: Duration,
        options: &LoadOptions,
        outcomes: &mut BTreeMap<String, KeyOutcome>,
    ) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(String, Result<Arc<Dataset>, KeyError>)>();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        debug!(jobs = misses.len(), "dispatching resolve jobs");
        for entry in misses {
            pending.insert(entry.key.clone());
            let key = entry.key.clone();
            let job = ResolveJob {
                entry,
                extractor: Arc::clone(&self.extractor),
                cache: Arc::clone(&self.cache),
                clock: Arc::clone(&self.clock),
                cancelled: Arc::clone(&cancelled),
            };
            let tx = tx.clone();
            self.pool.spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| job.run())).unwrap_or_else(|_| {
                    Err(KeyError::Aborted {
                        key: key.clone(),
                        reason: "resolve job panicked".into(),
                    })
                });
                // The batch may have stopped listening.
                let _ = tx.send((key, result));
            });
        }
        drop(tx);

        let mut timed_out = false;
        while !pending.is_empty() {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((key, result)) => {
                    pending.remove(&key);
                    let outcome = match result {
                        Ok(dataset) => KeyOutcome::extracted(dataset),
                        Err(e) => self.substitute(&key, e, options),
                    };
                    outcomes.insert(key, outcome);
                }
                Err(RecvTimeoutError::Timeout) => {
                    cancelled.store(true, Ordering::SeqCst);
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for key in pending {
            let cause = if timed_out {
                KeyError::Timeout {
                    key: key.clone(),
                    after: deadline,
                }
            } else {
                KeyError::Aborted {
                    key: key.clone(),
                    reason: "worker exited without reporting".into(),
                }
            };
            let outcome = self.substitute(&key, cause, options);
            outcomes.insert(key, outcome);
        }
    }

    /// The single place a failed key is turned into an outcome.
    fn substitute(&self, key: &str, cause: KeyError, options: &LoadOptions) -> KeyOutcome {
        // A forced refresh that fails still has whatever the cache holds.
        if options.force_refresh {
            if let Some(hit) = self.cache.get(key) {
                warn!(key, "refresh failed, serving cached entry: {cause}");
                return KeyOutcome {
                    error: Some(cause),
                    ..KeyOutcome::hit(hit)
                };
            }
        }

        if let Some(dataset) = self.fallbacks.get(key) {
            warn!(key, "substituting fallback dataset: {cause}");
            return KeyOutcome {
                dataset: Some(dataset),
                status: LoadStatus::Fallback {
                    reason: cause.to_string(),
                },
                error: Some(cause),
            };
        }

        let error = KeyError::NoDataAvailable {
            key: key.to_string(),
            cause: Box::new(cause),
        };
        warn!(key, "{error}");
        KeyOutcome {
            dataset: None,
            status: LoadStatus::Failed {
                reason: error.to_string(),
            },
            error: Some(error),
        }
    }
}
