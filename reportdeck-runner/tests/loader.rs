//! Loader scenarios: cache reuse, failure isolation, deadlines, fallbacks,
//! and the worker pool bound.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use reportdeck_core::{
    CacheConfig, Clock, Column, ColumnSpec, ColumnType, Dataset, DatasetSchema, ExtractConfig,
    Extractor, FallbackProvider, Provenance, RawRecord, RawSourceError, RawTableSource,
    SourceEntry, SourceRegistry, SystemClock, TieredCache, Value,
};
use reportdeck_runner::{KeyError, LoadOptions, LoadStatus, Loader, LoaderConfig};

// ── Scripted document source ─────────────────────────────────────────

/// Source ids encode behaviour: `broken/..` fails, `panic/..` panics,
/// `slow/..` sleeps, `garbled/..` returns text that will not normalize.
#[derive(Default)]
struct ScriptedSource {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RawTableSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn extract_raw_tables(&self, source_id: &str) -> Result<Vec<RawRecord>, RawSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        thread::sleep(self.delay);
        if source_id.starts_with("slow/") {
            thread::sleep(Duration::from_millis(400));
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if source_id.starts_with("broken/") {
            return Err(RawSourceError::Undecodable("unexpected end of document".into()));
        }
        if source_id.starts_with("panic/") {
            panic!("decoder bug on {source_id}");
        }
        let value = if source_id.starts_with("garbled/") { "n/a?" } else { "12.5" };
        Ok(vec![RawRecord::table(
            source_id,
            vec![
                vec!["Label".into(), "Value".into()],
                vec!["alpha".into(), value.into()],
                vec!["beta".into(), "7".into()],
            ],
        )])
    }
}

// ── Harness ──────────────────────────────────────────────────────────

fn entry(key: &str, sources: &[&str]) -> SourceEntry {
    SourceEntry {
        key: key.to_string(),
        sources: sources.iter().map(|s| s.to_string()).collect(),
        schema: DatasetSchema::new(vec![
            ColumnSpec::new("label", ColumnType::Categorical),
            ColumnSpec::new("value", ColumnType::Numeric),
        ]),
    }
}

fn fallback(key: &str) -> Dataset {
    Dataset::new(
        key,
        vec![
            Column::new("label", ColumnType::Categorical),
            Column::new("value", ColumnType::Numeric),
        ],
        vec![vec![Value::Text("approx".into()), Value::Number(1.0)]],
        Provenance::Fallback,
        Utc::now(),
    )
    .unwrap()
}

struct Harness {
    loader: Loader,
    cache: Arc<TieredCache>,
    source: Arc<ScriptedSource>,
}

fn harness(
    dir: &Path,
    source: ScriptedSource,
    entries: Vec<SourceEntry>,
    fallbacks: FallbackProvider,
    loader_config: LoaderConfig,
) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(
        TieredCache::open(
            &CacheConfig {
                disk_dir: dir.to_path_buf(),
                ..CacheConfig::default()
            },
            Arc::clone(&clock),
        )
        .unwrap(),
    );
    let source = Arc::new(source);
    let extractor = Extractor::new(
        Arc::clone(&source) as Arc<dyn RawTableSource>,
        &ExtractConfig {
            source_timeout_ms: 2_000,
            ..ExtractConfig::default()
        },
    );
    let loader = Loader::new(
        Arc::clone(&cache),
        Arc::new(SourceRegistry::from_entries(entries).unwrap()),
        Arc::new(extractor),
        Arc::new(fallbacks),
        clock,
        loader_config,
    )
    .unwrap();
    Harness {
        loader,
        cache,
        source,
    }
}

fn simple(dir: &Path, entries: Vec<SourceEntry>, fallbacks: FallbackProvider) -> Harness {
    harness(
        dir,
        ScriptedSource::default(),
        entries,
        fallbacks,
        LoaderConfig::default(),
    )
}

// ── Idempotence and the two-key scenario ─────────────────────────────

#[test]
fn second_load_is_a_memory_hit_with_identical_content() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(dir.path(), vec![entry("k", &["docs/k"])], FallbackProvider::new());

    let first = h.loader.load(&["k"], &LoadOptions::default());
    let second = h.loader.load(&["k"], &LoadOptions::default());

    assert_eq!(first.status("k"), Some(&LoadStatus::Extracted));
    assert_eq!(second.status("k"), Some(&LoadStatus::HitMemory));
    assert_eq!(
        first.dataset("k").unwrap().content_hash(),
        second.dataset("k").unwrap().content_hash()
    );
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn healthy_sources_extract_then_hit_memory() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![
            entry("sector_2025", &["reports/sector_2025"]),
            entry("firm_size", &["reports/firm_size"]),
        ],
        FallbackProvider::new(),
    );
    let keys = ["sector_2025", "firm_size"];

    let first = h.loader.load(&keys, &LoadOptions::default());
    assert_eq!(first.counts().extracted, 2);
    assert!(first.is_fully_fresh());

    let second = h.loader.load(&keys, &LoadOptions::default());
    assert_eq!(second.status("sector_2025"), Some(&LoadStatus::HitMemory));
    assert_eq!(second.status("firm_size"), Some(&LoadStatus::HitMemory));
}

#[test]
fn duplicate_keys_collapse_and_order_does_not_matter() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![entry("a", &["docs/a"]), entry("b", &["docs/b"])],
        FallbackProvider::new(),
    );
    let result = h.loader.load(&["b", "a", "b"], &LoadOptions::default());
    assert_eq!(result.len(), 2);
    assert_eq!(h.source.calls(), 2);
}

// ── Failure isolation ────────────────────────────────────────────────

#[test]
fn one_failing_source_in_five_falls_back_alone() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![
            entry("k1", &["docs/k1"]),
            entry("k2", &["docs/k2"]),
            entry("k3", &["panic/k3"]),
            entry("k4", &["docs/k4"]),
            entry("k5", &["docs/k5"]),
        ],
        FallbackProvider::new().with_dataset(fallback("k3")),
    );
    // Warm one key so the batch mixes hits and extractions.
    h.loader.load(&["k1"], &LoadOptions::default());

    let result = h
        .loader
        .load(&["k1", "k2", "k3", "k4", "k5"], &LoadOptions::default());

    assert_eq!(result.len(), 5);
    assert_eq!(result.status("k1"), Some(&LoadStatus::HitMemory));
    for key in ["k2", "k4", "k5"] {
        assert_eq!(result.status(key), Some(&LoadStatus::Extracted), "{key}");
    }
    let k3 = result.get("k3").unwrap();
    assert!(matches!(k3.status, LoadStatus::Fallback { .. }));
    assert!(k3.status.reason().unwrap().contains("decoder bug"));
    assert_eq!(k3.dataset.as_ref().unwrap().provenance(), Provenance::Fallback);
}

#[test]
fn schema_failure_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![entry("g", &["garbled/g"])],
        FallbackProvider::new().with_dataset(fallback("g")),
    );
    let result = h.loader.load(&["g"], &LoadOptions::default());
    let outcome = result.get("g").unwrap();
    assert!(matches!(outcome.status, LoadStatus::Fallback { .. }));
    assert!(matches!(outcome.error, Some(KeyError::Schema { .. })));
    assert!(!h.cache.in_memory("g"));
}

#[test]
fn later_source_is_used_when_earlier_one_fails() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![entry("k", &["broken/k", "mirror/k"])],
        FallbackProvider::new(),
    );
    let result = h.loader.load(&["k"], &LoadOptions::default());
    assert_eq!(result.status("k"), Some(&LoadStatus::Extracted));
    assert_eq!(h.source.calls(), 2);
}

// ── No data available ────────────────────────────────────────────────

#[test]
fn failure_without_fallback_is_reported_per_key() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![entry("ok", &["docs/ok"]), entry("bad", &["broken/bad"])],
        FallbackProvider::new(),
    );
    let result = h.loader.load(&["ok", "bad"], &LoadOptions::default());

    assert_eq!(result.status("ok"), Some(&LoadStatus::Extracted));
    let bad = result.get("bad").unwrap();
    assert!(bad.dataset.is_none());
    assert!(matches!(bad.error, Some(KeyError::NoDataAvailable { .. })));
    assert!(bad.status.reason().unwrap().contains("no data available"));
    assert_eq!(result.unavailable_keys(), vec!["bad"]);
}

#[test]
fn unregistered_key_uses_fallback_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![],
        FallbackProvider::new().with_dataset(fallback("legacy")),
    );
    let result = h.loader.load(&["legacy", "nothing"], &LoadOptions::default());
    assert!(matches!(
        result.status("legacy"),
        Some(LoadStatus::Fallback { .. })
    ));
    assert!(matches!(
        result.status("nothing"),
        Some(LoadStatus::Failed { .. })
    ));
    assert_eq!(h.source.calls(), 0);
}

// ── Deadline ─────────────────────────────────────────────────────────

#[test]
fn batch_deadline_abandons_slow_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(
        dir.path(),
        vec![entry("fast", &["docs/fast"]), entry("slow", &["slow/slow"])],
        FallbackProvider::new().with_dataset(fallback("slow")),
    );
    let options = LoadOptions {
        deadline: Some(Duration::from_millis(150)),
        ..LoadOptions::default()
    };

    let started = Instant::now();
    let result = h.loader.load(&["fast", "slow"], &options);
    assert!(started.elapsed() < Duration::from_millis(350));

    assert_eq!(result.status("fast"), Some(&LoadStatus::Extracted));
    let slow = result.get("slow").unwrap();
    assert!(matches!(slow.status, LoadStatus::Fallback { .. }));
    assert!(matches!(slow.error, Some(KeyError::Timeout { .. })));

    // The abandoned job finishes later; its result must not be cached.
    thread::sleep(Duration::from_millis(500));
    assert!(!h.cache.in_memory("slow"));
}

// ── Options ──────────────────────────────────────────────────────────

#[test]
fn force_refresh_bypasses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(dir.path(), vec![entry("k", &["docs/k"])], FallbackProvider::new());
    h.loader.load(&["k"], &LoadOptions::default());

    let refreshed = h.loader.load(
        &["k"],
        &LoadOptions {
            force_refresh: true,
            ..LoadOptions::default()
        },
    );
    assert_eq!(refreshed.status("k"), Some(&LoadStatus::Extracted));
    assert_eq!(h.source.calls(), 2);
}

#[test]
fn failed_refresh_serves_cached_entry() {
    let dir = tempfile::tempdir().unwrap();
    let h = simple(dir.path(), vec![entry("k", &["broken/k"])], FallbackProvider::new());
    let original = fallback("k").with_provenance(Provenance::Extracted);
    h.cache.put(Arc::new(original));

    let result = h.loader.load(
        &["k"],
        &LoadOptions {
            force_refresh: true,
            ..LoadOptions::default()
        },
    );
    let outcome = result.get("k").unwrap();
    assert_eq!(outcome.status, LoadStatus::HitMemory);
    assert!(matches!(outcome.error, Some(KeyError::Extraction(_))));
}

// ── Pool bound ───────────────────────────────────────────────────────

#[test]
fn concurrency_never_exceeds_pool_size() {
    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<SourceEntry> = (0..8)
        .map(|i| entry(&format!("k{i}"), &[&format!("docs/k{i}")]))
        .collect();
    let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
    let h = harness(
        dir.path(),
        ScriptedSource::with_delay(Duration::from_millis(40)),
        entries,
        FallbackProvider::new(),
        LoaderConfig {
            max_concurrency: 2,
            ..LoaderConfig::default()
        },
    );

    let result = h.loader.load(&keys, &LoadOptions::default());
    assert_eq!(result.counts().extracted, 8);
    let peak = h.source.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency was {peak}");
    assert!(peak >= 1);
}
