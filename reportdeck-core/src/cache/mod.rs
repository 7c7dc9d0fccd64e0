//! Two-tier dataset cache: an LRU+TTL memory tier in front of a byte-budgeted
//! disk tier.
//!
//! Reads go memory first, then disk; a fresh disk hit is promoted into memory.
//! Writes land in memory synchronously and are written through to disk by a
//! background writer thread, so callers never wait on disk I/O. Disk failures
//! are logged and counted, never returned from `put`.
//!
//! Lock order is disk, then memory. The memory lock is never held across I/O.

pub mod disk;
pub mod memory;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::domain::Dataset;

pub use disk::{DiskRecord, DiskTier};
pub use memory::{CacheEntry, Eviction, MemoryLookup, MemoryTier};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("disk cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize cache record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record for '{key}' is {bytes} bytes, larger than the whole {budget}-byte disk budget")]
    TooLarge { key: String, bytes: u64, budget: u64 },

    #[error("disk writer has shut down")]
    WriterStopped,
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Memory,
    Disk,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub dataset: Arc<Dataset>,
    pub tier: CacheTier,
}

/// Running counters, updated without locking.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    memory_evictions: AtomicU64,
    disk_evictions: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub memory_evictions: u64,
    pub disk_evictions: u64,
    pub write_failures: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            memory_hits: read(&self.memory_hits),
            disk_hits: read(&self.disk_hits),
            misses: read(&self.misses),
            expirations: read(&self.expirations),
            memory_evictions: read(&self.memory_evictions),
            disk_evictions: read(&self.disk_evictions),
            write_failures: read(&self.write_failures),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Sizes and counters, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub memory_ttl_secs: i64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_max_bytes: u64,
    pub disk_dir: String,
    pub stats: CacheStatsSnapshot,
}

enum DiskOp {
    Write { seq: u64, record: DiskRecord },
    Flush(mpsc::Sender<()>),
}

/// Disk tier plus the bookkeeping that orders write-throughs against
/// invalidations. Sequence numbers are issued by `put`; a write is applied
/// only if it is newer than both the last applied write and the last
/// invalidation of its key.
struct DiskState {
    tier: DiskTier,
    applied: HashMap<String, u64>,
    tombstones: HashMap<String, u64>,
}

impl DiskState {
    fn is_superseded(&self, key: &str, seq: u64) -> bool {
        let newer_applied = self.applied.get(key).is_some_and(|&s| s >= seq);
        let invalidated = self.tombstones.get(key).is_some_and(|&s| s >= seq);
        newer_applied || invalidated
    }
}

struct Shared {
    disk: Mutex<DiskState>,
    stats: CacheStats,
}

struct Writer {
    tx: mpsc::Sender<DiskOp>,
    handle: JoinHandle<()>,
}

pub struct TieredCache {
    memory: Mutex<MemoryTier>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
    seq: AtomicU64,
    writer: Mutex<Option<Writer>>,
}

impl TieredCache {
    /// Open the disk tier at `config.disk_dir` and start the write-through
    /// thread.
    pub fn open(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let tier = DiskTier::open(&config.disk_dir, config.disk_max_bytes)?;
        let shared = Arc::new(Shared {
            disk: Mutex::new(DiskState {
                tier,
                applied: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            stats: CacheStats::default(),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("reportdeck-disk-writer".into())
            .spawn(move || run_writer(&worker_shared, rx))?;

        Ok(Self {
            memory: Mutex::new(MemoryTier::new(config.memory_max_entries, config.ttl())),
            shared,
            clock,
            ttl: config.ttl(),
            seq: AtomicU64::new(0),
            writer: Mutex::new(Some(Writer { tx, handle })),
        })
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Look `key` up in memory, then on disk.
    ///
    /// Never returns an entry older than the TTL. A fresh disk hit is promoted
    /// into memory unless a newer value was put there meanwhile.
    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let now = self.clock.now();
        let stats = &self.shared.stats;

        match lock(&self.memory).get(key, now) {
            MemoryLookup::Hit(dataset) => {
                CacheStats::bump(&stats.memory_hits, 1);
                debug!(key, "memory hit");
                return Some(CacheHit {
                    dataset,
                    tier: CacheTier::Memory,
                });
            }
            MemoryLookup::Expired => {
                CacheStats::bump(&stats.expirations, 1);
                debug!(key, "memory entry expired");
            }
            MemoryLookup::Miss => {}
        }

        let mut disk = lock(&self.shared.disk);
        let record = match disk.tier.read(key) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, "disk tier read failed: {e}");
                None
            }
        };
        let Some(record) = record else {
            CacheStats::bump(&stats.misses, 1);
            debug!(key, "cache miss");
            return None;
        };
        if now - record.inserted_at > self.ttl {
            CacheStats::bump(&stats.expirations, 1);
            CacheStats::bump(&stats.misses, 1);
            debug!(key, inserted_at = %record.inserted_at, "disk entry stale, not promoted");
            return None;
        }

        let dataset = Arc::new(record.dataset);
        let mut memory = lock(&self.memory);
        if memory.peek(key).is_none() {
            let evicted = memory.insert(
                CacheEntry::new(key, Arc::clone(&dataset), record.inserted_at),
                now,
            );
            self.record_evictions(&evicted);
            debug!(key, "promoted disk entry to memory");
        }
        CacheStats::bump(&stats.disk_hits, 1);
        Some(CacheHit {
            dataset,
            tier: CacheTier::Disk,
        })
    }

    /// Store `dataset` under its own key, fully replacing any previous value.
    ///
    /// Returns once the memory tier holds the new value; the disk write is
    /// queued.
    pub fn put(&self, dataset: Arc<Dataset>) {
        let now = self.clock.now();
        let key = dataset.key().to_string();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let evicted = lock(&self.memory).insert(
            CacheEntry::new(key.clone(), Arc::clone(&dataset), now),
            now,
        );
        self.record_evictions(&evicted);

        let record = DiskRecord::new(Dataset::clone(&dataset), now);
        let queued = lock(&self.writer)
            .as_ref()
            .is_some_and(|w| w.tx.send(DiskOp::Write { seq, record }).is_ok());
        if !queued {
            CacheStats::bump(&self.shared.stats.write_failures, 1);
            warn!(key, "disk writer unavailable, entry cached in memory only");
        }
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    ///
    /// Any write-through for `key` still queued is discarded.
    pub fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let mut disk = lock(&self.shared.disk);
        disk.tombstones
            .insert(key.to_string(), self.seq.load(Ordering::SeqCst));
        let in_memory = lock(&self.memory).remove(key).is_some();
        let on_disk = disk.tier.remove(key)?;
        debug!(key, in_memory, on_disk, "invalidated");
        Ok(in_memory || on_disk)
    }

    /// Block until every write-through queued before this call is on disk.
    pub fn flush(&self) -> Result<(), CacheError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        let sent = lock(&self.writer)
            .as_ref()
            .is_some_and(|w| w.tx.send(DiskOp::Flush(ack_tx)).is_ok());
        if !sent {
            return Err(CacheError::WriterStopped);
        }
        ack_rx.recv().map_err(|_| CacheError::WriterStopped)
    }

    /// Drain queued writes and stop the writer thread. Later puts are kept in
    /// memory only. Idempotent.
    pub fn shutdown(&self) {
        let Some(writer) = lock(&self.writer).take() else {
            return;
        };
        drop(writer.tx);
        if writer.handle.join().is_err() {
            warn!("disk writer thread panicked");
        }
        debug!("tiered cache shut down");
    }

    pub fn status(&self) -> CacheStatus {
        let (disk_entries, disk_bytes, disk_max_bytes, disk_dir) = {
            let disk = lock(&self.shared.disk);
            (
                disk.tier.len(),
                disk.tier.used_bytes(),
                disk.tier.max_bytes(),
                disk.tier.dir().display().to_string(),
            )
        };
        let memory = lock(&self.memory);
        CacheStatus {
            memory_entries: memory.len(),
            memory_capacity: memory.capacity(),
            memory_ttl_secs: self.ttl.num_seconds(),
            disk_entries,
            disk_bytes,
            disk_max_bytes,
            disk_dir,
            stats: self.stats(),
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Whether the memory tier currently holds `key`, expired or not.
    pub fn in_memory(&self, key: &str) -> bool {
        lock(&self.memory).peek(key).is_some()
    }

    /// Whether the disk tier currently indexes `key`.
    pub fn on_disk(&self, key: &str) -> bool {
        lock(&self.shared.disk).tier.contains(key)
    }

    /// Memory-tier keys from least to most recently used.
    pub fn memory_keys(&self) -> Vec<String> {
        lock(&self.memory).keys_by_recency()
    }

    fn record_evictions(&self, evicted: &[Eviction]) {
        let stats = &self.shared.stats;
        for eviction in evicted {
            match eviction {
                Eviction::Expired(key) => {
                    CacheStats::bump(&stats.expirations, 1);
                    debug!(key = %key, "expired entry dropped from memory");
                }
                Eviction::LeastRecentlyUsed(key) => {
                    CacheStats::bump(&stats.memory_evictions, 1);
                    debug!(key = %key, "evicted from memory tier");
                }
            }
        }
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(shared: &Shared, rx: mpsc::Receiver<DiskOp>) {
    for op in rx {
        match op {
            DiskOp::Write { seq, record } => {
                let mut disk = lock(&shared.disk);
                if disk.is_superseded(&record.key, seq) {
                    debug!(key = %record.key, seq, "skipping superseded write-through");
                    continue;
                }
                let key = record.key.clone();
                match disk.tier.write(&record) {
                    Ok(evicted) => {
                        disk.applied.insert(key.clone(), seq);
                        disk.tombstones.remove(&key);
                        CacheStats::bump(&shared.stats.disk_evictions, evicted.len() as u64);
                    }
                    Err(e) => {
                        CacheStats::bump(&shared.stats.write_failures, 1);
                        warn!(key = %key, "disk write-through failed: {e}");
                    }
                }
            }
            DiskOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Cache state stays consistent across a panicking holder: every mutation is
/// a single map operation.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
