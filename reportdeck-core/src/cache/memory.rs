//! Memory tier: capacity-bounded LRU with a TTL on every entry.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::Dataset;

/// A cached dataset and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub dataset: Arc<Dataset>,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub size_estimate: usize,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, dataset: Arc<Dataset>, inserted_at: DateTime<Utc>) -> Self {
        let size_estimate = dataset.size_estimate();
        Self {
            key: key.into(),
            dataset,
            inserted_at,
            last_access: inserted_at,
            size_estimate,
        }
    }

    /// Age strictly greater than `ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.inserted_at > ttl
    }
}

/// Outcome of a memory-tier lookup.
#[derive(Debug)]
pub enum MemoryLookup {
    Hit(Arc<Dataset>),
    /// Present but past its TTL; the entry has been dropped.
    Expired,
    Miss,
}

/// Why an entry left the memory tier during an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    Expired(String),
    LeastRecentlyUsed(String),
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

/// LRU order is tracked with a monotonically increasing access tick:
/// `recency` maps tick -> key, so the first element is always the least
/// recently used entry.
pub struct MemoryTier {
    slots: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    capacity: usize,
    ttl: TimeDelta,
}

impl MemoryTier {
    pub fn new(capacity: usize, ttl: TimeDelta) -> Self {
        Self {
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            capacity,
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up `key`. The TTL check runs before any recency update, so an
    /// expired entry never refreshes its position.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> MemoryLookup {
        let expired = match self.slots.get(key) {
            None => return MemoryLookup::Miss,
            Some(slot) => slot.entry.is_expired(now, self.ttl),
        };
        if expired {
            self.remove(key);
            return MemoryLookup::Expired;
        }

        let tick = self.bump();
        let Some(slot) = self.slots.get_mut(key) else {
            return MemoryLookup::Miss;
        };
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        slot.entry.last_access = now;
        self.recency.insert(tick, key.to_string());
        MemoryLookup::Hit(Arc::clone(&slot.entry.dataset))
    }

    /// Entry for `key` without touching recency or expiry.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|s| &s.entry)
    }

    /// Insert or fully replace an entry, then evict down to capacity.
    ///
    /// Expired entries are dropped first; after that the least recently used
    /// entries go. The entry just inserted is never evicted.
    pub fn insert(&mut self, entry: CacheEntry, now: DateTime<Utc>) -> Vec<Eviction> {
        if self.capacity == 0 {
            return vec![Eviction::LeastRecentlyUsed(entry.key)];
        }

        let key = entry.key.clone();
        self.remove(&key);
        let tick = self.bump();
        self.recency.insert(tick, key.clone());
        self.slots.insert(key.clone(), Slot { entry, tick });

        let mut evicted = Vec::new();
        if self.slots.len() > self.capacity {
            let ttl = self.ttl;
            let stale: Vec<String> = self
                .slots
                .iter()
                .filter(|(k, s)| **k != key && s.entry.is_expired(now, ttl))
                .map(|(k, _)| k.clone())
                .collect();
            for k in stale {
                if self.slots.len() <= self.capacity {
                    break;
                }
                self.remove(&k);
                evicted.push(Eviction::Expired(k));
            }
        }
        while self.slots.len() > self.capacity {
            let Some(lru) = self.recency.values().find(|k| **k != key).cloned() else {
                break;
            };
            self.remove(&lru);
            evicted.push(Eviction::LeastRecentlyUsed(lru));
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.entry)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.recency.clear();
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.recency.values().cloned().collect()
    }

    pub fn total_size_estimate(&self) -> usize {
        self.slots.values().map(|s| s.entry.size_estimate).sum()
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}
