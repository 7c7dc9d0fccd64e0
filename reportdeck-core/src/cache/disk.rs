//! Disk tier: one self-describing JSON record per dataset key.
//!
//! Layout: `{dir}/{blake3(key)}.json`
//!
//! - Atomic writes (write to .tmp, rename into place)
//! - Content hash checked on every read
//! - Corrupt records renamed to `{file}.quarantined` and treated as absent
//! - Total size bounded by a byte budget, oldest insertion evicted first
//! - Index rebuilt from the directory on open

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::CacheError;
use crate::domain::Dataset;

const RECORD_EXT: &str = "json";

/// What is persisted for each key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: String,
    pub inserted_at: DateTime<Utc>,
    pub content_hash: String,
    pub dataset: Dataset,
}

impl DiskRecord {
    pub fn new(dataset: Dataset, inserted_at: DateTime<Utc>) -> Self {
        Self {
            key: dataset.key().to_string(),
            inserted_at,
            content_hash: dataset.content_hash(),
            dataset,
        }
    }

    fn verify(&self) -> Result<(), String> {
        if self.key != self.dataset.key() {
            return Err(format!(
                "record key '{}' does not match dataset key '{}'",
                self.key,
                self.dataset.key()
            ));
        }
        let actual = self.dataset.content_hash();
        if actual != self.content_hash {
            return Err(format!(
                "content hash mismatch: stored {}, computed {actual}",
                self.content_hash
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    inserted_at: DateTime<Utc>,
    bytes: u64,
}

/// Byte-budgeted, content-addressed record store.
///
/// Not synchronized; the owning cache serializes access.
pub struct DiskTier {
    dir: PathBuf,
    max_bytes: u64,
    index: HashMap<String, IndexEntry>,
    /// (inserted_at, key): iteration order is eviction order.
    by_age: BTreeSet<(DateTime<Utc>, String)>,
    used_bytes: u64,
}

impl DiskTier {
    /// Open (creating if needed) the tier rooted at `dir`.
    ///
    /// Every record in the directory is read back and verified; anything that
    /// fails is quarantined. The budget is enforced before returning.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut tier = Self {
            dir,
            max_bytes,
            index: HashMap::new(),
            by_age: BTreeSet::new(),
            used_bytes: 0,
        };
        tier.rebuild_index()?;
        let evicted = tier.enforce_budget(None)?;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "disk tier over budget on open");
        }
        Ok(tier)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn inserted_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.index.get(key).map(|e| e.inserted_at)
    }

    /// Keys from oldest to newest insertion.
    pub fn keys_by_age(&self) -> Vec<String> {
        self.by_age.iter().map(|(_, k)| k.clone()).collect()
    }

    /// Path of the record for `key`.
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", blake3::hash(key.as_bytes()).to_hex()))
    }

    /// Read and verify the record for `key`.
    ///
    /// A record that cannot be read back intact is quarantined and reported as
    /// absent.
    pub fn read(&mut self, key: &str) -> Result<Option<DiskRecord>, CacheError> {
        if !self.index.contains_key(key) {
            return Ok(None);
        }
        let path = self.record_path(key);
        match load_record(&path) {
            Ok(record) if record.key == key => Ok(Some(record)),
            Ok(record) => {
                self.quarantine(
                    key,
                    &path,
                    &format!("file holds key '{}' instead", record.key),
                );
                Ok(None)
            }
            Err(LoadFailure::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.forget(key);
                Ok(None)
            }
            Err(LoadFailure::Io(e)) => Err(e.into()),
            Err(LoadFailure::Corrupt(reason)) => {
                self.quarantine(key, &path, &reason);
                Ok(None)
            }
        }
    }

    /// Persist `record`, replacing any previous record for its key, then evict
    /// the oldest other records until the budget holds again.
    ///
    /// Returns the evicted keys.
    pub fn write(&mut self, record: &DiskRecord) -> Result<Vec<String>, CacheError> {
        let bytes = serde_json::to_vec(record)?;
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(CacheError::TooLarge {
                key: record.key.clone(),
                bytes: size,
                budget: self.max_bytes,
            });
        }

        let path = self.record_path(&record.key);
        let tmp_path = path.with_extension(format!("{RECORD_EXT}.tmp"));
        fs::write(&tmp_path, &bytes)?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.forget(&record.key);
        self.track(record.key.clone(), record.inserted_at, size);
        self.enforce_budget(Some(&record.key))
    }

    /// Delete the record for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
        let known = self.forget(key);
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(known),
            Err(e) => Err(e.into()),
        }
    }

    fn track(&mut self, key: String, inserted_at: DateTime<Utc>, bytes: u64) {
        self.used_bytes += bytes;
        self.by_age.insert((inserted_at, key.clone()));
        self.index.insert(key, IndexEntry { inserted_at, bytes });
    }

    fn forget(&mut self, key: &str) -> bool {
        let Some(entry) = self.index.remove(key) else {
            return false;
        };
        self.used_bytes = self.used_bytes.saturating_sub(entry.bytes);
        self.by_age.remove(&(entry.inserted_at, key.to_string()));
        true
    }

    fn enforce_budget(&mut self, keep: Option<&str>) -> Result<Vec<String>, CacheError> {
        let mut evicted = Vec::new();
        while self.used_bytes > self.max_bytes {
            let victim = self
                .by_age
                .iter()
                .map(|(_, k)| k)
                .find(|k| Some(k.as_str()) != keep)
                .cloned();
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim)?;
            debug!(key = %victim, used = self.used_bytes, "evicted from disk tier");
            evicted.push(victim);
        }
        Ok(evicted)
    }

    fn quarantine(&mut self, key: &str, path: &Path, reason: &str) {
        self.forget(key);
        quarantine_file(path, reason);
    }

    fn rebuild_index(&mut self) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            // Interrupted writes leave a .tmp behind; the rename never happened.
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }

            let size = fs::metadata(&path)?.len();
            match load_record(&path) {
                Ok(record) if self.record_path(&record.key) == path => {
                    if self.index.contains_key(&record.key) {
                        quarantine_file(&path, "duplicate record for key");
                        continue;
                    }
                    self.track(record.key, record.inserted_at, size);
                }
                Ok(record) => quarantine_file(
                    &path,
                    &format!("file name does not address key '{}'", record.key),
                ),
                Err(LoadFailure::Corrupt(reason)) => quarantine_file(&path, &reason),
                Err(LoadFailure::Io(e)) => return Err(e.into()),
            }
        }
        debug!(
            dir = %self.dir.display(),
            entries = self.index.len(),
            bytes = self.used_bytes,
            "disk tier index rebuilt"
        );
        Ok(())
    }
}

enum LoadFailure {
    Io(std::io::Error),
    Corrupt(String),
}

fn load_record(path: &Path) -> Result<DiskRecord, LoadFailure> {
    let bytes = fs::read(path).map_err(LoadFailure::Io)?;
    let record: DiskRecord =
        serde_json::from_slice(&bytes).map_err(|e| LoadFailure::Corrupt(e.to_string()))?;
    record.verify().map_err(LoadFailure::Corrupt)?;
    Ok(record)
}

fn quarantine_file(path: &Path, reason: &str) {
    let quarantined = path.with_extension(format!("{RECORD_EXT}.quarantined"));
    warn!(
        path = %path.display(),
        reason,
        "quarantining corrupt disk cache record"
    );
    if let Err(e) = fs::rename(path, &quarantined) {
        warn!(path = %path.display(), "quarantine rename failed: {e}");
        let _ = fs::remove_file(path);
    }
}
