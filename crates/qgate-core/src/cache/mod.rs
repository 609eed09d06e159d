//! Content-addressed result cache for check executions.
//!
//! Entries are keyed by [`CacheKey`] (check identity plus input file
//! fingerprints). The key digest covers the fingerprints, so a hit only
//! requires the entry to be present and unexpired. Recency is tracked by
//! [`lru::LruCache`]. The cache is an explicit object shared via `Arc`;
//! there is no process-wide instance.
//!
//! Concurrent dispatches of the same key are serialized through
//! [`ResultCache::lock_key`], so two simultaneous misses never both run
//! the check.

pub mod key;
pub mod persist;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::execution::{CheckExecution, Classification};
use crate::fileset::FingerprintMode;

pub use key::CacheKey;
pub use persist::LoadReport;

/// TTLs are capped at roughly a century.
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Errors from cache persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file is corrupt: {0}")]
    Corruption(String),

    #[error("unsupported cache format version {found} (expected {expected})")]
    FormatVersion { found: u32, expected: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum live entries before LRU eviction.
    pub max_entries: usize,
    /// Time-to-live for new entries, in seconds.
    pub ttl_secs: u64,
    pub fingerprint_mode: FingerprintMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            ttl_secs: 24 * 60 * 60,
            fingerprint_mode: FingerprintMode::Content,
        }
    }
}

/// A cached check outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `passed` or `failed`.
    pub outcome: Classification,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    /// Build an entry from a finished execution; `None` for outcomes that
    /// must not be cached.
    pub fn from_execution(exec: &CheckExecution, ttl_secs: u64) -> Option<Self> {
        if !exec.is_deterministic() {
            return None;
        }
        Some(Self {
            outcome: exec.classification,
            exit_code: exec.exit_code,
            stdout: exec.stdout.clone(),
            stderr: exec.stderr.clone(),
            duration_ms: exec.duration_ms,
            recorded_at: exec.finished_at,
            ttl_secs,
        })
    }

    /// `None` when the expiry falls outside the representable time range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_secs.min(MAX_TTL_SECS) as i64;
        self.recorded_at
            .checked_add_signed(ChronoDuration::seconds(ttl))
    }

    /// An entry whose expiry cannot be computed counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Turn this entry into a `cache_hit` execution record.
    pub fn to_execution(&self, template: &CheckExecution) -> CheckExecution {
        CheckExecution {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            classification: Classification::CacheHit,
            cached_outcome: Some(self.outcome),
            attempts: 0,
            ..template.clone()
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

struct Slot {
    key: CacheKey,
    entry: CacheEntry,
}

struct CacheState {
    slots: LruCache<String, Slot>,
}

impl CacheState {
    fn with_capacity(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: LruCache::new(capacity),
        }
    }

    /// Insert as most recently used. Returns how many entries were evicted.
    fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> usize {
        let digest = key.digest().to_string();
        let mut evicted = 0;
        if !self.slots.contains(&digest) {
            while self.slots.len() >= self.slots.cap().get() {
                match self.slots.pop_lru() {
                    Some((victim, _)) => {
                        debug!(digest = %victim, "evicted least recently used cache entry");
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }
        self.slots.put(digest, Slot { key, entry });
        evicted
    }

    /// Remove every slot matching `doomed`; returns the count.
    fn remove_where<F>(&mut self, doomed: F) -> usize
    where
        F: Fn(&Slot) -> bool,
    {
        let victims: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| doomed(slot))
            .map(|(digest, _)| digest.clone())
            .collect();
        for digest in &victims {
            self.slots.pop(digest);
        }
        victims.len()
    }
}

type KeyLocks = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-memory LRU result cache with TTL and fingerprint validation.
pub struct ResultCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    key_locks: KeyLocks,
    counters: Counters,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::with_capacity(config.max_entries)),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the entry for `key` if present and unexpired, marking it most
    /// recently used. Expired entries are dropped.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut state = self.state();

        let verdict = match state.slots.get(key.digest()) {
            None => Err("absent"),
            Some(slot) if slot.entry.is_expired_at(now) => Err("expired"),
            Some(slot) => Ok(slot.entry.clone()),
        };

        match verdict {
            Ok(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(check = key.check_name(), "cache hit");
                Some(entry)
            }
            Err(reason) => {
                if reason == "expired" {
                    state.slots.pop(key.digest());
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                trace!(check = key.check_name(), reason, "cache miss");
                None
            }
        }
    }

    /// Insert or overwrite an entry. Non-deterministic outcomes are refused.
    /// Returns whether the entry was stored.
    pub fn store(&self, key: CacheKey, entry: CacheEntry) -> bool {
        if !entry.outcome.is_deterministic() {
            return false;
        }
        let evicted = self.state().insert(key, entry);
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        true
    }

    /// Store the outcome of `exec` with the configured TTL.
    pub fn store_execution(&self, key: CacheKey, exec: &CheckExecution) -> bool {
        match CacheEntry::from_execution(exec, self.config.ttl_secs) {
            Some(entry) => self.store(key, entry),
            None => false,
        }
    }

    /// Remove entries whose key references any path matching `predicate`.
    pub fn invalidate<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Path) -> bool,
    {
        self.remove_where(|key| key.paths().any(&predicate))
    }

    /// Remove entries referencing any of `paths` (relative to the file set root).
    pub fn invalidate_paths(&self, paths: &[PathBuf]) -> usize {
        self.invalidate(|p| paths.iter().any(|changed| changed == p))
    }

    /// Remove entries produced by the named checks.
    pub fn invalidate_checks(&self, names: &[String]) -> usize {
        self.remove_where(|key| names.iter().any(|n| n == key.check_name()))
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        self.state()
            .remove_where(|slot| slot.entry.is_expired_at(now))
    }

    fn remove_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let removed = self.state().remove_where(|slot| matches(&slot.key));
        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "invalidated cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Acquire the per-key critical section for a lookup-then-store sequence.
    pub async fn lock_key(&self, key: &CacheKey) -> KeyGuard {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                locks
                    .entry(key.digest().to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            digest: key.digest().to_string(),
            locks: Arc::clone(&self.key_locks),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock (held or awaited).
    pub fn active_key_locks(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Live (key, entry) pairs, least recently used first, for persistence.
    fn snapshot(&self) -> Vec<(CacheKey, CacheEntry)> {
        let now = Utc::now();
        let state = self.state();
        state
            .slots
            .iter()
            .rev()
            .filter(|(_, slot)| !slot.entry.is_expired_at(now))
            .map(|(_, slot)| (slot.key.clone(), slot.entry.clone()))
            .collect()
    }
}

/// Holds the per-key lock; prunes the lock table on drop when unused.
pub struct KeyGuard {
    digest: String,
    locks: KeyLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(&self.digest) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.digest);
            }
        }
    }
}
