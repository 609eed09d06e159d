//! Durable cache storage across workflow invocations.
//!
//! Layout: a single JSON document written atomically (temp file in the same
//! directory, then rename). Loaded entries are never trusted blindly: each
//! one is re-validated against its own digest and against the files on disk.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{CacheConfig, CacheEntry, CacheError, CacheKey, ResultCache};
use crate::fileset::fingerprint_paths;

/// Version of the on-disk format.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    format_version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: CacheKey,
    entry: CacheEntry,
}

/// What happened to the entries of a cache file during [`ResultCache::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub restored: usize,
    pub expired: usize,
    /// Fingerprints no longer match the files on disk.
    pub stale: usize,
    /// Key digest does not derive from the key's own fields.
    pub inconsistent: usize,
    /// The file could not be read or parsed; nothing was restored.
    pub corrupt: bool,
}

impl ResultCache {
    /// Write all live entries to `path`. Returns the number written.
    pub fn save(&self, path: &Path) -> Result<usize, CacheError> {
        let entries: Vec<PersistedEntry> = self
            .snapshot()
            .into_iter()
            .map(|(key, entry)| PersistedEntry { key, entry })
            .collect();
        let count = entries.len();
        let doc = PersistedCache {
            format_version: CACHE_FORMAT_VERSION,
            saved_at: Utc::now(),
            entries,
        };

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(&doc)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), entries = count, "saved result cache");
        Ok(count)
    }

    /// Load a cache from `path`, re-validating entries against files under
    /// `root`. A missing file yields an empty cache; a corrupt one yields an
    /// empty cache with `corrupt` set. Never fails.
    pub fn load(path: &Path, root: &Path, config: CacheConfig) -> (Self, LoadReport) {
        let cache = ResultCache::new(config);
        let mut report = LoadReport::default();

        let doc = match read_persisted(path) {
            Ok(Some(doc)) => doc,
            Ok(None) => return (cache, report),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt result cache");
                report.corrupt = true;
                return (cache, report);
            }
        };

        let now = Utc::now();
        let mode = cache.config.fingerprint_mode;
        let mut evicted = 0;
        {
            let mut state = cache.state();
            for PersistedEntry { key, entry } in doc.entries {
                if entry.is_expired_at(now) {
                    report.expired += 1;
                    continue;
                }
                if !key.is_consistent() || !entry.outcome.is_deterministic() {
                    report.inconsistent += 1;
                    continue;
                }
                let current = match fingerprint_paths(root, &key.path_list(), mode) {
                    Ok(fps) => fps,
                    Err(e) => {
                        debug!(check = key.check_name(), error = %e, "cannot re-fingerprint cached entry");
                        report.stale += 1;
                        continue;
                    }
                };
                if current.as_slice() != key.fingerprints() {
                    report.stale += 1;
                    continue;
                }

                // Saved least recently used first, so replay keeps recency order.
                evicted += state.insert(key, entry);
                report.restored += 1;
            }
        }
        report.restored -= evicted;

        info!(
            path = %path.display(),
            restored = report.restored,
            expired = report.expired,
            stale = report.stale,
            inconsistent = report.inconsistent,
            "loaded result cache"
        );
        (cache, report)
    }
}

fn read_persisted(path: &Path) -> Result<Option<PersistedCache>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let doc: PersistedCache =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corruption(e.to_string()))?;
    if doc.format_version != CACHE_FORMAT_VERSION {
        return Err(CacheError::FormatVersion {
            found: doc.format_version,
            expected: CACHE_FORMAT_VERSION,
        });
    }
    Ok(Some(doc))
}
