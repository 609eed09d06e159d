//! Result cache behaviour against real files on disk.

use qgate_core::fileset::CARGO_INPUT_EXTENSIONS;
use qgate_core::{
    BuiltinCheck, CacheConfig, CacheKey, CheckDefinition, CheckExecution, Classification,
    FileSet, FingerprintMode, ResultCache,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn workspace(files: &[(&str, &str)]) -> (tempfile::TempDir, FileSet) {
    let dir = tempfile::tempdir().unwrap();
    for (path, body) in files {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, body).unwrap();
    }
    let set = FileSet::discover(dir.path(), &["rs"]).unwrap();
    (dir, set)
}

fn lint() -> CheckDefinition {
    CheckDefinition::custom("lint", "fast", vec!["lint".into(), "{files}".into()], 60)
}

fn finished(check: &CheckDefinition, files: &FileSet, outcome: Classification) -> CheckExecution {
    let mut exec = CheckExecution::not_started(
        &check.name,
        &check.stage,
        files.files().to_vec(),
        check.render_command(files.root(), files.files()),
        outcome,
        None,
    );
    exec.exit_code = Some(if outcome == Classification::Passed { 0 } else { 1 });
    exec.attempts = 1;
    exec
}

fn key(check: &CheckDefinition, files: &FileSet) -> CacheKey {
    CacheKey::compute(check, files, FingerprintMode::Content).unwrap()
}

#[test]
fn test_key_follows_file_content_not_mtime() {
    let (dir, files) = workspace(&[("src/lib.rs", "pub fn a() {}")]);
    let before = key(&lint(), &files);

    // Same bytes rewritten: same key.
    fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
    assert_eq!(key(&lint(), &files), before);

    fs::write(dir.path().join("src/lib.rs"), "pub fn b() {}").unwrap();
    assert_ne!(key(&lint(), &files), before);
}

#[test]
fn test_deleted_file_changes_key() {
    let (dir, files) = workspace(&[("a.rs", "1"), ("b.rs", "2")]);
    let before = key(&lint(), &files);
    fs::remove_file(dir.path().join("b.rs")).unwrap();
    assert_ne!(key(&lint(), &files), before);
}

#[test]
fn test_stored_execution_replays_as_cache_hit() {
    let (_dir, files) = workspace(&[("main.rs", "fn main() {}")]);
    let cache = ResultCache::new(CacheConfig::default());
    let check = lint();
    let mut exec = finished(&check, &files, Classification::Failed);
    exec.stdout = "warning: unused".into();

    assert!(cache.store_execution(key(&check, &files), &exec));
    let entry = cache.lookup(&key(&check, &files)).unwrap();
    let replay = entry.to_execution(&exec);

    assert_eq!(replay.classification, Classification::CacheHit);
    assert_eq!(replay.cached_outcome, Some(Classification::Failed));
    assert_eq!(replay.outcome(), Classification::Failed);
    assert_eq!(replay.stdout, "warning: unused");
    assert_eq!(replay.attempts, 0);
}

#[test]
fn test_non_deterministic_outcomes_are_never_stored() {
    let (_dir, files) = workspace(&[("main.rs", "fn main() {}")]);
    let cache = ResultCache::new(CacheConfig::default());
    let check = lint();
    for outcome in [
        Classification::Error,
        Classification::TimedOut,
        Classification::Aborted,
        Classification::CacheHit,
    ] {
        assert!(!cache.store_execution(key(&check, &files), &finished(&check, &files, outcome)));
    }
    assert!(cache.is_empty());
}

#[test]
fn test_path_invalidation_spares_unrelated_entries() {
    let (_dir, all) = workspace(&[("a.rs", "1"), ("b.rs", "2")]);
    let only_a = FileSet::new(all.root(), vec![PathBuf::from("a.rs")]);
    let only_b = FileSet::new(all.root(), vec![PathBuf::from("b.rs")]);
    let cache = ResultCache::new(CacheConfig::default());
    let check = lint();

    for files in [&only_a, &only_b, &all] {
        cache.store_execution(key(&check, files), &finished(&check, files, Classification::Passed));
    }
    assert_eq!(cache.len(), 3);

    assert_eq!(cache.invalidate_paths(&[PathBuf::from("a.rs")]), 2);
    assert!(cache.lookup(&key(&check, &only_b)).is_some());
    assert!(cache.lookup(&key(&check, &only_a)).is_none());
    assert_eq!(cache.stats().invalidations, 2);
}

#[test]
fn test_concurrent_access_from_threads() {
    let (_dir, files) = workspace(&[("main.rs", "fn main() {}")]);
    let cache = Arc::new(ResultCache::new(CacheConfig {
        max_entries: 16,
        ..CacheConfig::default()
    }));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let files = files.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let check = CheckDefinition::custom(
                        format!("check-{t}-{}", i % 4),
                        "fast",
                        vec!["true".into()],
                        60,
                    );
                    let k = key(&check, &files);
                    cache.store_execution(k.clone(), &finished(&check, &files, Classification::Passed));
                    let _ = cache.lookup(&k);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.entries <= 16);
    assert_eq!(stats.stores, 400);
    assert_eq!(stats.hits + stats.misses, 400);
}

#[tokio::test]
async fn test_key_lock_serializes_twins() {
    let (_dir, files) = workspace(&[("main.rs", "fn main() {}")]);
    let cache = Arc::new(ResultCache::new(CacheConfig::default()));
    let check = lint();
    let k = key(&check, &files);

    let guard = cache.lock_key(&k).await;
    let waiter = {
        let cache = Arc::clone(&cache);
        let k = k.clone();
        tokio::spawn(async move {
            let _guard = cache.lock_key(&k).await;
            cache.lookup(&k).map(|e| e.outcome)
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    cache.store_execution(k.clone(), &finished(&check, &files, Classification::Passed));
    drop(guard);

    assert_eq!(waiter.await.unwrap(), Some(Classification::Passed));
    assert_eq!(cache.active_key_locks(), 0);
}

#[test]
fn test_persisted_cache_drops_entries_for_edited_files() {
    let (dir, files) = workspace(&[("a.rs", "1"), ("b.rs", "2")]);
    let path = dir.path().join("cache.json");
    let cache = ResultCache::new(CacheConfig::default());
    let check = lint();
    let a = FileSet::new(files.root(), vec![PathBuf::from("a.rs")]);
    let b = FileSet::new(files.root(), vec![PathBuf::from("b.rs")]);
    cache.store_execution(key(&check, &a), &finished(&check, &a, Classification::Passed));
    cache.store_execution(key(&check, &b), &finished(&check, &b, Classification::Failed));
    assert_eq!(cache.save(&path).unwrap(), 2);

    fs::write(dir.path().join("a.rs"), "edited").unwrap();
    let (reloaded, report) = ResultCache::load(&path, dir.path(), CacheConfig::default());

    assert_eq!(report.restored, 1);
    assert_eq!(report.stale, 1);
    assert!(!report.corrupt);
    assert!(reloaded.lookup(&key(&check, &b)).is_some());
}

#[test]
fn test_load_from_unwritable_location_is_empty() {
    let (reloaded, report) = ResultCache::load(
        Path::new("/nonexistent/qgate/cache.json"),
        Path::new("/nonexistent"),
        CacheConfig::default(),
    );
    assert!(reloaded.is_empty());
    assert_eq!(report.restored, 0);
}

#[test]
fn test_out_of_range_timestamp_in_cache_file_is_discarded() {
    let (dir, files) = workspace(&[("a.rs", "1")]);
    let path = dir.path().join("cache.json");
    let cache = ResultCache::new(CacheConfig::default());
    let check = lint();
    cache.store_execution(key(&check, &files), &finished(&check, &files, Classification::Passed));
    assert_eq!(cache.save(&path).unwrap(), 1);

    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    doc["entries"][0]["entry"]["recorded_at"] = serde_json::json!("+262142-12-31T00:00:00Z");
    fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let (reloaded, report) = ResultCache::load(&path, dir.path(), CacheConfig::default());
    assert!(reloaded.is_empty());
    assert_eq!(report.restored, 0);
    assert_eq!(report.expired, 1);
    assert!(!report.corrupt);
}

#[test]
fn test_lockfile_change_misses_for_builtin_checks() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"").unwrap();
    fs::write(dir.path().join("Cargo.lock"), "version = 3").unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

    let files = FileSet::discover(dir.path(), CARGO_INPUT_EXTENSIONS).unwrap();
    assert!(files.files().contains(&PathBuf::from("Cargo.lock")));

    let cache = ResultCache::new(CacheConfig::default());
    let check = CheckDefinition::from_builtin(BuiltinCheck::CargoCheck);
    cache.store_execution(key(&check, &files), &finished(&check, &files, Classification::Passed));
    assert!(cache.lookup(&key(&check, &files)).is_some());

    fs::write(dir.path().join("Cargo.lock"), "version = 3\n[[package]]\nname = \"serde\"").unwrap();
    let rediscovered = FileSet::discover(dir.path(), CARGO_INPUT_EXTENSIONS).unwrap();
    assert!(cache.lookup(&key(&check, &rediscovered)).is_none());
}

#[test]
fn test_audit_results_are_not_cacheable() {
    let audit = CheckDefinition::from_builtin(BuiltinCheck::CargoAudit);
    assert!(!audit.is_cacheable());
}
