//! Bounded-parallel dispatch of checks with result caching.

use std::sync::Arc;
use std::time::Duration;

use qgate_core::{
    CacheKey, CancelToken, CheckDefinition, CheckExecution, Classification, FileSet, ResultCache,
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use crate::runner::CheckRunner;

/// Runs a batch of checks concurrently, at most `max_parallel` at a time.
#[derive(Clone)]
pub struct ConcurrentExecutor {
    runner: Arc<CheckRunner>,
    cache: Option<Arc<ResultCache>>,
}

impl ConcurrentExecutor {
    pub fn new(runner: Arc<CheckRunner>, cache: Option<Arc<ResultCache>>) -> Self {
        Self { runner, cache }
    }

    pub fn runner(&self) -> &Arc<CheckRunner> {
        &self.runner
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    /// Execute every enabled check and return one execution per check, in
    /// request order. `on_complete` sees each execution as it finishes.
    ///
    /// A failing check never cancels its siblings. Checks still waiting for
    /// a slot when `cancel` fires come back `aborted`.
    pub async fn execute<F>(
        &self,
        checks: &[CheckDefinition],
        files: &FileSet,
        max_parallel: usize,
        cancel: &CancelToken,
        on_complete: F,
    ) -> Vec<CheckExecution>
    where
        F: Fn(&CheckExecution),
    {
        let enabled: Vec<CheckDefinition> = checks
            .iter()
            .filter(|c| {
                if !c.enabled {
                    debug!(check = %c.name, "skipping disabled check");
                }
                c.enabled
            })
            .cloned()
            .collect();
        if enabled.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let files = Arc::new(files.clone());
        let (tx, mut rx) = mpsc::channel::<(usize, CheckExecution)>(enabled.len());

        let mut handles = Vec::with_capacity(enabled.len());
        for (idx, check) in enabled.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let cache = self.cache.clone();
            let files = Arc::clone(&files);
            let cancel = cancel.clone();
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let exec =
                    dispatch(&runner, cache.as_deref(), &semaphore, &check, &files, &cancel).await;
                if tx.send((idx, exec)).await.is_err() {
                    debug!(check = %check.name, "result receiver closed");
                }
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<CheckExecution>> = vec![None; enabled.len()];
        while let Some((idx, exec)) = rx.recv().await {
            on_complete(&exec);
            slots[idx] = Some(exec);
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "check task failed");
            }
        }

        slots
            .into_iter()
            .zip(enabled.iter())
            .map(|(slot, check)| {
                slot.unwrap_or_else(|| {
                    let exec = CheckExecution::not_started(
                        &check.name,
                        &check.stage,
                        files.files().to_vec(),
                        check.render_command(files.root(), files.files()),
                        Classification::Error,
                        Some("check task terminated unexpectedly".to_string()),
                    );
                    on_complete(&exec);
                    exec
                })
            })
            .collect()
    }
}

/// Run one check under a pool permit, consulting the cache when allowed.
/// A twin waiting on the key lock, or served from the cache, holds no permit.
async fn dispatch(
    runner: &CheckRunner,
    cache: Option<&ResultCache>,
    pool: &Arc<Semaphore>,
    check: &CheckDefinition,
    files: &FileSet,
    cancel: &CancelToken,
) -> CheckExecution {
    let cache = match cache {
        Some(cache) if check.is_cacheable() => cache,
        _ => return run_pooled(runner, pool, check, files, cancel).await,
    };

    let key = match CacheKey::compute(check, files, cache.config().fingerprint_mode) {
        Ok(key) => key,
        Err(e) => {
            warn!(check = %check.name, error = %e, "cannot compute cache key; running uncached");
            return run_pooled(runner, pool, check, files, cancel).await;
        }
    };

    // Identical keys run one at a time, so a concurrent twin sees the
    // stored result instead of launching a second process.
    let _guard = tokio::select! {
        biased;
        _ = cancel.cancelled() => return aborted(check, files),
        guard = cache.lock_key(&key) => guard,
    };

    if let Some(entry) = cache.lookup(&key) {
        debug!(check = %check.name, outcome = %entry.outcome, "serving cached result");
        let template = CheckExecution::not_started(
            &check.name,
            &check.stage,
            files.files().to_vec(),
            check.render_command(files.root(), files.files()),
            Classification::CacheHit,
            None,
        );
        return entry.to_execution(&template);
    }

    let exec = run_pooled(runner, pool, check, files, cancel).await;
    if cache.store_execution(key, &exec) {
        debug!(check = %check.name, "cached result");
    }
    exec
}

async fn run_pooled(
    runner: &CheckRunner,
    pool: &Arc<Semaphore>,
    check: &CheckDefinition,
    files: &FileSet,
    cancel: &CancelToken,
) -> CheckExecution {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(pool).acquire_owned() => permit.ok(),
    };
    match permit {
        Some(_permit) => {
            let timeout = Duration::from_secs(check.timeout_secs);
            runner.run(check, files, timeout, cancel).await
        }
        None => aborted(check, files),
    }
}

fn aborted(check: &CheckDefinition, files: &FileSet) -> CheckExecution {
    CheckExecution::not_started(
        &check.name,
        &check.stage,
        files.files().to_vec(),
        check.render_command(files.root(), files.files()),
        Classification::Aborted,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerConfig;
    use qgate_core::{CacheConfig, CancelSource};
    use std::sync::Mutex;

    fn executor(cache: Option<Arc<ResultCache>>) -> ConcurrentExecutor {
        ConcurrentExecutor::new(Arc::new(CheckRunner::new(RunnerConfig::default())), cache)
    }

    fn echo(name: &str) -> CheckDefinition {
        CheckDefinition::custom(name, "fast", vec!["echo".into(), name.into()], 30)
    }

    #[tokio::test]
    async fn test_results_in_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileSet::empty(dir.path());
        let checks = vec![
            CheckDefinition::custom("slow", "fast", vec!["sh".into(), "-c".into(), "sleep 0.3".into()], 30),
            echo("quick"),
            CheckDefinition::custom("bad", "fast", vec!["false".into()], 30),
        ];

        let seen = Mutex::new(Vec::new());
        let results = executor(None)
            .execute(&checks, &files, 3, &CancelToken::never(), |exec| {
                seen.lock().unwrap().push(exec.check_name.clone())
            })
            .await;

        let names: Vec<&str> = results.iter().map(|e| e.check_name.as_str()).collect();
        assert_eq!(names, vec!["slow", "quick", "bad"]);
        assert_eq!(results[0].classification, Classification::Passed);
        assert_eq!(results[2].classification, Classification::Failed);
        assert_eq!(seen.lock().unwrap().len(), 3);
        // The slow one finishes last.
        assert_eq!(seen.lock().unwrap().last().unwrap(), "slow");
    }

    #[tokio::test]
    async fn test_disabled_checks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileSet::empty(dir.path());
        let checks = vec![echo("on"), echo("off").disabled()];

        let results = executor(None)
            .execute(&checks, &files, 2, &CancelToken::never(), |_| {})
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].check_name, "on");
    }

    #[tokio::test]
    async fn test_second_run_is_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "pub fn x() {}").unwrap();
        let files = FileSet::new(dir.path(), vec!["lib.rs".into()]);
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let exec = executor(Some(Arc::clone(&cache)));
        let checks = vec![CheckDefinition::custom("bad", "fast", vec!["false".into()], 30)];

        let first = exec
            .execute(&checks, &files, 1, &CancelToken::never(), |_| {})
            .await;
        assert_eq!(first[0].classification, Classification::Failed);

        let second = exec
            .execute(&checks, &files, 1, &CancelToken::never(), |_| {})
            .await;
        assert_eq!(second[0].classification, Classification::CacheHit);
        assert_eq!(second[0].cached_outcome, Some(Classification::Failed));
        assert!(!second[0].passed());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileSet::empty(dir.path());
        let source = CancelSource::new();
        source.cancel();

        let results = executor(None)
            .execute(&[echo("a"), echo("b")], &files, 1, &source.token(), |_| {})
            .await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|e| e.classification == Classification::Aborted));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let results = executor(None)
            .execute(&[], &FileSet::empty(dir.path()), 4, &CancelToken::never(), |_| {})
            .await;
        assert!(results.is_empty());
    }
}
