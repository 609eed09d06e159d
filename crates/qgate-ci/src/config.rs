//! Orchestrator configuration and environment overrides.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use qgate_core::{CacheConfig, ResultCache};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::autofix::AutofixCoordinator;
use crate::executor::ConcurrentExecutor;
use crate::pipeline::{PipelineConfig, StagePipeline};
use crate::runner::{CheckRunner, RunnerConfig};

pub const ENV_MAX_PARALLEL: &str = "QGATE_MAX_PARALLEL";
pub const ENV_MAX_ITERATIONS: &str = "QGATE_MAX_ITERATIONS";
pub const ENV_CACHE_TTL_SECS: &str = "QGATE_CACHE_TTL_SECS";
pub const ENV_CACHE_MAX_ENTRIES: &str = "QGATE_CACHE_MAX_ENTRIES";
pub const ENV_STALL_TIMEOUT_SECS: &str = "QGATE_STALL_TIMEOUT_SECS";
pub const ENV_MAX_OUTPUT_BYTES: &str = "QGATE_MAX_OUTPUT_BYTES";

/// Everything needed to assemble a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub pipeline: PipelineConfig,
    pub runner: RunnerConfig,
    pub cache: CacheConfig,
}

impl OrchestratorConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Reads:
    /// - QGATE_MAX_PARALLEL (default: available CPU parallelism)
    /// - QGATE_MAX_ITERATIONS (default: 3)
    /// - QGATE_CACHE_TTL_SECS (default: 86400)
    /// - QGATE_CACHE_MAX_ENTRIES (default: 1024)
    /// - QGATE_STALL_TIMEOUT_SECS (default: 60)
    /// - QGATE_MAX_OUTPUT_BYTES (default: 1048576)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Overlay values from `lookup` (variable name to raw value).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_positive::<usize, _>(&lookup, ENV_MAX_PARALLEL) {
            self.pipeline.max_parallel = n;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, ENV_MAX_ITERATIONS) {
            self.pipeline.max_iterations = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CACHE_TTL_SECS) {
            self.cache.ttl_secs = secs;
        }
        if let Some(n) = parse_positive::<usize, _>(&lookup, ENV_CACHE_MAX_ENTRIES) {
            self.cache.max_entries = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_STALL_TIMEOUT_SECS) {
            self.runner.monitor.stall_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, ENV_MAX_OUTPUT_BYTES) {
            self.runner.max_output_bytes = n;
        }
    }

    /// Wire a runner, executor, and pipeline from this configuration.
    pub fn build_pipeline(
        &self,
        cache: Option<Arc<ResultCache>>,
        autofix: Arc<dyn AutofixCoordinator>,
    ) -> StagePipeline {
        let runner = Arc::new(CheckRunner::new(self.runner.clone()));
        let executor = ConcurrentExecutor::new(runner, cache);
        StagePipeline::new(executor, autofix, self.pipeline.clone())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

fn parse_positive<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_var::<T, F>(lookup, name)?;
    if value > T::default() {
        Some(value)
    } else {
        warn!(var = name, "ignoring non-positive environment override");
        None
    }
}
