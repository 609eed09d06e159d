//! Subscriber setup for the `qgate` binary.
//!
//! qgate's own crates log at the configured level while dependencies stay at
//! `warn`; `RUST_LOG` replaces those directives wholesale. Logs always go to
//! stderr because stdout carries live events and reports.
//!
//! With span timings on, every closing `qgate.workflow` and `qgate.stage`
//! span logs its `run_id`, stage and busy time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "QGATE_LOG_FORMAT";
pub const ENV_LOG_LEVEL: &str = "QGATE_LOG_LEVEL";
pub const ENV_LOG_SPANS: &str = "QGATE_LOG_SPANS";

/// Targets that follow the configured level.
const QGATE_TARGETS: &[&str] = &["qgate", "qgate_core", "qgate_ci"];

/// Line format of the log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Compact,
    /// Newline-delimited JSON with the current span's fields attached.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log format {0:?} (expected text, compact or json)")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "full" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        })
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Level for qgate targets when `RUST_LOG` is unset.
    pub level: String,
    /// Log a line with timings whenever a workflow or stage span closes.
    pub span_timings: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "warn".to_string(),
            span_timings: false,
        }
    }
}

impl TelemetryConfig {
    /// Defaults overlaid with `QGATE_LOG_FORMAT`, `QGATE_LOG_LEVEL` and
    /// `QGATE_LOG_SPANS`. Also returns the variables that were rejected;
    /// no subscriber exists yet to report them.
    pub fn from_env() -> (Self, Vec<&'static str>) {
        let mut config = Self::default();
        let rejected = config.apply_overrides(|name| std::env::var(name).ok());
        (config, rejected)
    }

    /// Overlay values from `lookup`; returns the names of unparseable variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut rejected = Vec::new();
        if let Some(raw) = lookup(ENV_LOG_FORMAT) {
            match raw.parse() {
                Ok(format) => self.format = format,
                Err(_) => rejected.push(ENV_LOG_FORMAT),
            }
        }
        if let Some(raw) = lookup(ENV_LOG_LEVEL) {
            match raw.trim().parse::<Level>() {
                Ok(level) => self.level = level.as_str().to_ascii_lowercase(),
                Err(_) => rejected.push(ENV_LOG_LEVEL),
            }
        }
        if let Some(raw) = lookup(ENV_LOG_SPANS) {
            match raw.trim() {
                "1" | "true" | "yes" => self.span_timings = true,
                "0" | "false" | "no" => self.span_timings = false,
                _ => rejected.push(ENV_LOG_SPANS),
            }
        }
        rejected
    }

    /// The configured level; `warn` when it does not parse.
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::WARN)
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let level = self.level().as_str().to_ascii_lowercase();
        let mut directives = vec!["warn".to_string()];
        directives.extend(QGATE_TARGETS.iter().map(|t| format!("{t}={level}")));
        directives.join(",")
    }
}

/// Install the global subscriber. Returns `false` when one was already set,
/// in which case nothing changes.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_span_events(span_events);

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> (TelemetryConfig, Vec<&'static str>) {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = TelemetryConfig::default();
        let rejected = config.apply_overrides(|name| vars.get(name).cloned());
        (config, rejected)
    }

    #[test]
    fn test_log_format_parses() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_directives_scope_level_to_qgate_targets() {
        let config = TelemetryConfig {
            level: "DEBUG".to_string(),
            ..TelemetryConfig::default()
        };
        assert_eq!(
            config.filter_directives(),
            "warn,qgate=debug,qgate_core=debug,qgate_ci=debug"
        );
    }

    #[test]
    fn test_unparseable_level_falls_back_to_warn() {
        let config = TelemetryConfig {
            level: "loud".to_string(),
            ..TelemetryConfig::default()
        };
        assert_eq!(config.level(), Level::WARN);
    }

    #[test]
    fn test_env_overrides() {
        let (config, rejected) = overrides(&[
            (ENV_LOG_FORMAT, "json"),
            (ENV_LOG_LEVEL, "info"),
            (ENV_LOG_SPANS, "true"),
        ]);
        assert!(rejected.is_empty());
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level(), Level::INFO);
        assert!(config.span_timings);
    }

    #[test]
    fn test_invalid_env_overrides_are_reported() {
        let (config, rejected) = overrides(&[
            (ENV_LOG_FORMAT, "yaml"),
            (ENV_LOG_LEVEL, "chatty"),
            (ENV_LOG_SPANS, "sometimes"),
        ]);
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(rejected, vec![ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_LOG_SPANS]);
    }

    #[test]
    fn test_second_init_is_refused() {
        init_tracing(&TelemetryConfig::default());
        assert!(!init_tracing(&TelemetryConfig {
            format: LogFormat::Json,
            ..TelemetryConfig::default()
        }));
    }
}
