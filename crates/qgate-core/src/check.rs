//! Check definitions: what to run, where it belongs, and how to judge it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{QgateError, Result};

/// Template token replaced by the file set (one argument per file).
pub const FILES_TOKEN: &str = "{files}";

/// Template fragment replaced by the workspace root.
pub const ROOT_TOKEN: &str = "{root}";

/// Builtin checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinCheck {
    /// cargo fmt --all -- --check
    CargoFmt,

    /// cargo check --workspace --all-targets
    CargoCheck,

    /// cargo test --workspace
    CargoTest,

    /// cargo clippy --workspace --all-targets -- -D warnings
    CargoClippy,

    /// cargo audit
    CargoAudit,
}

impl BuiltinCheck {
    /// Every builtin, in default workflow order.
    pub const ALL: [BuiltinCheck; 5] = [
        BuiltinCheck::CargoFmt,
        BuiltinCheck::CargoCheck,
        BuiltinCheck::CargoTest,
        BuiltinCheck::CargoClippy,
        BuiltinCheck::CargoAudit,
    ];

    /// Get the check name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinCheck::CargoFmt => "cargo_fmt",
            BuiltinCheck::CargoCheck => "cargo_check",
            BuiltinCheck::CargoTest => "cargo_test",
            BuiltinCheck::CargoClippy => "cargo_clippy",
            BuiltinCheck::CargoAudit => "cargo_audit",
        }
    }

    /// Stage the check belongs to in the default workflow.
    pub fn stage(&self) -> &'static str {
        match self {
            BuiltinCheck::CargoFmt | BuiltinCheck::CargoCheck => "fast",
            BuiltinCheck::CargoTest => "test",
            BuiltinCheck::CargoClippy => "comprehensive",
            BuiltinCheck::CargoAudit => "advisory",
        }
    }

    /// Get the check's command template.
    pub fn command(&self) -> Vec<String> {
        let parts: &[&str] = match self {
            BuiltinCheck::CargoFmt => &["cargo", "fmt", "--all", "--", "--check"],
            BuiltinCheck::CargoCheck => &["cargo", "check", "--workspace", "--all-targets"],
            BuiltinCheck::CargoTest => &["cargo", "test", "--workspace"],
            BuiltinCheck::CargoClippy => &[
                "cargo",
                "clippy",
                "--workspace",
                "--all-targets",
                "--",
                "-D",
                "warnings",
            ],
            BuiltinCheck::CargoAudit => &["cargo", "audit"],
        };
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Get the check's auto-repair command (if available).
    pub fn fix_command(&self) -> Option<Vec<String>> {
        let parts: &[&str] = match self {
            BuiltinCheck::CargoFmt => &["cargo", "fmt", "--all"],
            BuiltinCheck::CargoClippy => &[
                "cargo",
                "clippy",
                "--fix",
                "--allow-dirty",
                "--allow-staged",
                "--workspace",
            ],
            _ => return None,
        };
        Some(parts.iter().map(|s| s.to_string()).collect())
    }

    /// Whether the outcome is a function of the workspace files alone.
    /// `cargo audit` also reads the remote advisory database.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, BuiltinCheck::CargoAudit)
    }

    /// Default timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            BuiltinCheck::CargoFmt => 120,
            BuiltinCheck::CargoCheck => 600,
            BuiltinCheck::CargoTest => 1800,
            BuiltinCheck::CargoClippy => 900,
            BuiltinCheck::CargoAudit => 300,
        }
    }

    /// Look a builtin up by its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// The closed set of check kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "builtin", rename_all = "snake_case")]
pub enum CheckKind {
    Builtin(BuiltinCheck),
    Custom,
}

/// How a finished process is judged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Classifier {
    /// Exit code 0 passes.
    ExitCode,

    /// Any of the listed exit codes passes.
    AllowedExitCodes { codes: Vec<i32> },

    /// Exit code 0 passes unless the pattern matches stdout or stderr.
    FailOnOutput { pattern: String },
}

impl Classifier {
    /// Returns `Ok(true)` when the process outcome counts as a pass.
    pub fn passes(&self, exit_code: i32, stdout: &str, stderr: &str) -> Result<bool> {
        match self {
            Classifier::ExitCode => Ok(exit_code == 0),
            Classifier::AllowedExitCodes { codes } => Ok(codes.contains(&exit_code)),
            Classifier::FailOnOutput { pattern } => {
                let re = Regex::new(pattern).map_err(|e| QgateError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                Ok(exit_code == 0 && !re.is_match(stdout) && !re.is_match(stderr))
            }
        }
    }
}

/// Static description of a runnable check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckDefinition {
    /// Unique check name.
    pub name: String,

    pub kind: CheckKind,

    /// Command template (first element is the executable).
    pub command: Vec<String>,

    /// Stage this check belongs to.
    pub stage: String,

    /// Timeout in seconds.
    pub timeout_secs: u64,

    /// Whether results may be served from the cache.
    pub cacheable: bool,

    /// Whether the check edits files. Mutating checks are never cached.
    pub mutating: bool,

    /// Bumped whenever the definition changes meaning; part of the cache key.
    pub version: u32,

    pub classifier: Classifier,

    /// Optional auto-repair command.
    pub fix_command: Option<Vec<String>>,

    /// Whether this check is enabled.
    pub enabled: bool,
}

impl CheckDefinition {
    /// Create a check definition from a builtin.
    pub fn from_builtin(check: BuiltinCheck) -> Self {
        Self {
            name: check.name().to_string(),
            kind: CheckKind::Builtin(check),
            command: check.command(),
            stage: check.stage().to_string(),
            timeout_secs: check.default_timeout_secs(),
            cacheable: check.is_cacheable(),
            mutating: false,
            version: 1,
            classifier: Classifier::ExitCode,
            fix_command: check.fix_command(),
            enabled: true,
        }
    }

    /// Create a custom check definition.
    pub fn custom(
        name: impl Into<String>,
        stage: impl Into<String>,
        command: Vec<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::Custom,
            command,
            stage: stage.into(),
            timeout_secs,
            cacheable: true,
            mutating: false,
            version: 1,
            classifier: Classifier::ExitCode,
            fix_command: None,
            enabled: true,
        }
    }

    /// Mark the check as file-mutating (which also makes it uncacheable).
    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    /// Opt out of result caching.
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_fix_command(mut self, fix_command: Vec<String>) -> Self {
        self.fix_command = Some(fix_command);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Disable this check.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether results of this check may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.mutating
    }

    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QgateError::InvalidCheck("check name is empty".to_string()));
        }
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(QgateError::InvalidCheck(format!(
                "check {} has empty command",
                self.name
            )));
        }
        if let Classifier::FailOnOutput { pattern } = &self.classifier {
            Regex::new(pattern).map_err(|e| QgateError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Expand the command template against a workspace root and file list.
    ///
    /// A token equal to `{files}` expands to one argument per file; `{root}`
    /// is substituted anywhere it appears.
    pub fn render_command(&self, root: &Path, files: &[std::path::PathBuf]) -> Vec<String> {
        let root_str = root.to_string_lossy();
        let mut rendered = Vec::with_capacity(self.command.len() + files.len());
        for token in &self.command {
            if token == FILES_TOKEN {
                rendered.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
            } else {
                rendered.push(token.replace(ROOT_TOKEN, &root_str));
            }
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_builtin_check_names() {
        assert_eq!(BuiltinCheck::CargoFmt.name(), "cargo_fmt");
        assert_eq!(BuiltinCheck::CargoCheck.name(), "cargo_check");
        assert_eq!(BuiltinCheck::CargoClippy.name(), "cargo_clippy");
        assert_eq!(BuiltinCheck::CargoTest.name(), "cargo_test");
        assert_eq!(BuiltinCheck::CargoAudit.name(), "cargo_audit");
    }

    #[test]
    fn test_builtin_from_name() {
        for b in BuiltinCheck::ALL {
            assert_eq!(BuiltinCheck::from_name(b.name()), Some(b));
        }
        assert_eq!(BuiltinCheck::from_name("cargo_nope"), None);
    }

    #[test]
    fn test_builtin_fix_command() {
        assert!(BuiltinCheck::CargoFmt.fix_command().is_some());
        assert!(BuiltinCheck::CargoClippy.fix_command().is_some());
        assert!(BuiltinCheck::CargoCheck.fix_command().is_none());
        assert!(BuiltinCheck::CargoTest.fix_command().is_none());
    }

    #[test]
    fn test_from_builtin_defaults() {
        let def = CheckDefinition::from_builtin(BuiltinCheck::CargoFmt);
        assert_eq!(def.name, "cargo_fmt");
        assert_eq!(def.stage, "fast");
        assert!(def.command.contains(&"--check".to_string()));
        assert!(def.is_cacheable());
        assert!(def.enabled);
    }

    #[test]
    fn test_audit_is_never_cached() {
        let audit = CheckDefinition::from_builtin(BuiltinCheck::CargoAudit);
        assert!(!audit.is_cacheable());
        for b in [BuiltinCheck::CargoFmt, BuiltinCheck::CargoCheck, BuiltinCheck::CargoTest] {
            assert!(CheckDefinition::from_builtin(b).is_cacheable());
        }
    }

    #[test]
    fn test_mutating_is_never_cacheable() {
        let def = CheckDefinition::custom("fmt-write", "fast", vec!["fmt".into()], 10).mutating();
        assert!(def.cacheable);
        assert!(!def.is_cacheable());
    }

    #[test]
    fn test_render_command_expands_files_and_root() {
        let def = CheckDefinition::custom(
            "lint",
            "fast",
            vec![
                "lint".into(),
                "--config={root}/lint.toml".into(),
                FILES_TOKEN.into(),
            ],
            10,
        );
        let rendered = def.render_command(
            Path::new("/ws"),
            &[PathBuf::from("a.rs"), PathBuf::from("b/c.rs")],
        );
        assert_eq!(
            rendered,
            vec!["lint", "--config=/ws/lint.toml", "a.rs", "b/c.rs"]
        );
    }

    #[test]
    fn test_render_command_without_files_token() {
        let def = CheckDefinition::from_builtin(BuiltinCheck::CargoCheck);
        let rendered = def.render_command(Path::new("/ws"), &[PathBuf::from("a.rs")]);
        assert_eq!(rendered, def.command);
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let def = CheckDefinition::custom("empty", "fast", vec![], 10);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_classifier_exit_code() {
        assert!(Classifier::ExitCode.passes(0, "", "").unwrap());
        assert!(!Classifier::ExitCode.passes(1, "", "").unwrap());
    }

    #[test]
    fn test_classifier_allowed_codes() {
        let c = Classifier::AllowedExitCodes { codes: vec![0, 2] };
        assert!(c.passes(2, "", "").unwrap());
        assert!(!c.passes(1, "", "").unwrap());
    }

    #[test]
    fn test_classifier_fail_on_output() {
        let c = Classifier::FailOnOutput {
            pattern: r"(?i)warning:".to_string(),
        };
        assert!(c.passes(0, "all good", "").unwrap());
        assert!(!c.passes(0, "", "Warning: unused import").unwrap());
        assert!(!c.passes(1, "", "").unwrap());
    }

    #[test]
    fn test_classifier_invalid_pattern_is_error() {
        let c = Classifier::FailOnOutput {
            pattern: "([".to_string(),
        };
        assert!(c.passes(0, "", "").is_err());
    }
}
