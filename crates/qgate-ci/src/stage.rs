//! Stage definitions and the default workflow.

use std::collections::HashSet;

use qgate_core::{BuiltinCheck, CheckDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// How a stage failure affects the rest of the workflow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatingPolicy {
    /// Stop on failure; try autofix and re-run the stage.
    #[default]
    FailFast,

    /// Record failures and move on.
    FailOpen,
}

impl GatingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatingPolicy::FailFast => "fail_fast",
            GatingPolicy::FailOpen => "fail_open",
        }
    }
}

/// A named group of checks gated together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: String,
    pub policy: GatingPolicy,
    pub checks: Vec<CheckDefinition>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, policy: GatingPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            checks: Vec::new(),
        }
    }

    pub fn fail_fast(name: impl Into<String>) -> Self {
        Self::new(name, GatingPolicy::FailFast)
    }

    pub fn fail_open(name: impl Into<String>) -> Self {
        Self::new(name, GatingPolicy::FailOpen)
    }

    /// Add a check; its stage is set to this stage's name.
    pub fn with_check(mut self, mut check: CheckDefinition) -> Self {
        check.stage = self.name.clone();
        self.checks.push(check);
        self
    }

    pub fn enabled_checks(&self) -> impl Iterator<Item = &CheckDefinition> {
        self.checks.iter().filter(|c| c.enabled)
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name.clone()).collect()
    }

    pub fn find_check(&self, name: &str) -> Option<&CheckDefinition> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// The builtin Rust workflow: fast, test, comprehensive, advisory.
pub fn default_workflow() -> Vec<StageDefinition> {
    let mut stages: Vec<StageDefinition> = Vec::new();
    for builtin in BuiltinCheck::ALL {
        let stage_name = builtin.stage();
        let idx = match stages.iter().position(|s| s.name == stage_name) {
            Some(idx) => idx,
            None => {
                let policy = if stage_name == BuiltinCheck::CargoAudit.stage() {
                    GatingPolicy::FailOpen
                } else {
                    GatingPolicy::FailFast
                };
                stages.push(StageDefinition::new(stage_name, policy));
                stages.len() - 1
            }
        };
        stages[idx].checks.push(CheckDefinition::from_builtin(builtin));
    }
    stages
}

/// Check workflow invariants: at least one stage, unique stage and check
/// names, runnable commands for enabled checks.
pub fn validate_workflow(stages: &[StageDefinition]) -> Result<()> {
    if stages.is_empty() {
        return Err(PipelineError::NoStages);
    }
    let mut stage_names = HashSet::new();
    let mut check_names = HashSet::new();
    for stage in stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(PipelineError::DuplicateStage(stage.name.clone()));
        }
        for check in &stage.checks {
            if !check_names.insert(check.name.as_str()) {
                return Err(PipelineError::DuplicateCheck(check.name.clone()));
            }
            if check.enabled {
                check.validate().map_err(|e| PipelineError::InvalidCheck {
                    check: check.name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
    }
    Ok(())
}

/// Keep only the named stages, in declared order.
pub fn select_stages(stages: &[StageDefinition], names: &[String]) -> Result<Vec<StageDefinition>> {
    if let Some(unknown) = names
        .iter()
        .find(|name| !stages.iter().any(|s| &s.name == *name))
    {
        return Err(PipelineError::UnknownStage(unknown.clone()));
    }
    Ok(stages
        .iter()
        .filter(|s| names.contains(&s.name))
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_workflow_layout() {
        let stages = default_workflow();
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "test", "comprehensive", "advisory"]);

        assert_eq!(stages[0].check_names(), vec!["cargo_fmt", "cargo_check"]);
        assert_eq!(stages[0].policy, GatingPolicy::FailFast);
        assert_eq!(stages[3].policy, GatingPolicy::FailOpen);
        assert_eq!(stages[3].check_names(), vec!["cargo_audit"]);
        assert!(validate_workflow(&stages).is_ok());
    }

    #[test]
    fn test_with_check_sets_stage() {
        let stage = StageDefinition::fail_fast("lint")
            .with_check(CheckDefinition::custom("a", "elsewhere", vec!["true".into()], 5));
        assert_eq!(stage.checks[0].stage, "lint");
    }

    #[test]
    fn test_validate_rejects_empty_workflow() {
        assert_eq!(validate_workflow(&[]), Err(PipelineError::NoStages));
    }

    #[test]
    fn test_validate_rejects_duplicate_stage() {
        let stages = vec![StageDefinition::fail_fast("a"), StageDefinition::fail_open("a")];
        assert_eq!(
            validate_workflow(&stages),
            Err(PipelineError::DuplicateStage("a".into()))
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_check_across_stages() {
        let check = CheckDefinition::custom("lint", "x", vec!["true".into()], 5);
        let stages = vec![
            StageDefinition::fail_fast("a").with_check(check.clone()),
            StageDefinition::fail_fast("b").with_check(check),
        ];
        assert_eq!(
            validate_workflow(&stages),
            Err(PipelineError::DuplicateCheck("lint".into()))
        );
    }

    #[test]
    fn test_validate_ignores_disabled_empty_command() {
        let stages = vec![StageDefinition::fail_fast("a")
            .with_check(CheckDefinition::custom("off", "a", vec![], 5).disabled())];
        assert!(validate_workflow(&stages).is_ok());

        let stages = vec![StageDefinition::fail_fast("a")
            .with_check(CheckDefinition::custom("on", "a", vec![], 5))];
        assert!(matches!(
            validate_workflow(&stages),
            Err(PipelineError::InvalidCheck { .. })
        ));
    }

    #[test]
    fn test_select_stages_keeps_declared_order() {
        let selected = select_stages(
            &default_workflow(),
            &["advisory".to_string(), "fast".to_string()],
        )
        .unwrap();
        let names: Vec<&str> = selected.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "advisory"]);
    }

    #[test]
    fn test_select_unknown_stage_is_error() {
        let err = select_stages(&default_workflow(), &["nope".to_string()]).unwrap_err();
        assert_eq!(err, PipelineError::UnknownStage("nope".into()));
    }
}
