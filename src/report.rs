//! Validation report types.
//!
//! A report is the ordered list of stage results from one pre-commit run. The
//! commit is blocked iff any result is `Fail`; warnings are shown but never block.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EnforcementLayout,
    ServiceReachability,
    StagedChanges,
    RecentActivity,
    StateUpdate,
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::EnforcementLayout,
        Stage::ServiceReachability,
        Stage::StagedChanges,
        Stage::RecentActivity,
        Stage::StateUpdate,
        Stage::Aggregate,
    ];

    pub fn number(&self) -> usize {
        match self {
            Stage::EnforcementLayout => 1,
            Stage::ServiceReachability => 2,
            Stage::StagedChanges => 3,
            Stage::RecentActivity => 4,
            Stage::StateUpdate => 5,
            Stage::Aggregate => 6,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::EnforcementLayout => "enforcement layout",
            Stage::ServiceReachability => "service reachability",
            Stage::StagedChanges => "staged changes",
            Stage::RecentActivity => "recent agent activity",
            Stage::StateUpdate => "state update",
            Stage::Aggregate => "decision",
        }
    }

    /// Stages whose failure blocks the commit
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Stage::EnforcementLayout | Stage::ServiceReachability | Stage::StateUpdate
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.number(), self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub stage: Stage,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    pub fn pass(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            status: CheckStatus::Pass,
            message: message.into(),
        }
    }

    pub fn warn(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            status: CheckStatus::Warn,
            message: message.into(),
        }
    }

    pub fn fail(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            status: CheckStatus::Fail,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<CheckResult>,
    pub duration_ms: u64,
}

impl ValidationReport {
    pub fn push(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    pub fn get(&self, stage: Stage) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn status_of(&self, stage: Stage) -> Option<CheckStatus> {
        self.get(stage).map(|r| r.status)
    }

    pub fn is_blocked(&self) -> bool {
        self.results.iter().any(|r| r.status == CheckStatus::Fail)
    }

    pub fn verdict(&self) -> CheckStatus {
        if self.is_blocked() {
            CheckStatus::Fail
        } else {
            CheckStatus::Pass
        }
    }

    /// Failures, excluding the aggregate line that summarises them
    pub fn blocking_failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Fail && r.stage != Stage::Aggregate)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.status == CheckStatus::Warn)
    }

    /// Process exit code for the git hook
    pub fn exit_code(&self) -> i32 {
        if self.is_blocked() {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OpenMemory pre-commit validation")?;
        for result in &self.results {
            writeln!(f, "  [{}] {:<26} {}", result.status, result.stage.to_string(), result.message)?;
        }

        let failures: Vec<_> = self.blocking_failures().collect();
        if !failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "Blocking failures:")?;
            for r in failures {
                writeln!(f, "  x {}: {}", r.stage.display_name(), r.message)?;
            }
        }

        let warnings: Vec<_> = self.warnings().collect();
        if !warnings.is_empty() {
            writeln!(f)?;
            writeln!(f, "Warnings (commit not blocked):")?;
            for r in warnings {
                writeln!(f, "  ! {}: {}", r.stage.display_name(), r.message)?;
            }
        }

        writeln!(f)?;
        if self.is_blocked() {
            write!(f, "COMMIT BLOCKED")
        } else {
            write!(f, "COMMIT ALLOWED")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_stages() {
        let blocking: Vec<_> = Stage::ALL.iter().filter(|s| s.is_blocking()).collect();
        assert_eq!(
            blocking,
            vec![
                &Stage::EnforcementLayout,
                &Stage::ServiceReachability,
                &Stage::StateUpdate
            ]
        );
    }

    #[test]
    fn test_warnings_do_not_block() {
        let mut report = ValidationReport::default();
        report.push(CheckResult::pass(Stage::EnforcementLayout, "ok"));
        report.push(CheckResult::warn(Stage::RecentActivity, "nothing recorded"));
        assert!(!report.is_blocked());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.warnings().count(), 1);

        let text = report.to_string();
        assert!(text.contains("Warnings (commit not blocked):"));
        assert!(!text.contains("Blocking failures:"));
        assert!(text.ends_with("COMMIT ALLOWED"));
    }

    #[test]
    fn test_failure_blocks_and_is_separated() {
        let mut report = ValidationReport::default();
        report.push(CheckResult::fail(Stage::StateUpdate, "schema.py staged without state"));
        report.push(CheckResult::fail(Stage::Aggregate, "blocked by: state update"));
        assert!(report.is_blocked());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.verdict(), CheckStatus::Fail);
        assert_eq!(report.blocking_failures().count(), 1);

        let text = report.to_string();
        assert!(text.contains("Blocking failures:"));
        assert!(text.contains("[FAIL]"));
        assert!(text.ends_with("COMMIT BLOCKED"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let result = CheckResult::warn(Stage::RecentActivity, "x");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "warn");
        assert_eq!(json["stage"], "recent_activity");
    }
}
