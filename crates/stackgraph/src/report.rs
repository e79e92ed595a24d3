//! Execution results: per-operation outcomes, rollback and run status

use crate::plan::{OpKey, PlanAction};
use crate::provider::ErrorCategory;
use crate::types::ResourceKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The operation a non-success outcome is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    Op(OpKey),
    /// The run was cancelled before this operation started
    Cancelled,
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Op(key) => key.fmt(f),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Why an operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider returned an error (after any retries)
    Provider(ErrorCategory),
    /// A deferred reference could not be substituted
    MissingOutput,
}

impl FailureCause {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Provider(category) => category.description(),
            Self::MissingOutput => "Missing output",
        }
    }
}

/// Terminal state of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpOutcome {
    Succeeded,
    NoOp,
    Failed { cause: FailureCause, error: String },
    /// A prerequisite did not succeed
    Blocked { root_cause: RootCause },
    /// Never started because the run halted or was cancelled
    Skipped { root_cause: RootCause },
}

impl OpOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::NoOp)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::NoOp => "no-op",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Result of one planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpReport {
    pub key: OpKey,
    pub kind: ResourceKind,
    pub outcome: OpOutcome,
    /// Provider calls made, including retries
    pub attempts: u32,
    pub duration: Duration,
    /// Identity realised or adopted by this operation
    pub identity: Option<String>,
}

impl OpReport {
    pub(crate) fn new(key: OpKey, kind: ResourceKind, outcome: OpOutcome) -> Self {
        Self {
            key,
            kind,
            outcome,
            attempts: 0,
            duration: Duration::ZERO,
            identity: None,
        }
    }

    /// The operation this outcome is attributed to, for non-successes
    pub fn root_cause(&self) -> Option<RootCause> {
        match &self.outcome {
            OpOutcome::Succeeded | OpOutcome::NoOp => None,
            OpOutcome::Failed { .. } => Some(RootCause::Op(self.key.clone())),
            OpOutcome::Blocked { root_cause } | OpOutcome::Skipped { root_cause } => {
                Some(root_cause.clone())
            }
        }
    }
}

/// Result of undoing one succeeded operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackOutcome {
    Undone,
    Failed { error: String },
    /// Left in place because a dependent of it could not be undone
    Kept { dependent: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackEntry {
    /// The operation that was undone
    pub key: OpKey,
    pub outcome: RollbackOutcome,
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Summary of execution results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub no_change: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    pub rollback_failed: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Total number of operations processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.no_change + self.failed + self.blocked + self.skipped
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.skipped == 0
    }

    /// Add an operation result to the summary
    pub fn add_result(&mut self, report: &OpReport) {
        match (&report.outcome, report.key.action) {
            (OpOutcome::Succeeded, PlanAction::Create) => self.created += 1,
            (OpOutcome::Succeeded, PlanAction::Update) => self.updated += 1,
            (OpOutcome::Succeeded, PlanAction::Delete) => self.deleted += 1,
            (OpOutcome::Succeeded | OpOutcome::NoOp, _) => self.no_change += 1,
            (OpOutcome::Failed { .. }, _) => self.failed += 1,
            (OpOutcome::Blocked { .. }, _) => self.blocked += 1,
            (OpOutcome::Skipped { .. }, _) => self.skipped += 1,
        }
    }

    pub fn add_rollback(&mut self, entry: &RollbackEntry) {
        match entry.outcome {
            RollbackOutcome::Undone => self.rolled_back += 1,
            RollbackOutcome::Failed { .. } | RollbackOutcome::Kept { .. } => self.rollback_failed += 1,
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub status: RunStatus,
    /// One entry per planned operation, in plan order
    pub operations: Vec<OpReport>,
    /// Undo attempts, in the order they ran
    pub rollback: Vec<RollbackEntry>,
    /// Export map from output bindings; empty unless the run succeeded
    pub outputs: BTreeMap<String, String>,
    pub summary: ExecuteSummary,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Process exit code: 0 on success, 1 on failure, 2 when cancelled
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 2,
        }
    }

    pub fn get(&self, key: &OpKey) -> Option<&OpReport> {
        self.operations.iter().find(|r| &r.key == key)
    }

    /// Operations that failed on their own account
    pub fn failures(&self) -> impl Iterator<Item = &OpReport> {
        self.operations
            .iter()
            .filter(|r| matches!(r.outcome, OpOutcome::Failed { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(action: PlanAction, id: &str, outcome: OpOutcome) -> OpReport {
        OpReport::new(OpKey::new(action, id), ResourceKind::Registry, outcome)
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        summary.add_result(&report(PlanAction::Create, "a", OpOutcome::Succeeded));
        summary.add_result(&report(PlanAction::Delete, "b", OpOutcome::Succeeded));
        summary.add_result(&report(PlanAction::NoOp, "c", OpOutcome::NoOp));
        assert_eq!(summary.total_changes(), 2);
        assert!(summary.is_success());

        summary.add_result(&report(
            PlanAction::Update,
            "d",
            OpOutcome::Failed {
                cause: FailureCause::Provider(ErrorCategory::Invalid),
                error: "bad".into(),
            },
        ));
        assert!(!summary.is_success());
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn test_root_cause_attribution() {
        let failed = report(
            PlanAction::Create,
            "cluster",
            OpOutcome::Failed {
                cause: FailureCause::MissingOutput,
                error: "no output".into(),
            },
        );
        assert_eq!(failed.root_cause(), Some(RootCause::Op(failed.key.clone())));

        let blocked = report(
            PlanAction::Create,
            "nodes",
            OpOutcome::Blocked {
                root_cause: RootCause::Op(failed.key.clone()),
            },
        );
        assert_eq!(blocked.root_cause(), Some(RootCause::Op(failed.key)));
        assert_eq!(report(PlanAction::NoOp, "x", OpOutcome::NoOp).root_cause(), None);
    }
}
