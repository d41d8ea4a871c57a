//! Processing attempt outcome types.
//!
//! Every attempt ends in exactly one `RunOutcome`. The orchestration loop
//! matches on it exhaustively to pick the next status.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Outcome of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Tool succeeded without touching the tree
    NoChangeNeeded,
    /// Tool succeeded, changes committed and pushed
    ChangesProduced { head_sha: String, diff_summary: String },
    /// Tool exited non-zero; attributable to the work item
    ToolFailed { exit_code: Option<i32>, error: String },
    /// Timeout, git, push or publish failure; attributable to the environment
    InfrastructureFailed { error: String },
}

impl RunOutcome {
    /// Shorthand for an infrastructure failure.
    pub fn infrastructure(error: impl Into<String>) -> Self {
        RunOutcome::InfrastructureFailed { error: error.into() }
    }

    /// The persisted discriminator.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RunOutcome::NoChangeNeeded => OutcomeKind::NoChangeNeeded,
            RunOutcome::ChangesProduced { .. } => OutcomeKind::ChangesProduced,
            RunOutcome::ToolFailed { .. } => OutcomeKind::ToolFailed,
            RunOutcome::InfrastructureFailed { .. } => OutcomeKind::InfrastructureFailed,
        }
    }

    /// Reason recorded as `last_error`, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            RunOutcome::NoChangeNeeded => Some("no changes produced"),
            RunOutcome::ChangesProduced { .. } => None,
            RunOutcome::ToolFailed { error, .. } | RunOutcome::InfrastructureFailed { error } => Some(error),
        }
    }

    /// Head commit for produced changes.
    pub fn head_sha(&self) -> Option<&str> {
        match self {
            RunOutcome::ChangesProduced { head_sha, .. } => Some(head_sha),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RunOutcome::ToolFailed { .. } | RunOutcome::InfrastructureFailed { .. }
        )
    }
}

/// Outcome discriminator as stored in the database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    NoChangeNeeded,
    ChangesProduced,
    ToolFailed,
    InfrastructureFailed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::NoChangeNeeded => "no-change-needed",
            OutcomeKind::ChangesProduced => "changes-produced",
            OutcomeKind::ToolFailed => "tool-failed",
            OutcomeKind::InfrastructureFailed => "infrastructure-failed",
        }
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-change-needed" => Ok(OutcomeKind::NoChangeNeeded),
            "changes-produced" => Ok(OutcomeKind::ChangesProduced),
            "tool-failed" => Ok(OutcomeKind::ToolFailed),
            "infrastructure-failed" => Ok(OutcomeKind::InfrastructureFailed),
            other => Err(format!("unknown outcome kind: {}", other)),
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
