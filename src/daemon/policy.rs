//! Retry policy: which status an item gets after an attempt.

use crate::domain::RunOutcome;
use crate::store::{DEFAULT_MAX_INFRA_RETRIES, ItemStatus, WorkItem};

/// Failure thresholds, both counted over consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Tool failures before an item needs attention
    pub max_attempts: u32,

    /// Infrastructure failures before an item needs attention
    pub max_infra_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_infra_retries: DEFAULT_MAX_INFRA_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Status for `item` after `outcome`.
    ///
    /// `ChangesProduced` means the PR is published; a failed publish arrives
    /// here as an infrastructure failure.
    pub fn next_status(&self, item: &WorkItem, outcome: &RunOutcome) -> ItemStatus {
        match outcome {
            RunOutcome::ChangesProduced { .. } => ItemStatus::Done,
            RunOutcome::NoChangeNeeded => ItemStatus::NoChange,
            RunOutcome::ToolFailed { .. } => {
                if item.tool_failures + 1 >= self.max_attempts {
                    ItemStatus::NeedsAttention
                } else {
                    ItemStatus::Pending
                }
            }
            RunOutcome::InfrastructureFailed { .. } => {
                if item.infra_failures + 1 >= self.max_infra_retries {
                    ItemStatus::NeedsAttention
                } else {
                    ItemStatus::Pending
                }
            }
        }
    }
}
