//! Cycle results and sleep planning between cycles.

use std::time::Duration;

use crate::domain::OutcomeKind;
use crate::error::{Result, ScryerError};
use crate::store::ItemStatus;

/// Consecutive failed cycles before the sleep is stretched
const FAILURE_THRESHOLD: u32 = 3;

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    /// Nothing claimable
    Idle,
    /// Daily limit reached, discovery skipped
    Limited,
    /// One item was claimed and released
    Processed {
        id: u64,
        status: ItemStatus,
        outcome: Option<OutcomeKind>,
    },
    /// The lease was lost mid-run; nothing recorded
    Abandoned { id: u64 },
}

impl CycleResult {
    /// A claimed item ended in a tool or infrastructure failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CycleResult::Processed {
                outcome: Some(OutcomeKind::ToolFailed | OutcomeKind::InfrastructureFailed),
                ..
            }
        )
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, CycleResult::Processed { .. })
    }
}

impl std::fmt::Display for CycleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleResult::Idle => write!(f, "idle"),
            CycleResult::Limited => write!(f, "daily-limit"),
            CycleResult::Processed { id, status, outcome } => match outcome {
                Some(kind) => write!(f, "issue={} status={} outcome={}", id, status, kind),
                None => write!(f, "issue={} status={}", id, status),
            },
            CycleResult::Abandoned { id } => write!(f, "issue={} abandoned", id),
        }
    }
}

/// Decides how long to sleep after each cycle.
///
/// GitHub errors back off exponentially from the poll interval. Other
/// failures count towards the consecutive-failure threshold.
#[derive(Debug, Clone)]
pub struct SleepPlanner {
    poll_interval: Duration,
    max_backoff: Duration,
    github_backoff: Duration,
    consecutive_failures: u32,
}

impl SleepPlanner {
    pub fn new(poll_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            poll_interval,
            max_backoff,
            github_backoff: poll_interval,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sleep before the next cycle, given how this one ended.
    pub fn after_cycle(&mut self, result: &Result<CycleResult>) -> Duration {
        match result {
            Err(ScryerError::GitHub(_)) => {
                let wait = self.github_backoff.min(self.max_backoff);
                self.github_backoff = (self.github_backoff * 2).min(self.max_backoff);
                return wait;
            }
            Err(_) => {
                self.github_backoff = self.poll_interval;
                self.consecutive_failures += 1;
            }
            Ok(cycle) => {
                self.github_backoff = self.poll_interval;
                if cycle.is_failure() {
                    self.consecutive_failures += 1;
                } else if cycle.is_processed() {
                    self.consecutive_failures = 0;
                }
            }
        }

        if self.consecutive_failures >= FAILURE_THRESHOLD {
            log::warn!(
                "consecutive failures threshold reached count={}",
                self.consecutive_failures
            );
            (self.poll_interval * 3).min(self.max_backoff)
        } else {
            self.poll_interval
        }
    }
}
