//! Work item records for WorkStore persistence.
//!
//! A `WorkItem` is one GitHub issue tracked through the claim/process/release
//! lifecycle. The lease is not a separate entity: an item is leased while
//! `lease_owner` is set and `lease_expiry` lies in the future.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::OutcomeKind;

/// One tracked issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// GitHub issue number
    pub id: u64,

    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub labels: Vec<String>,

    /// Upstream `updatedAt`, drives claim ordering
    pub source_updated_at: Option<String>,

    pub status: ItemStatus,

    /// Owner token of the current lease holder
    pub lease_owner: Option<String>,

    /// Lease deadline
    pub lease_expiry: Option<DateTime<Utc>>,

    /// Number of times the item was claimed
    pub attempt_count: u32,

    /// Consecutive tool-failed outcomes
    pub tool_failures: u32,

    /// Consecutive infrastructure-failed outcomes
    pub infra_failures: u32,

    pub last_outcome: Option<OutcomeKind>,
    pub last_error: Option<String>,

    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub head_sha: Option<String>,
    pub last_run_dir: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Whether `owner` holds the lease (ignoring expiry).
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.lease_owner.as_deref() == Some(owner)
    }
}

/// Work item status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a lease holder
    Running,
    /// Pull request published
    Done,
    /// Tool ran and changed nothing
    NoChange,
    /// Not processed (closed, unlabeled, or skip label)
    Skipped,
    /// Retries exhausted; a human has to look
    NeedsAttention,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 6] = [
        ItemStatus::Pending,
        ItemStatus::Running,
        ItemStatus::Done,
        ItemStatus::NoChange,
        ItemStatus::Skipped,
        ItemStatus::NeedsAttention,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Done => "done",
            ItemStatus::NoChange => "no_change",
            ItemStatus::Skipped => "skipped",
            ItemStatus::NeedsAttention => "needs_attention",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Done | ItemStatus::NoChange | ItemStatus::Skipped | ItemStatus::NeedsAttention
        )
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status: {}", s))
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
