//! Issue source and pull request publisher.
//!
//! The orchestration loop only sees the `IssueSource` trait; `GhCli` is the
//! production implementation.

mod client;

use async_trait::async_trait;

use crate::domain::{Issue, IssueSummary, PrReference, Publication};
use crate::error::Result;

pub use client::{GhCli, GhConfig, parse_pr_number, pr_body, pr_title};

/// Where work items come from and where results go.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Open issues carrying `label`, most recently updated first.
    async fn list_candidates(&self, label: &str) -> Result<Vec<IssueSummary>>;

    /// Current state of one issue.
    async fn view_issue(&self, id: u64) -> Result<Issue>;

    /// Create a pull request for the pushed branch, or reuse the open one.
    async fn publish_result(&self, issue: &Issue, publication: &Publication) -> Result<PrReference>;
}
