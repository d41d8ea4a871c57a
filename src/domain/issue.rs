//! Issue and pull request types exchanged with the issue source.

use serde::{Deserialize, Serialize};

/// Listing entry returned by candidate discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueSummary {
    pub number: u64,
    pub title: String,
    pub url: Option<String>,
    pub labels: Vec<String>,
    pub updated_at: Option<String>,
}

/// Full issue as read right before processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub labels: Vec<String>,
    /// `OPEN` or `CLOSED`
    pub state: String,
    pub updated_at: Option<String>,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.state.eq_ignore_ascii_case("open")
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Labels from `skip` present on the issue, sorted and deduplicated.
    pub fn skip_hits(&self, skip: &[String]) -> Vec<String> {
        let mut hits: Vec<String> = self.labels.iter().filter(|l| skip.contains(l)).cloned().collect();
        hits.sort();
        hits.dedup();
        hits
    }

    /// Reason to skip the issue before any work is done.
    pub fn skip_reason(&self, trigger_label: &str, skip_labels: &[String]) -> Option<String> {
        if !self.is_open() {
            return Some("issue is no longer open".to_string());
        }
        if !self.has_label(trigger_label) {
            return Some(format!("missing trigger label '{}'", trigger_label));
        }
        let hits = self.skip_hits(skip_labels);
        if !hits.is_empty() {
            return Some(format!("contains skip label(s): {}", hits.join(", ")));
        }
        None
    }

    pub fn summary(&self) -> IssueSummary {
        IssueSummary {
            number: self.number,
            title: self.title.clone(),
            url: self.url.clone(),
            labels: self.labels.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// What the executor produced, handed to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub branch: String,
    pub base_branch: String,
    pub head_sha: String,
    pub diff_summary: String,
    pub draft: bool,
}

/// Reference to the created or reused pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrReference {
    pub number: Option<u64>,
    pub url: String,
    pub created: bool,
}
