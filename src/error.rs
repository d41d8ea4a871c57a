//! Error types for Scryer
//!
//! Centralized error handling using thiserror. The orchestration loop matches
//! on these exhaustively to decide between retrying, backing off and
//! recording an outcome.

use std::path::PathBuf;

use thiserror::Error;

/// All error types that can occur in Scryer
#[derive(Debug, Error)]
pub enum ScryerError {
    /// Another run already owns the work item
    #[error("Issue #{0} is not claimable")]
    ClaimConflict(u64),

    /// A live workspace already exists for the work item
    #[error("Workspace conflict for issue #{id}: {} already exists", path.display())]
    WorkspaceConflict { id: u64, path: PathBuf },

    /// The store could not be read or written
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store exists but cannot be used safely
    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// GitHub CLI error
    #[error("GitHub error: {0}")]
    GitHub(String),

    /// Git command error
    #[error("Git error: {0}")]
    Git(String),

    /// Workspace removal failed after retries
    #[error("Workspace cleanup failed: {0}")]
    WorkspaceCleanup(String),

    /// Prompt template error
    #[error("Template error: {0}")]
    Template(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScryerError {
    /// Errors that end the current cycle but leave the daemon running.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, ScryerError::StoreUnavailable(_) | ScryerError::GitHub(_))
    }

    /// Benign errors that need no backoff.
    pub fn is_benign(&self) -> bool {
        matches!(self, ScryerError::ClaimConflict(_))
    }
}

impl From<rusqlite::Error> for ScryerError {
    fn from(err: rusqlite::Error) -> Self {
        ScryerError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Scryer operations
pub type Result<T> = std::result::Result<T, ScryerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_conflict_error() {
        let err = ScryerError::ClaimConflict(42);
        assert_eq!(err.to_string(), "Issue #42 is not claimable");
        assert!(err.is_benign());
        assert!(!err.is_cycle_fatal());
    }

    #[test]
    fn test_workspace_conflict_error() {
        let err = ScryerError::WorkspaceConflict {
            id: 7,
            path: PathBuf::from("/tmp/worktrees/issue-7"),
        };
        assert_eq!(
            err.to_string(),
            "Workspace conflict for issue #7: /tmp/worktrees/issue-7 already exists"
        );
    }

    #[test]
    fn test_store_unavailable_from_rusqlite() {
        let err: ScryerError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, ScryerError::StoreUnavailable(_)));
        assert!(err.is_cycle_fatal());
    }

    #[test]
    fn test_github_error_is_cycle_fatal() {
        let err = ScryerError::GitHub("rate limited".to_string());
        assert_eq!(err.to_string(), "GitHub error: rate limited");
        assert!(err.is_cycle_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ScryerError = io_err.into();
        assert!(matches!(err, ScryerError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: ScryerError = json_err.into();
        assert!(matches!(err, ScryerError::Json(_)));
    }
}
