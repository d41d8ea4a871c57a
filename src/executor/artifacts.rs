//! Per-attempt run directory.
//!
//! Layout: `{runs_dir}/issue-{id}/run-{stamp}/` holding `prompt.md`,
//! `tool_stdout.log`, `tool_stderr.log`, `git_diff.patch` and `summary.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::OutcomeKind;
use crate::error::Result;
use crate::id::run_stamp;

pub const PROMPT_FILE: &str = "prompt.md";
pub const STDOUT_FILE: &str = "tool_stdout.log";
pub const STDERR_FILE: &str = "tool_stderr.log";
pub const PATCH_FILE: &str = "git_diff.patch";
pub const SUMMARY_FILE: &str = "summary.json";

/// Final record of one attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub issue_id: u64,
    pub outcome: OutcomeKind,
    /// Status the item was released with
    pub status: String,
    pub branch: String,
    pub head_sha: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_dir: PathBuf,
}

/// Handle to one run directory
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Create a fresh run directory for `issue_id`.
    pub fn create(runs_dir: &Path, issue_id: u64) -> Result<Self> {
        let issue_dir = runs_dir.join(format!("issue-{}", issue_id));
        let stamp = run_stamp();
        let mut dir = issue_dir.join(format!("run-{}", stamp));
        let mut n = 2;
        while dir.exists() {
            dir = issue_dir.join(format!("run-{}-{}", stamp, n));
            n += 1;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        fs::write(self.dir.join(PROMPT_FILE), prompt)?;
        Ok(())
    }

    pub fn write_tool_output(&self, stdout: &str, stderr: &str) -> Result<()> {
        fs::write(self.dir.join(STDOUT_FILE), stdout)?;
        fs::write(self.dir.join(STDERR_FILE), stderr)?;
        Ok(())
    }

    pub fn write_patch(&self, patch: &str) -> Result<()> {
        fs::write(self.dir.join(PATCH_FILE), patch)?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(self.dir.join(SUMMARY_FILE), json)?;
        Ok(())
    }
}
