//! Executor - one processing attempt inside a workspace.
//!
//! Renders the prompt, runs the generation tool, then turns whatever the tool
//! left behind into a `RunOutcome`: nothing, a pushed commit, or a failure
//! attributed either to the tool or to the environment.

use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};

use crate::domain::{Issue, RunOutcome};
use crate::error::Result;
use crate::executor::artifacts::RunArtifacts;
use crate::executor::tool::{GenerationTool, ToolError, ToolInvocation};
use crate::prompt::{PromptRenderer, load_conventions};
use crate::workspace::Workspace;
use crate::workspace::git::run_git;

const TAIL_LINES: usize = 20;
const TAIL_CHARS: usize = 2000;
const TITLE_MAX: usize = 72;

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Repository root, where convention files are read from
    pub repo_root: PathBuf,

    /// Remote branches are pushed to
    pub remote: String,

    /// Push produced branches
    pub push: bool,

    /// Wall-clock limit for the tool
    pub timeout: Duration,

    pub conventions_files: Vec<String>,
}

/// Result of `Executor::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
}

impl RunReport {
    fn infrastructure(error: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::infrastructure(error),
            exit_code: None,
        }
    }
}

/// Runs the generation tool and classifies its outcome.
pub struct Executor<T: GenerationTool> {
    tool: T,
    renderer: PromptRenderer,
    config: ExecutorConfig,
}

impl<T: GenerationTool> Executor<T> {
    pub fn new(tool: T, renderer: PromptRenderer, config: ExecutorConfig) -> Self {
        Self { tool, renderer, config }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Process `issue` in `workspace`, writing artifacts as it goes.
    ///
    /// Never fails: every error becomes a failure outcome.
    pub async fn run(&self, workspace: &Workspace, issue: &Issue, artifacts: &RunArtifacts) -> RunReport {
        let report = self.attempt(workspace, issue, artifacts).await;

        let patch = workspace_patch(workspace).await;
        if let Err(e) = artifacts.write_patch(&patch) {
            warn!("could not write patch issue={}: {}", issue.number, e);
        }

        info!(
            "attempt finished issue={} outcome={} run_dir={}",
            issue.number,
            report.outcome.kind(),
            artifacts.dir().display()
        );
        report
    }

    async fn attempt(&self, workspace: &Workspace, issue: &Issue, artifacts: &RunArtifacts) -> RunReport {
        let conventions = load_conventions(&self.config.repo_root, &self.config.conventions_files);
        let prompt = match self.renderer.render(issue, &conventions) {
            Ok(prompt) => prompt,
            Err(e) => return RunReport::infrastructure(format!("prompt rendering failed: {}", e)),
        };
        if let Err(e) = artifacts.write_prompt(&prompt) {
            return RunReport::infrastructure(format!("could not write run artifacts: {}", e));
        }

        let invocation = match self.tool.invoke(&prompt, &workspace.path, self.config.timeout).await {
            Ok(invocation) => invocation,
            Err(ToolError::Timeout { after, stdout, stderr }) => {
                write_logs(artifacts, &stdout, &stderr);
                error!("tool timeout issue={} timeout_secs={}", issue.number, after.as_secs());
                return RunReport::infrastructure(format!("tool timed out after {}s", after.as_secs()));
            }
            Err(e) => {
                write_logs(artifacts, "", "");
                error!("tool could not run issue={}: {}", issue.number, e);
                return RunReport::infrastructure(e.to_string());
            }
        };
        write_logs(artifacts, &invocation.stdout, &invocation.stderr);

        if !invocation.success() {
            error!(
                "tool failed issue={} exit_code={:?}",
                issue.number, invocation.exit_code
            );
            return RunReport {
                outcome: RunOutcome::ToolFailed {
                    exit_code: invocation.exit_code,
                    error: failure_detail(&invocation),
                },
                exit_code: invocation.exit_code,
            };
        }

        let outcome = match self.finalize(workspace, issue).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("finalizing changes failed issue={}: {}", issue.number, e);
                RunOutcome::infrastructure(e.to_string())
            }
        };
        RunReport {
            outcome,
            exit_code: invocation.exit_code,
        }
    }

    /// Commit and push whatever the tool changed.
    async fn finalize(&self, workspace: &Workspace, issue: &Issue) -> Result<RunOutcome> {
        let path = &workspace.path;
        let dirty = !run_git(path, &["status", "--porcelain"]).await?.is_empty();
        let head = run_git(path, &["rev-parse", "HEAD"]).await?;

        if !dirty && head == workspace.base_sha {
            info!("no changes after tool issue={}", issue.number);
            return Ok(RunOutcome::NoChangeNeeded);
        }

        if dirty {
            run_git(path, &["add", "-A"]).await?;
            let message = format!("Fix #{}: {}", issue.number, short_title(&issue.title));
            run_git(path, &["commit", "-m", &message]).await?;
        }

        let head_sha = run_git(path, &["rev-parse", "HEAD"]).await?;
        let range = format!("{}..{}", workspace.base_sha, head_sha);
        if run_git(path, &["diff", "--name-only", &range]).await?.is_empty() {
            info!("commits cancel out against base issue={}", issue.number);
            return Ok(RunOutcome::NoChangeNeeded);
        }
        let diff_summary = run_git(path, &["diff", "--stat", &range]).await?;

        if self.config.push {
            // The branch belongs to this issue; an earlier attempt may have pushed it
            run_git(
                path,
                &["push", "--force", "-u", &self.config.remote, &workspace.branch],
            )
            .await?;
            info!(
                "pushed branch issue={} branch={} head_sha={}",
                issue.number, workspace.branch, head_sha
            );
        }

        Ok(RunOutcome::ChangesProduced { head_sha, diff_summary })
    }
}

fn write_logs(artifacts: &RunArtifacts, stdout: &str, stderr: &str) {
    if let Err(e) = artifacts.write_tool_output(stdout, stderr) {
        warn!("could not write tool output to {}: {}", artifacts.dir().display(), e);
    }
}

/// Diff of the workspace against its base, new files included; empty when unavailable.
///
/// Stages everything first, so only call it once the workspace is done with.
async fn workspace_patch(workspace: &Workspace) -> String {
    if !workspace.path.exists() {
        return String::new();
    }
    if let Err(e) = run_git(&workspace.path, &["add", "-A"]).await {
        warn!("could not stage workspace for patch path={}: {}", workspace.path.display(), e);
    }
    run_git(&workspace.path, &["diff", "--cached", &workspace.base_sha])
        .await
        .unwrap_or_default()
}

/// Error text for a non-zero exit: the exit code plus the tail of the output.
fn failure_detail(invocation: &ToolInvocation) -> String {
    let head = match invocation.exit_code {
        Some(code) => format!("tool exited with code {}", code),
        None => "tool terminated by signal".to_string(),
    };
    let source = if invocation.stderr.trim().is_empty() {
        &invocation.stdout
    } else {
        &invocation.stderr
    };
    let tail = tail(source);
    if tail.is_empty() { head } else { format!("{}: {}", head, tail) }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let joined = lines[start..].join("\n");
    let count = joined.chars().count();
    if count <= TAIL_CHARS {
        joined
    } else {
        joined.chars().skip(count - TAIL_CHARS).collect()
    }
}

/// Single-line title for commit subjects.
pub fn short_title(title: &str) -> String {
    let clean = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.chars().count() <= TITLE_MAX {
        return clean;
    }
    let cut: String = clean.chars().take(TITLE_MAX - 3).collect();
    format!("{}...", cut.trim_end())
}
