//! Shared fixtures for unit tests: throwaway repositories with a bare origin.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::executor::{GenerationTool, ToolError, ToolInvocation};
use crate::workspace::{WorkspaceConfig, WorkspaceManager};

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository on `main` with one commit, pushed to a bare `origin`.
pub struct TestRepo {
    pub temp: TempDir,
    pub repo: PathBuf,
    pub origin: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir(&repo).unwrap();

        git(temp.path(), &["init", "--bare", origin.to_str().unwrap()]);
        git(&repo, &["init"]);
        git(&repo, &["config", "user.email", "test@test.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Test").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "Initial commit"]);
        git(&repo, &["branch", "-M", "main"]);
        git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&repo, &["push", "-u", "origin", "main"]);

        Self { temp, repo, origin }
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.temp.path().join("worktrees")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.temp.path().join("runs")
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(WorkspaceConfig {
            repo_root: self.repo.clone(),
            workspaces_dir: self.workspaces_dir(),
            base_branch: "main".to_string(),
            branch_prefix: "codex".to_string(),
        })
    }

    /// Commit sha of `branch` on the bare origin, if pushed.
    pub fn origin_branch_sha(&self, branch: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.origin)
            .output()
            .unwrap();
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

type ToolAction = dyn Fn(&Path) -> Result<ToolInvocation, ToolError> + Send + Sync;

/// Generation tool that runs a closure against the workspace.
pub struct FakeTool {
    action: Box<ToolAction>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeTool {
    pub fn new(action: impl Fn(&Path) -> Result<ToolInvocation, ToolError> + Send + Sync + 'static) -> Self {
        Self {
            action: Box::new(action),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Exits with `code` after writing nothing.
    pub fn exiting(code: i32) -> Self {
        Self::new(move |_| Ok(invocation(code)))
    }

    /// Writes `file` into the workspace and exits 0.
    pub fn writing(file: &'static str, content: &'static str) -> Self {
        Self::new(move |path| {
            std::fs::write(path.join(file), content).unwrap();
            Ok(invocation(0))
        })
    }
}

pub fn invocation(code: i32) -> ToolInvocation {
    ToolInvocation {
        exit_code: Some(code),
        stdout: "working\n".to_string(),
        stderr: if code == 0 { String::new() } else { format!("failed with {}\n", code) },
        elapsed: Duration::from_millis(5),
    }
}

#[async_trait]
impl GenerationTool for FakeTool {
    fn name(&self) -> &str {
        "fake"
    }

    async fn invoke(&self, prompt: &str, workspace: &Path, _timeout: Duration) -> Result<ToolInvocation, ToolError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.action)(workspace)
    }
}
