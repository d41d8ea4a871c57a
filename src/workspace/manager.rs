//! WorkspaceManager handles git worktrees for issue isolation.
//!
//! Every claimed issue is processed in a fresh worktree at
//! `{workspaces_dir}/issue-{id}` on branch `{prefix}/issue-{id}`. Worktrees
//! are never reused. Anything matching the naming convention that has no live
//! lease is garbage and is removed by `sweep_orphans`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Result, ScryerError};
use crate::workspace::git::{path_arg, run_git};

const DIR_PREFIX: &str = "issue-";
const REMOVE_ATTEMPTS: u32 = 4;
const REMOVE_BACKOFF: Duration = Duration::from_millis(250);

/// Configuration for worktree management
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root of the main git repository
    pub repo_root: PathBuf,

    /// Directory holding this repository's worktrees
    pub workspaces_dir: PathBuf,

    /// Branch new worktrees start from
    pub base_branch: String,

    /// Prefix of the per-issue branch
    pub branch_prefix: String,
}

/// A live worktree for one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: u64,
    pub path: PathBuf,
    pub branch: String,
    /// Commit the worktree started from
    pub base_sha: String,
}

/// Parse the issue id out of a worktree directory name.
pub fn parse_workspace_id(name: &str) -> Option<u64> {
    name.strip_prefix(DIR_PREFIX)?.parse().ok()
}

/// Creates and destroys per-issue worktrees.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Worktree path for an issue.
    pub fn path_for(&self, id: u64) -> PathBuf {
        self.config.workspaces_dir.join(format!("{}{}", DIR_PREFIX, id))
    }

    /// Branch name for an issue.
    pub fn branch_for(&self, id: u64) -> String {
        format!("{}/issue-{}", self.config.branch_prefix, id)
    }

    /// Create a fresh worktree for `id` from the base branch.
    ///
    /// Fails with `WorkspaceConflict` if anything already lives at the path,
    /// on disk or in git's worktree registry.
    pub async fn acquire(&self, id: u64) -> Result<Workspace> {
        let path = self.path_for(id);
        let branch = self.branch_for(id);

        if path.exists() || self.registered_worktrees().await?.contains_key(&id) {
            return Err(ScryerError::WorkspaceConflict { id, path });
        }

        tokio::fs::create_dir_all(&self.config.workspaces_dir).await?;

        run_git(
            &self.config.repo_root,
            &[
                "worktree",
                "add",
                "-B",
                &branch,
                path_arg(&path)?,
                &self.config.base_branch,
            ],
        )
        .await?;

        let base_sha = run_git(&path, &["rev-parse", "HEAD"]).await?;
        info!("workspace acquired issue={} path={} base={}", id, path.display(), base_sha);

        Ok(Workspace {
            id,
            path,
            branch,
            base_sha,
        })
    }

    /// Destroy a workspace and its local branch.
    pub async fn release(&self, workspace: &Workspace) -> Result<()> {
        let result = self.remove_worktree(&workspace.path).await;
        self.prune().await;
        self.delete_branch(&workspace.branch).await;
        if result.is_ok() {
            info!("workspace released issue={}", workspace.id);
        }
        result
    }

    /// Remove every workspace whose id is not in `active_ids`.
    ///
    /// Returns the removed paths. Failures on single entries are logged and
    /// skipped; the next sweep tries again.
    pub async fn sweep_orphans(&self, active_ids: &HashSet<u64>) -> Result<Vec<PathBuf>> {
        let mut candidates = self.on_disk_workspaces()?;
        for (id, path) in self.registered_worktrees().await? {
            candidates.entry(id).or_insert(path);
        }

        let mut removed = Vec::new();
        for (id, path) in candidates {
            if active_ids.contains(&id) {
                debug!("sweep keeps live workspace issue={}", id);
                continue;
            }
            match self.remove_worktree(&path).await {
                Ok(()) => {
                    self.delete_branch(&self.branch_for(id)).await;
                    info!("sweep removed orphan workspace issue={} path={}", id, path.display());
                    removed.push(path);
                }
                Err(e) => warn!("sweep could not remove issue={} path={}: {}", id, path.display(), e),
            }
        }

        self.prune().await;
        Ok(removed)
    }

    /// Worktree directories matching the naming convention.
    fn on_disk_workspaces(&self) -> Result<BTreeMap<u64, PathBuf>> {
        let mut found = BTreeMap::new();
        if !self.config.workspaces_dir.is_dir() {
            return Ok(found);
        }

        let dir = path_arg(&self.config.workspaces_dir)?;
        let pattern = format!("{}/{}*", glob::Pattern::escape(dir), DIR_PREFIX);
        let entries = glob::glob(&pattern).map_err(|e| ScryerError::WorkspaceCleanup(e.to_string()))?;

        for entry in entries {
            match entry {
                Ok(path) => {
                    if let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(parse_workspace_id) {
                        found.insert(id, path);
                    }
                }
                Err(e) => warn!("unreadable workspace entry: {}", e),
            }
        }
        Ok(found)
    }

    /// Worktrees git knows about under the workspaces directory.
    async fn registered_worktrees(&self) -> Result<BTreeMap<u64, PathBuf>> {
        let stdout = run_git(&self.config.repo_root, &["worktree", "list", "--porcelain"]).await?;
        let base = canonical(&self.config.workspaces_dir);

        let mut found = BTreeMap::new();
        for line in stdout.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                let path = Path::new(path_str);
                let under_base = path.parent().is_some_and(|p| canonical(p) == base);
                if under_base
                    && let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(parse_workspace_id)
                {
                    found.insert(id, path.to_path_buf());
                }
            }
        }
        Ok(found)
    }

    /// Remove a worktree, falling back to deleting the directory.
    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        if let Err(e) = run_git(
            &self.config.repo_root,
            &["worktree", "remove", "--force", path_arg(path)?],
        )
        .await
        {
            debug!("git worktree remove failed for {}: {}", path.display(), e);
        }

        let mut delay = REMOVE_BACKOFF;
        for attempt in 1..=REMOVE_ATTEMPTS {
            if !path.exists() {
                return Ok(());
            }
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    warn!(
                        "remove attempt {}/{} failed for {}: {}",
                        attempt,
                        REMOVE_ATTEMPTS,
                        path.display(),
                        e
                    );
                    if attempt < REMOVE_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        if path.exists() {
            return Err(ScryerError::WorkspaceCleanup(format!(
                "{} still exists after {} attempts",
                path.display(),
                REMOVE_ATTEMPTS
            )));
        }
        Ok(())
    }

    async fn prune(&self) {
        if let Err(e) = run_git(&self.config.repo_root, &["worktree", "prune"]).await {
            warn!("git worktree prune failed: {}", e);
        }
    }

    /// Branch deletion failure is not fatal (may not exist).
    async fn delete_branch(&self, branch: &str) {
        if let Err(e) = run_git(&self.config.repo_root, &["branch", "-D", branch]).await {
            debug!("branch {} not deleted: {}", branch, e);
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
