use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::daemon::{DaemonConfig, RetryPolicy};
use crate::executor::{CommandTool, ExecutorConfig};
use crate::github::GhConfig;
use crate::workspace::{WorkspaceConfig, git};

/// Upper bound for every configured interval: one week
const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub github: GithubConfig,
    pub git: GitConfig,
    pub lease: LeaseConfig,
    pub daemon: PollingConfig,
    pub tool: ToolConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub label: String,
    pub skip_labels: Vec<String>,
    pub repo: Option<String>,
    pub draft_pr: bool,
    pub comment_on_success: bool,
    pub list_limit: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            label: "enhancement".to_string(),
            skip_labels: vec!["wontfix".to_string(), "blocked".to_string()],
            repo: None,
            draft_pr: true,
            comment_on_success: false,
            list_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub remote: String,
    pub branch_prefix: String,
    pub push: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            branch_prefix: "codex".to_string(),
            push: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub max_infra_retries: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_secs: 2400,
            max_attempts: 3,
            max_infra_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_interval_secs: u64,
    pub recover_interval_secs: u64,
    pub max_issues_per_day: u32,
    pub max_backoff_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            recover_interval_secs: 300,
            max_issues_per_day: 10,
            max_backoff_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub conventions_files: Vec<String>,
    pub prompt_template: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["exec".to_string()],
            model: None,
            timeout_secs: 900,
            heartbeat_secs: 20,
            conventions_files: vec![
                "AGENTS.md".to_string(),
                "CONTRIBUTING.md".to_string(),
                "README.md".to_string(),
            ],
            prompt_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub workdir: PathBuf,
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workdir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("scryer"),
            db_path: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject intervals too large to turn into timers and lease deadlines
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("lease.lease_secs", self.lease.lease_secs),
            ("daemon.poll_interval_secs", self.daemon.poll_interval_secs),
            ("daemon.recover_interval_secs", self.daemon.recover_interval_secs),
            ("daemon.max_backoff_secs", self.daemon.max_backoff_secs),
            ("tool.timeout_secs", self.tool.timeout_secs),
            ("tool.heartbeat_secs", self.tool.heartbeat_secs),
        ];
        for (key, secs) in intervals {
            if secs > MAX_INTERVAL_SECS {
                eyre::bail!("{} is {} seconds; the maximum is {}", key, secs, MAX_INTERVAL_SECS);
            }
        }
        Ok(())
    }

    fn load_file(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `SCRYER_*` overrides; `lookup` abstracts the environment for tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| eyre::eyre!("Invalid value for {}: {:?} ({})", key, value, e))
        }

        if let Some(v) = lookup("SCRYER_LABEL") {
            self.github.label = v;
        }
        if let Some(v) = lookup("SCRYER_POLL_INTERVAL_SECS") {
            self.daemon.poll_interval_secs = parsed("SCRYER_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("SCRYER_LEASE_SECS") {
            self.lease.lease_secs = parsed("SCRYER_LEASE_SECS", &v)?;
        }
        if let Some(v) = lookup("SCRYER_MAX_ATTEMPTS") {
            self.lease.max_attempts = parsed("SCRYER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SCRYER_TOOL_COMMAND") {
            self.tool.command = v;
        }
        if let Some(v) = lookup("SCRYER_TOOL_TIMEOUT_SECS") {
            self.tool.timeout_secs = parsed("SCRYER_TOOL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SCRYER_WORKDIR") {
            self.storage.workdir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCRYER_BASE_BRANCH") {
            self.git.base_branch = v;
        }
        Ok(())
    }

    /// Resolve the per-repository layout for `repo_root`
    pub async fn layout(&self, repo_root: &Path) -> Result<RepoLayout> {
        let namespace = derive_namespace(repo_root).await?;
        Ok(RepoLayout::new(self, repo_root, namespace))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.lease.max_attempts.max(1),
            max_infra_retries: self.lease.max_infra_retries.max(1),
        }
    }

    pub fn daemon_config(&self, layout: &RepoLayout) -> DaemonConfig {
        DaemonConfig {
            label: self.github.label.clone(),
            skip_labels: self.github.skip_labels.clone(),
            lease_duration: chrono::Duration::seconds(bounded_secs(self.lease.lease_secs)),
            poll_interval: Duration::from_secs(self.daemon.poll_interval_secs.max(1)),
            recover_interval: Duration::from_secs(self.daemon.recover_interval_secs),
            max_backoff: Duration::from_secs(self.daemon.max_backoff_secs.max(1)),
            max_issues_per_day: self.daemon.max_issues_per_day,
            base_branch: self.git.base_branch.clone(),
            draft_pr: self.github.draft_pr,
            runs_dir: layout.runs_dir.clone(),
            policy: self.retry_policy(),
        }
    }

    pub fn executor_config(&self, layout: &RepoLayout) -> ExecutorConfig {
        ExecutorConfig {
            repo_root: layout.repo_root.clone(),
            remote: self.git.remote.clone(),
            push: self.git.push,
            timeout: Duration::from_secs(self.tool.timeout_secs.max(1)),
            conventions_files: self.tool.conventions_files.clone(),
        }
    }

    pub fn gh_config(&self, layout: &RepoLayout) -> GhConfig {
        GhConfig {
            repo: self.github.repo.clone(),
            cwd: layout.repo_root.clone(),
            comment_on_success: self.github.comment_on_success,
            list_limit: self.github.list_limit,
        }
    }

    pub fn workspace_config(&self, layout: &RepoLayout) -> WorkspaceConfig {
        WorkspaceConfig {
            repo_root: layout.repo_root.clone(),
            workspaces_dir: layout.workspaces_dir.clone(),
            base_branch: self.git.base_branch.clone(),
            branch_prefix: self.git.branch_prefix.clone(),
        }
    }

    pub fn command_tool(&self) -> CommandTool {
        CommandTool::new(self.tool.command.clone(), self.tool.args.clone())
            .with_model(self.tool.model.clone())
            .with_heartbeat(Duration::from_secs(self.tool.heartbeat_secs.max(1)))
    }
}

/// Where one repository's state lives under the workdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    pub repo_root: PathBuf,
    pub namespace: String,
    pub workspaces_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub db_path: PathBuf,
}

impl RepoLayout {
    pub fn new(config: &Config, repo_root: &Path, namespace: String) -> Self {
        let workdir = &config.storage.workdir;
        let db_path = config
            .storage
            .db_path
            .clone()
            .unwrap_or_else(|| workdir.join("state").join(format!("{}.db", namespace)));
        Self {
            repo_root: repo_root.to_path_buf(),
            workspaces_dir: workdir.join("worktrees").join(&namespace),
            runs_dir: workdir.join("runs").join(&namespace),
            db_path,
            namespace,
        }
    }

    /// Create the workspace, runs and state directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.workspaces_dir, &self.runs_dir] {
            fs::create_dir_all(dir).context(format!("Failed to create {}", dir.display()))?;
        }
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

/// Namespace from the origin remote, else directory name plus a path hash
pub async fn derive_namespace(repo_root: &Path) -> Result<String> {
    if let Ok(url) = git::run_git(repo_root, &["remote", "get-url", "origin"]).await
        && let Some((host, owner, repo)) = parse_remote_slug(&url)
    {
        return Ok(format!(
            "{}-{}-{}",
            sanitize(&host, "host"),
            sanitize(&owner, "owner"),
            sanitize(&repo, "repo")
        ));
    }

    let canonical = repo_root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", repo_root.display()))?;
    let name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());

    Ok(format!("{}-{}", sanitize(&name, "repo"), &digest[..12]))
}

/// Split a git remote URL into (host, owner, repo)
pub fn parse_remote_slug(url: &str) -> Option<(String, String, String)> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let (host, path) = if let Some((_, rest)) = url.split_once("://") {
        let (authority, path) = rest.split_once('/')?;
        let host = authority.rsplit('@').next()?;
        let host = host.split(':').next()?;
        (host.to_string(), path.to_string())
    } else {
        // scp-like: [user@]host:owner/repo
        let (authority, path) = url.split_once(':')?;
        let host = authority.rsplit('@').next()?;
        (host.to_string(), path.to_string())
    };

    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }
    let owner = parts[parts.len() - 2];
    let repo = parts[parts.len() - 1];
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if host.is_empty() || owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((host, owner.to_string(), repo.to_string()))
}

/// Seconds clamped to `1..=MAX_INTERVAL_SECS` as a chrono-compatible count
fn bounded_secs(secs: u64) -> i64 {
    i64::try_from(secs.clamp(1, MAX_INTERVAL_SECS)).unwrap_or(i64::MAX)
}

fn sanitize(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
