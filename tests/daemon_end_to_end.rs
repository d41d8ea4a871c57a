//! End-to-end daemon tests
//!
//! Drives the claim/process/release loop against a real git repository with
//! a bare origin, an in-memory issue source and a scripted generation tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scryer::daemon::{CycleResult, Daemon, DaemonConfig, RetryPolicy};
use scryer::domain::{Issue, IssueSummary, OutcomeKind, PrReference, Publication};
use scryer::error::{Result, ScryerError};
use scryer::executor::artifacts::SUMMARY_FILE;
use scryer::executor::{Executor, ExecutorConfig, GenerationTool, ToolError, ToolInvocation};
use scryer::github::IssueSource;
use scryer::prompt::PromptRenderer;
use scryer::store::{ItemStatus, ManualClock, WorkStore};
use scryer::workspace::{WorkspaceConfig, WorkspaceManager};
use tempfile::TempDir;
use tokio::sync::watch;

const LABEL: &str = "enhancement";

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn issue(number: u64, title: &str, labels: &[&str]) -> Issue {
    Issue {
        number,
        title: title.to_string(),
        body: Some(format!("Body of issue {}", number)),
        url: Some(format!("https://github.com/acme/widgets/issues/{}", number)),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        state: "OPEN".to_string(),
        updated_at: Some(format!("2026-01-{:02}T00:00:00Z", number.min(28))),
    }
}

/// In-memory issue source that records publications
#[derive(Default)]
struct FakeSource {
    issues: Mutex<BTreeMap<u64, Issue>>,
    publications: Mutex<Vec<Publication>>,
    fail_publish: AtomicBool,
    fail_list: AtomicBool,
    /// Slow publish: advance this clock in steps and let a rival try to claim
    slow_publish: Option<(ManualClock, PathBuf)>,
    rival_claims: Mutex<Vec<bool>>,
}

impl FakeSource {
    fn with_issues(issues: Vec<Issue>) -> Self {
        let source = Self::default();
        {
            let mut map = source.issues.lock().unwrap();
            for issue in issues {
                map.insert(issue.number, issue);
            }
        }
        source
    }

    fn publications(&self) -> Vec<Publication> {
        self.publications.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueSource for FakeSource {
    async fn list_candidates(&self, label: &str) -> Result<Vec<IssueSummary>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ScryerError::GitHub("API rate limit exceeded".to_string()));
        }
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.is_open() && i.has_label(label))
            .map(Issue::summary)
            .collect())
    }

    async fn view_issue(&self, id: u64) -> Result<Issue> {
        self.issues
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ScryerError::GitHub(format!("issue {} not found", id)))
    }

    async fn publish_result(&self, issue: &Issue, publication: &Publication) -> Result<PrReference> {
        self.publications.lock().unwrap().push(publication.clone());
        if let Some((clock, db_path)) = &self.slow_publish {
            let rival = WorkStore::open_with_clock(db_path, Arc::new(clock.clone())).unwrap();
            for _ in 0..4 {
                clock.advance(chrono::Duration::milliseconds(200));
                tokio::time::sleep(Duration::from_millis(250)).await;
                let won = rival
                    .claim(&[issue.number], "daemon-b", chrono::Duration::seconds(60))
                    .unwrap()
                    .is_some();
                self.rival_claims.lock().unwrap().push(won);
            }
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ScryerError::GitHub("pull request create failed".to_string()));
        }
        Ok(PrReference {
            number: Some(1000 + issue.number),
            url: format!("https://github.com/acme/widgets/pull/{}", 1000 + issue.number),
            created: true,
        })
    }
}

enum Behavior {
    /// Write a file into the workspace and exit 0
    Write(&'static str),
    /// Exit with the given code
    Exit(i32),
    /// Never return
    Hang,
}

struct ScriptedTool {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTool {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl GenerationTool for ScriptedTool {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, prompt: &str, workspace: &Path, _timeout: Duration) -> std::result::Result<ToolInvocation, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let exit_code = match &self.behavior {
            Behavior::Write(file) => {
                std::fs::write(workspace.join(file), "generated\n")?;
                0
            }
            Behavior::Exit(code) => *code,
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                0
            }
        };
        Ok(ToolInvocation {
            exit_code: Some(exit_code),
            stdout: "working\n".to_string(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "compilation failed\n".to_string()
            },
            elapsed: Duration::from_millis(5),
        })
    }
}

/// Repository, origin and state directories for one test
struct Harness {
    _temp: TempDir,
    repo: PathBuf,
    origin: PathBuf,
    workspaces_dir: PathBuf,
    runs_dir: PathBuf,
    db_path: PathBuf,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir(&repo).unwrap();

        git(temp.path(), &["init", "--bare", origin.to_str().unwrap()]);
        git(&repo, &["init"]);
        git(&repo, &["config", "user.email", "test@test.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Widgets").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "Initial commit"]);
        git(&repo, &["branch", "-M", "main"]);
        git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&repo, &["push", "-u", "origin", "main"]);

        Self {
            workspaces_dir: temp.path().join("worktrees"),
            runs_dir: temp.path().join("runs"),
            db_path: temp.path().join("state").join("test.db"),
            clock: ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
            _temp: temp,
            repo,
            origin,
        }
    }

    fn config(&self) -> DaemonConfig {
        DaemonConfig {
            label: LABEL.to_string(),
            skip_labels: vec!["wontfix".to_string(), "blocked".to_string()],
            lease_duration: chrono::Duration::seconds(60),
            poll_interval: Duration::from_millis(50),
            recover_interval: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(1),
            max_issues_per_day: 100,
            base_branch: "main".to_string(),
            draft_pr: true,
            runs_dir: self.runs_dir.clone(),
            policy: RetryPolicy {
                max_attempts: 3,
                max_infra_retries: 5,
            },
        }
    }

    fn store(&self) -> WorkStore {
        WorkStore::open_with_clock(&self.db_path, Arc::new(self.clock.clone())).unwrap()
    }

    fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(WorkspaceConfig {
            repo_root: self.repo.clone(),
            workspaces_dir: self.workspaces_dir.clone(),
            base_branch: "main".to_string(),
            branch_prefix: "codex".to_string(),
        })
    }

    fn daemon_with(
        &self,
        config: DaemonConfig,
        source: FakeSource,
        tool: ScriptedTool,
        shutdown: watch::Receiver<bool>,
    ) -> Daemon<FakeSource, ScriptedTool> {
        let executor = Executor::new(
            tool,
            PromptRenderer::new().unwrap(),
            ExecutorConfig {
                repo_root: self.repo.clone(),
                remote: "origin".to_string(),
                push: true,
                timeout: Duration::from_secs(30),
                conventions_files: vec!["README.md".to_string()],
            },
        );
        Daemon::new(config, self.store(), source, self.workspaces(), executor, shutdown).with_owner("daemon-a")
    }

    fn daemon(&self, source: FakeSource, tool: ScriptedTool) -> (Daemon<FakeSource, ScriptedTool>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (self.daemon_with(self.config(), source, tool, rx), tx)
    }

    fn workspace_path(&self, id: u64) -> PathBuf {
        self.workspaces_dir.join(format!("issue-{}", id))
    }

    fn origin_has_branch(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.origin)
            .output()
            .unwrap()
            .status
            .success()
    }
}

fn processed(result: &CycleResult) -> (u64, ItemStatus, Option<OutcomeKind>) {
    match result {
        CycleResult::Processed { id, status, outcome } => (*id, *status, *outcome),
        other => panic!("expected a processed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_changes_produced_publishes_and_completes() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(42, "Add a widget counter", &[LABEL])]);
    let tool = ScriptedTool::new(Behavior::Write("counter.txt"));
    let prompts = tool.prompts.clone();
    let (mut daemon, _tx) = h.daemon(source, tool);

    let result = daemon.run_cycle().await.unwrap();
    let (id, status, outcome) = processed(&result);
    assert_eq!(id, 42);
    assert_eq!(status, ItemStatus::Done);
    assert_eq!(outcome, Some(OutcomeKind::ChangesProduced));

    let publications = daemon.source().publications();
    assert_eq!(publications.len(), 1);
    assert_eq!(publications[0].branch, "codex/issue-42");
    assert_eq!(publications[0].base_branch, "main");
    assert!(publications[0].draft);

    let item = daemon.store().get(42).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Done);
    assert_eq!(item.pr_url.as_deref(), Some("https://github.com/acme/widgets/pull/1042"));
    assert_eq!(item.branch.as_deref(), Some("codex/issue-42"));
    assert!(item.lease_owner.is_none());
    assert!(item.head_sha.is_some());

    assert!(!h.workspace_path(42).exists());
    assert!(h.origin_has_branch("codex/issue-42"));

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Add a widget counter"));
    assert!(prompts[0].contains("### README.md"));

    let run_dir = PathBuf::from(item.last_run_dir.unwrap());
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
    assert_eq!(summary["issue_id"], 42);
    assert_eq!(summary["status"], "done");

    assert_eq!(daemon.store().daily_done_count("2026-03-01").unwrap(), 1);
}

#[tokio::test]
async fn test_publish_failure_is_infrastructure_and_cleans_workspace() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(5, "Tweak docs", &[LABEL])]);
    source.fail_publish.store(true, Ordering::SeqCst);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("docs.md")));

    let result = daemon.run_cycle().await.unwrap();
    let (_, status, outcome) = processed(&result);
    assert_eq!(status, ItemStatus::Pending);
    assert_eq!(outcome, Some(OutcomeKind::InfrastructureFailed));
    assert_eq!(daemon.source().publications().len(), 1);

    let item = daemon.store().get(5).unwrap().unwrap();
    assert_eq!(item.infra_failures, 1);
    assert!(item.last_error.unwrap().starts_with("publish failed"));
    assert!(!h.workspace_path(5).exists());
    // The branch was pushed before publishing
    assert!(h.origin_has_branch("codex/issue-5"));
}

#[tokio::test]
async fn test_repeated_tool_failures_need_attention() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(7, "Fix the parser", &[LABEL])]);
    let tool = ScriptedTool::new(Behavior::Exit(2));
    let calls = tool.calls.clone();
    let (mut daemon, _tx) = h.daemon(source, tool);

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let result = daemon.run_cycle().await.unwrap();
        statuses.push(processed(&result).1);
    }
    assert_eq!(
        statuses,
        vec![ItemStatus::Pending, ItemStatus::Pending, ItemStatus::NeedsAttention]
    );

    let item = daemon.store().get(7).unwrap().unwrap();
    assert_eq!(item.tool_failures, 3);
    assert_eq!(item.attempt_count, 3);
    let error = item.last_error.unwrap();
    assert!(error.contains("exited with code 2"), "{}", error);
    assert!(error.contains("compilation failed"), "{}", error);

    // Excluded from discovery from now on
    assert_eq!(daemon.run_cycle().await.unwrap(), CycleResult::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!h.workspace_path(7).exists());
}

#[tokio::test]
async fn test_no_change_needed() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(3, "Already done", &[LABEL])]);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Exit(0)));

    let result = daemon.run_cycle().await.unwrap();
    let (_, status, outcome) = processed(&result);
    assert_eq!(status, ItemStatus::NoChange);
    assert_eq!(outcome, Some(OutcomeKind::NoChangeNeeded));
    assert!(daemon.source().publications().is_empty());
    assert!(!h.origin_has_branch("codex/issue-3"));
    assert_eq!(daemon.store().daily_done_count("2026-03-01").unwrap(), 0);
}

#[tokio::test]
async fn test_skip_label_and_closed_issue_are_skipped() {
    let h = Harness::new();
    let mut closed = issue(9, "Closed meanwhile", &[LABEL]);
    closed.state = "CLOSED".to_string();
    let source = FakeSource::with_issues(vec![issue(8, "Blocked work", &[LABEL, "blocked"]), closed]);
    let tool = ScriptedTool::new(Behavior::Write("never.txt"));
    let calls = tool.calls.clone();
    let (mut daemon, _tx) = h.daemon(source, tool);

    let result = daemon.run_cycle().await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Skipped);
    let item = daemon.store().get(8).unwrap().unwrap();
    assert_eq!(item.last_error.as_deref(), Some("contains skip label(s): blocked"));

    // Closed issues are not listed, but an explicit request re-reads them
    let result = daemon.run_single(9).await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Skipped);
    let item = daemon.store().get(9).unwrap().unwrap();
    assert_eq!(item.last_error.as_deref(), Some("issue is no longer open"));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_run_single_claim_conflict() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(11, "Held elsewhere", &[LABEL])]);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("x.txt")));

    // Another instance holds a live lease
    let other = h.store();
    other.upsert_issues(&[issue(11, "Held elsewhere", &[LABEL]).summary()]).unwrap();
    assert!(other.claim(&[11], "daemon-b", chrono::Duration::seconds(60)).unwrap().is_some());

    let err = daemon.run_single(11).await.unwrap_err();
    assert!(matches!(err, ScryerError::ClaimConflict(11)));
    assert!(err.is_benign());

    let item = daemon.store().get(11).unwrap().unwrap();
    assert!(item.is_held_by("daemon-b"));
}

#[tokio::test]
async fn test_run_single_syncs_unknown_issue() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(21, "Not yet polled", &[LABEL])]);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("feature.txt")));

    assert!(daemon.store().get(21).unwrap().is_none());
    let result = daemon.run_single(21).await.unwrap();
    assert_eq!(processed(&result), (21, ItemStatus::Done, Some(OutcomeKind::ChangesProduced)));
}

#[tokio::test]
async fn test_daily_limit_stops_discovery() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(1, "First", &[LABEL]), issue(2, "Second", &[LABEL])]);
    let mut config = h.config();
    config.max_issues_per_day = 1;
    let (_tx, rx) = watch::channel(false);
    let mut daemon = h.daemon_with(config, source, ScriptedTool::new(Behavior::Write("f.txt")), rx);

    let result = daemon.run_cycle().await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Done);
    assert_eq!(daemon.run_cycle().await.unwrap(), CycleResult::Limited);

    // Single-item mode ignores the limit
    let remaining = if processed(&result).0 == 1 { 2 } else { 1 };
    let result = daemon.run_single(remaining).await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Done);

    // A new day resets the counter
    h.clock.advance(chrono::Duration::days(1));
    assert_eq!(daemon.run_cycle().await.unwrap(), CycleResult::Idle);
}

#[tokio::test]
async fn test_crash_recovery_reclaims_lease_and_workspace() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(42, "Survive a crash", &[LABEL])]);

    // A previous instance claimed 42, created its workspace and died
    let crashed = h.store();
    crashed.upsert_issues(&[issue(42, "Survive a crash", &[LABEL]).summary()]).unwrap();
    crashed.claim(&[42], "daemon-dead", chrono::Duration::seconds(60)).unwrap().unwrap();
    h.workspaces().acquire(42).await.unwrap();
    assert!(h.workspace_path(42).exists());

    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("fix.txt")));

    // Lease still live: nothing to do, workspace kept
    let report = daemon.recover().await.unwrap();
    assert!(report.is_empty());
    assert!(h.workspace_path(42).exists());
    assert_eq!(daemon.run_cycle().await.unwrap(), CycleResult::Idle);

    h.clock.advance(chrono::Duration::seconds(61));
    let report = daemon.recover().await.unwrap();
    assert_eq!(report.reclaimed, vec![42]);
    assert_eq!(report.removed, vec![h.workspace_path(42)]);
    let item = daemon.store().get(42).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.last_error.as_deref(), Some("lease expired (held by daemon-dead)"));
    assert_eq!(item.infra_failures, 1);

    let result = daemon.run_cycle().await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Done);
    let item = daemon.store().get(42).unwrap().unwrap();
    assert_eq!(item.attempt_count, 2);
    assert_eq!(item.infra_failures, 0);
}

#[tokio::test]
async fn test_crash_loop_ends_in_needs_attention() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(66, "Kills every host", &[LABEL])]);
    let tool = ScriptedTool::new(Behavior::Write("never.txt"));
    let calls = tool.calls.clone();
    let (mut daemon, _tx) = h.daemon(source, tool);

    // Each holder dies mid-run and never releases
    let crashing = h.store();
    crashing.upsert_issues(&[issue(66, "Kills every host", &[LABEL]).summary()]).unwrap();
    for round in 1..=5 {
        let owner = format!("daemon-dead-{}", round);
        let claimed = crashing.claim(&[66], &owner, chrono::Duration::seconds(60)).unwrap();
        assert!(claimed.is_some(), "round {} should still claim", round);
        h.clock.advance(chrono::Duration::seconds(61));
        let report = daemon.recover().await.unwrap();
        assert_eq!(report.reclaimed, vec![66]);
    }

    let item = daemon.store().get(66).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::NeedsAttention);
    assert_eq!(item.infra_failures, 5);
    assert_eq!(item.attempt_count, 5);
    assert_eq!(item.last_outcome, Some(OutcomeKind::InfrastructureFailed));

    assert_eq!(daemon.run_cycle().await.unwrap(), CycleResult::Idle);
    assert!(crashing.claim(&[66], "daemon-dead-6", chrono::Duration::seconds(60)).unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_startup_recovery_failure_does_not_stop_daemon() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(31, "Recover later", &[LABEL])]);
    let (mut daemon, tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("later.txt")));

    // Without its git dir the repository cannot list worktrees
    let git_dir = h.repo.join(".git");
    let parked_git_dir = h.repo.join("git-moved-away");
    std::fs::rename(&git_dir, &parked_git_dir).unwrap();

    let observer = h.store();
    let repair_then_stop = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::rename(&parked_git_dir, &git_dir).unwrap();
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let done = observer
                .get(31)
                .unwrap()
                .is_some_and(|item| item.status == ItemStatus::Done);
            if done {
                break;
            }
        }
        tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(daemon.run(), repair_then_stop);

    result.unwrap();
    assert_eq!(observer.get(31).unwrap().unwrap().status, ItemStatus::Done);
}

#[tokio::test]
async fn test_lease_is_renewed_while_publishing() {
    let h = Harness::new();
    let mut source = FakeSource::with_issues(vec![issue(52, "Slow pull request", &[LABEL])]);
    source.slow_publish = Some((h.clock.clone(), h.db_path.clone()));

    let mut config = h.config();
    config.lease_duration = chrono::Duration::milliseconds(300);
    let (_tx, rx) = watch::channel(false);
    let mut daemon = h.daemon_with(config, source, ScriptedTool::new(Behavior::Write("slow.txt")), rx);

    let result = daemon.run_cycle().await.unwrap();
    assert_eq!(processed(&result).1, ItemStatus::Done);

    // Publishing outlived the original lease twice over; no rival got in
    let rivals = daemon.source().rival_claims.lock().unwrap().clone();
    assert_eq!(rivals, vec![false; 4]);
    let item = daemon.store().get(52).unwrap().unwrap();
    assert_eq!(item.pr_url.as_deref(), Some("https://github.com/acme/widgets/pull/1052"));
    assert_eq!(item.attempt_count, 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_run() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(13, "Takes forever", &[LABEL])]);
    let (mut daemon, tx) = h.daemon(source, ScriptedTool::new(Behavior::Hang));
    daemon.recover().await.unwrap();

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(daemon.run_cycle(), stopper);

    let (_, status, outcome) = processed(&result.unwrap());
    assert_eq!(status, ItemStatus::Pending);
    assert_eq!(outcome, Some(OutcomeKind::InfrastructureFailed));
    assert!(daemon.shutdown_requested());

    let item = daemon.store().get(13).unwrap().unwrap();
    assert_eq!(item.last_error.as_deref(), Some("interrupted by shutdown"));
    assert!(item.lease_owner.is_none());
    assert!(!h.workspace_path(13).exists());
}

#[tokio::test]
async fn test_lease_lost_abandons_run_without_recording() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(17, "Slow work", &[LABEL])]);
    let mut config = h.config();
    config.lease_duration = chrono::Duration::milliseconds(300);
    let (_tx, rx) = watch::channel(false);
    let mut daemon = h.daemon_with(config, source, ScriptedTool::new(Behavior::Hang), rx);
    daemon.recover().await.unwrap();

    let thief = h.store();
    let steal = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.clock.advance(chrono::Duration::seconds(5));
        thief.claim(&[17], "daemon-b", chrono::Duration::seconds(60)).unwrap()
    };
    let (result, stolen) = tokio::join!(daemon.run_cycle(), steal);

    assert!(stolen.is_some());
    assert_eq!(result.unwrap(), CycleResult::Abandoned { id: 17 });

    let item = thief.get(17).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Running);
    assert!(item.is_held_by("daemon-b"));
    assert!(item.last_outcome.is_none());
    assert!(!h.workspace_path(17).exists());
}

#[tokio::test]
async fn test_counts_sum_to_tracked_items() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![
        issue(1, "One", &[LABEL]),
        issue(2, "Two", &[LABEL]),
        issue(3, "Three", &[LABEL, "wontfix"]),
        issue(4, "Four", &[LABEL]),
    ]);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("out.txt")));

    // Three cycles: four items tracked, three released
    for _ in 0..3 {
        daemon.run_cycle().await.unwrap();
    }

    let counts = daemon.store().counts_by_status().unwrap();
    assert_eq!(counts.values().sum::<usize>(), 4);
    assert_eq!(counts.get(&ItemStatus::Skipped), Some(&1));
    assert_eq!(counts.get(&ItemStatus::Done), Some(&2));
    assert_eq!(counts.get(&ItemStatus::Pending), Some(&1));
}

#[tokio::test]
async fn test_github_failure_propagates_from_cycle() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(1, "One", &[LABEL])]);
    source.fail_list.store(true, Ordering::SeqCst);
    let (mut daemon, _tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("out.txt")));

    let err = daemon.run_cycle().await.unwrap_err();
    assert!(matches!(err, ScryerError::GitHub(_)));
    assert!(daemon.store().get(1).unwrap().is_none());
}

#[tokio::test]
async fn test_continuous_run_until_shutdown() {
    let h = Harness::new();
    let source = FakeSource::with_issues(vec![issue(30, "Loop me", &[LABEL])]);
    let (mut daemon, tx) = h.daemon(source, ScriptedTool::new(Behavior::Write("loop.txt")));

    let observer = h.store();
    let stopper = async {
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let done = observer
                .get(30)
                .unwrap()
                .is_some_and(|item| item.status == ItemStatus::Done);
            if done {
                break;
            }
        }
        tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(daemon.run(), stopper);

    result.unwrap();
    assert_eq!(observer.get(30).unwrap().unwrap().status, ItemStatus::Done);
    assert_eq!(daemon.source().publications().len(), 1);
}
