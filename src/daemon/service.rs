//! Daemon - the claim/process/release loop.
//!
//! One item per cycle, strictly sequential. The store is the only
//! synchronization point with other processes; everything this process
//! knows about an item between `claim` and `release` is guarded by its owner
//! token.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::daemon::policy::RetryPolicy;
use crate::daemon::recovery::{RecoveryReport, recover};
use crate::daemon::tick::{CycleResult, SleepPlanner};
use crate::domain::{Issue, Publication, RunOutcome};
use crate::error::{Result, ScryerError};
use crate::executor::{Executor, GenerationTool, RunArtifacts, RunReport, RunSummary};
use crate::github::IssueSource;
use crate::id::generate_owner_token;
use crate::store::{ItemStatus, WorkItem, WorkStore};
use crate::workspace::{Workspace, WorkspaceManager};

/// Orchestration settings
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Trigger label
    pub label: String,
    pub skip_labels: Vec<String>,

    pub lease_duration: chrono::Duration,
    pub poll_interval: Duration,
    pub recover_interval: Duration,
    pub max_backoff: Duration,

    /// Items reaching `done` per UTC day; 0 disables discovery
    pub max_issues_per_day: u32,

    pub base_branch: String,
    pub draft_pr: bool,

    /// Root of the per-issue run directories
    pub runs_dir: PathBuf,

    pub policy: RetryPolicy,
}

/// How work under a lease ended
enum Attempt<R> {
    Finished(R),
    LeaseLost,
    Shutdown,
}

/// Orchestrates discovery, claiming, processing and release.
pub struct Daemon<S: IssueSource, T: GenerationTool> {
    config: DaemonConfig,
    store: WorkStore,
    source: S,
    workspaces: WorkspaceManager,
    executor: Executor<T>,
    owner: String,
    shutdown: watch::Receiver<bool>,
    needs_recovery: bool,
    last_recovery: Option<Instant>,
}

impl<S: IssueSource, T: GenerationTool> Daemon<S, T> {
    pub fn new(
        config: DaemonConfig,
        store: WorkStore,
        source: S,
        workspaces: WorkspaceManager,
        executor: Executor<T>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let store = store.with_max_infra_retries(config.policy.max_infra_retries);
        Self {
            config,
            store,
            source,
            workspaces,
            executor,
            owner: generate_owner_token(),
            shutdown,
            needs_recovery: true,
            last_recovery: None,
        }
    }

    /// Replace the generated owner token.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &WorkStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn executor(&self) -> &Executor<T> {
        &self.executor
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Reclaim expired leases and sweep orphaned workspaces.
    pub async fn recover(&mut self) -> Result<RecoveryReport> {
        let report = recover(&self.store, &self.workspaces).await?;
        self.needs_recovery = false;
        self.last_recovery = Some(Instant::now());
        Ok(report)
    }

    fn recovery_due(&self) -> bool {
        self.needs_recovery
            || self
                .last_recovery
                .is_none_or(|at| at.elapsed() >= self.config.recover_interval)
    }

    fn today(&self) -> String {
        self.store.now().format("%Y-%m-%d").to_string()
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "daemon started owner={} label={} poll_interval_secs={} lease_secs={} max_attempts={}",
            self.owner,
            self.config.label,
            self.config.poll_interval.as_secs(),
            self.config.lease_duration.num_seconds(),
            self.config.policy.max_attempts
        );
        if let Err(e) = self.recover().await {
            if matches!(e, ScryerError::StoreCorrupt(_)) {
                return Err(e);
            }
            warn!("startup recovery failed, retrying next cycle error={}", e);
            self.needs_recovery = true;
        }

        let mut planner = SleepPlanner::new(self.config.poll_interval, self.config.max_backoff);
        let mut cycle: u64 = 0;

        while !self.shutdown_requested() {
            cycle += 1;
            let started = Instant::now();
            let result = self.run_cycle().await;
            match &result {
                Ok(outcome) => info!(
                    "cycle complete cycle={} result={} elapsed_secs={}",
                    cycle,
                    outcome,
                    started.elapsed().as_secs()
                ),
                Err(e) if e.is_cycle_fatal() => warn!("cycle aborted cycle={} error={}", cycle, e),
                Err(e) => error!("cycle failed cycle={} error={}", cycle, e),
            }

            let sleep = planner.after_cycle(&result);
            if self.shutdown_requested() {
                break;
            }
            info!("cycle sleep cycle={} sleep_secs={}", cycle, sleep.as_secs());
            if self.sleep_or_shutdown(sleep).await {
                break;
            }
        }

        info!("daemon stopped owner={}", self.owner);
        Ok(())
    }

    /// Sleep for `duration`; true if shutdown was requested meanwhile.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.shutdown_requested(),
            changed = shutdown.wait_for(|stop| *stop) => changed.is_ok(),
        }
    }

    /// One discovery cycle: recover if due, claim one candidate, process it.
    pub async fn run_cycle(&mut self) -> Result<CycleResult> {
        if self.recovery_due() {
            self.recover().await?;
        }

        let today = self.today();
        let done_today = self.store.daily_done_count(&today)?;
        if done_today >= self.config.max_issues_per_day {
            warn!(
                "daily issue limit reached limit={} done={}",
                self.config.max_issues_per_day, done_today
            );
            return Ok(CycleResult::Limited);
        }

        let candidates = self.source.list_candidates(&self.config.label).await?;
        self.store.upsert_issues(&candidates)?;
        let ids: Vec<u64> = candidates.iter().map(|c| c.number).collect();
        let claimable = self.store.claimable_among(&ids)?;
        info!(
            "poll sync complete fetched={} claimable={}",
            candidates.len(),
            claimable.len()
        );

        match self.store.claim(&claimable, &self.owner, self.config.lease_duration)? {
            Some(item) => self.process_claimed(item).await,
            None => {
                debug!("no claimable issues");
                Ok(CycleResult::Idle)
            }
        }
    }

    /// Process exactly issue `id`, ignoring the daily limit.
    ///
    /// Fails with `ClaimConflict` when the item is not claimable.
    pub async fn run_single(&mut self, id: u64) -> Result<CycleResult> {
        if self.store.get(id)?.is_none() {
            let issue = self.source.view_issue(id).await?;
            self.store.upsert_issues(&[issue.summary()])?;
        }

        match self.store.claim(&[id], &self.owner, self.config.lease_duration)? {
            Some(item) => self.process_claimed(item).await,
            None => Err(ScryerError::ClaimConflict(id)),
        }
    }

    /// Drive a claimed item to release. Errors past the claim are recorded
    /// on the item; only store failures propagate.
    async fn process_claimed(&mut self, item: WorkItem) -> Result<CycleResult> {
        let id = item.id;
        info!("claimed issue={} attempt={} owner={}", id, item.attempt_count, self.owner);

        let issue = match self.source.view_issue(id).await {
            Ok(issue) => issue,
            Err(e) => {
                let outcome = RunOutcome::infrastructure(format!("could not read issue: {}", e));
                return self.finish(&item, outcome);
            }
        };
        self.store.upsert_issues(&[issue.summary()])?;
        self.store.record_body(id, issue.body.as_deref())?;

        if let Some(reason) = issue.skip_reason(&self.config.label, &self.config.skip_labels) {
            info!("issue skipped issue={} reason={}", id, reason);
            if !self.store.skip(id, &self.owner, &reason)? {
                warn!("lease lost before skip issue={}", id);
            }
            return Ok(CycleResult::Processed {
                id,
                status: ItemStatus::Skipped,
                outcome: None,
            });
        }

        let workspace = match self.workspaces.acquire(id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                if matches!(e, ScryerError::WorkspaceConflict { .. }) {
                    warn!("{}; sweeping before next cycle", e);
                    self.needs_recovery = true;
                } else {
                    error!("workspace acquire failed issue={}: {}", id, e);
                }
                return self.finish(&item, RunOutcome::infrastructure(e.to_string()));
            }
        };

        let result = self.process_in_workspace(&item, &issue, &workspace).await;

        // Workspace goes first so no other instance can claim while it is deleted
        if let Err(e) = self.workspaces.release(&workspace).await {
            error!("workspace release failed issue={}: {}", id, e);
            self.needs_recovery = true;
        }

        let (outcome, summary) = match result {
            Ok(Some((outcome, artifacts, summary))) => (outcome, Some((artifacts, summary))),
            Ok(None) => return Ok(CycleResult::Abandoned { id }),
            Err(e) => (RunOutcome::infrastructure(e.to_string()), None),
        };

        let cycle = self.finish(&item, outcome.clone())?;
        if let (Some((artifacts, mut summary)), CycleResult::Processed { status, .. }) = (summary, &cycle) {
            summary.status = status.to_string();
            summary.error = outcome.error().map(String::from);
            summary.finished_at = Utc::now();
            if let Err(e) = artifacts.write_summary(&summary) {
                warn!("could not write run summary issue={}: {}", id, e);
            }
        }
        Ok(cycle)
    }

    /// Run and publish inside an acquired workspace.
    ///
    /// Ok(None) means the lease was lost and nothing may be recorded.
    async fn process_in_workspace(
        &self,
        item: &WorkItem,
        issue: &Issue,
        workspace: &Workspace,
    ) -> Result<Option<(RunOutcome, RunArtifacts, RunSummary)>> {
        let id = item.id;
        let artifacts = RunArtifacts::create(&self.config.runs_dir, id)?;
        self.store.record_run_dir(id, &self.owner, artifacts.dir())?;
        let started_at = Utc::now();

        let report = match self.supervise(workspace, issue, &artifacts).await {
            Attempt::Finished(report) => report,
            Attempt::LeaseLost => {
                warn!("lease lost, abandoning run issue={}", id);
                return Ok(None);
            }
            Attempt::Shutdown => {
                warn!("shutdown requested, interrupting run issue={}", id);
                RunReport {
                    outcome: RunOutcome::infrastructure("interrupted by shutdown"),
                    exit_code: None,
                }
            }
        };

        let mut pr_url = None;
        let outcome = match report.outcome {
            RunOutcome::ChangesProduced { head_sha, diff_summary } => {
                let publication = Publication {
                    branch: workspace.branch.clone(),
                    base_branch: self.config.base_branch.clone(),
                    head_sha: head_sha.clone(),
                    diff_summary: diff_summary.clone(),
                    draft: self.config.draft_pr,
                };
                let published = match self
                    .keep_leased(id, self.source.publish_result(issue, &publication), false)
                    .await
                {
                    Attempt::Finished(published) => published,
                    Attempt::LeaseLost | Attempt::Shutdown => {
                        warn!("lease lost while publishing, abandoning issue={}", id);
                        return Ok(None);
                    }
                };
                match published {
                    Ok(pr) => {
                        if !self.store.record_publication(id, &self.owner, &workspace.branch, &pr.url)? {
                            warn!("lease lost before recording publication issue={}", id);
                        }
                        info!("issue complete issue={} pr={}", id, pr.url);
                        pr_url = Some(pr.url);
                        RunOutcome::ChangesProduced { head_sha, diff_summary }
                    }
                    Err(e) => {
                        error!("publish failed issue={}: {}", id, e);
                        RunOutcome::infrastructure(format!("publish failed: {}", e))
                    }
                }
            }
            other => other,
        };

        let summary = RunSummary {
            issue_id: id,
            outcome: outcome.kind(),
            status: String::new(),
            branch: workspace.branch.clone(),
            head_sha: outcome.head_sha().map(String::from),
            pr_url,
            error: None,
            exit_code: report.exit_code,
            started_at,
            finished_at: started_at,
            run_dir: artifacts.dir().to_path_buf(),
        };
        Ok(Some((outcome, artifacts, summary)))
    }

    /// Run the executor while keeping the lease alive.
    ///
    /// Dropping the run future kills the tool.
    async fn supervise(&self, workspace: &Workspace, issue: &Issue, artifacts: &RunArtifacts) -> Attempt<RunReport> {
        self.keep_leased(workspace.id, self.executor.run(workspace, issue, artifacts), true)
            .await
    }

    /// Drive `work` to completion while renewing the lease on `id`.
    ///
    /// With `stop_on_shutdown` a shutdown request drops `work`; otherwise it
    /// runs to the end. Losing the lease always drops it.
    async fn keep_leased<F: Future>(&self, id: u64, work: F, stop_on_shutdown: bool) -> Attempt<F::Output> {
        let lease = self.config.lease_duration;
        let period = (lease / 3).to_std().unwrap_or_default().max(Duration::from_millis(50));

        tokio::pin!(work);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut shutdown = self.shutdown.clone();
        let mut watch_shutdown = stop_on_shutdown;

        if watch_shutdown && *shutdown.borrow() {
            return Attempt::Shutdown;
        }

        loop {
            tokio::select! {
                output = &mut work => return Attempt::Finished(output),
                _ = ticker.tick() => match self.store.extend(id, &self.owner, lease) {
                    Ok(true) => debug!("lease extended issue={}", id),
                    Ok(false) => return Attempt::LeaseLost,
                    Err(e) => warn!("lease extend failed issue={}: {}", id, e),
                },
                changed = shutdown.wait_for(|stop| *stop), if watch_shutdown => {
                    if changed.is_ok() {
                        return Attempt::Shutdown;
                    }
                    // Sender gone: no shutdown can arrive
                    watch_shutdown = false;
                }
            }
        }
    }

    /// Release with the status the policy picks for `outcome`.
    fn finish(&self, item: &WorkItem, outcome: RunOutcome) -> Result<CycleResult> {
        let status = self.config.policy.next_status(item, &outcome);
        if !self.store.release(item.id, &self.owner, &outcome, status)? {
            warn!("lease lost before release issue={} outcome={}", item.id, outcome.kind());
            return Ok(CycleResult::Abandoned { id: item.id });
        }

        if status == ItemStatus::Done {
            let count = self.store.increment_daily_done(&self.today())?;
            debug!("daily done count={}", count);
        }

        match &outcome {
            RunOutcome::ToolFailed { error, .. } | RunOutcome::InfrastructureFailed { error } => error!(
                "issue failed issue={} status={} outcome={} error={}",
                item.id,
                status,
                outcome.kind(),
                error
            ),
            _ => info!("issue released issue={} status={} outcome={}", item.id, status, outcome.kind()),
        }

        Ok(CycleResult::Processed {
            id: item.id,
            status,
            outcome: Some(outcome.kind()),
        })
    }
}
