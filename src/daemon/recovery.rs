//! Crash Recovery - reclaim expired leases and sweep orphaned workspaces
//!
//! Runs at startup, periodically in daemon mode, and after a workspace
//! conflict. A run that died without releasing leaves two traces: a
//! `running` row whose lease eventually expires, and a worktree on disk. The
//! sweep removes the second only once the first is no longer live.

use std::path::PathBuf;

use log::{info, warn};

use crate::error::Result;
use crate::store::{ItemStatus, WorkStore};
use crate::workspace::WorkspaceManager;

/// What a recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Items whose expired lease was dropped
    pub reclaimed: Vec<u64>,
    /// Subset of `reclaimed` out of retries and moved to `needs_attention`
    pub parked: Vec<u64>,
    /// Workspaces removed
    pub removed: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.removed.is_empty()
    }
}

/// Reset expired leases, then remove every workspace without a live lease.
pub async fn recover(store: &WorkStore, workspaces: &WorkspaceManager) -> Result<RecoveryReport> {
    let expired = store.reclaim_expired()?;
    let reclaimed: Vec<u64> = expired.iter().map(|item| item.id).collect();
    let parked: Vec<u64> = expired
        .iter()
        .filter(|item| item.status == ItemStatus::NeedsAttention)
        .map(|item| item.id)
        .collect();
    if !reclaimed.is_empty() {
        info!("reclaimed expired leases count={} ids={:?}", reclaimed.len(), reclaimed);
    }
    if !parked.is_empty() {
        warn!("expired leases exhausted retries ids={:?} status=needs_attention", parked);
    }

    let active = store.active_lease_ids()?;
    let removed = workspaces.sweep_orphans(&active).await?;
    if !removed.is_empty() {
        info!("removed orphaned workspaces count={}", removed.len());
    }

    Ok(RecoveryReport {
        reclaimed,
        parked,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IssueSummary;
    use crate::store::ManualClock;
    use crate::testing::TestRepo;
    use chrono::Duration;
    use std::sync::Arc;

    fn summary(number: u64) -> IssueSummary {
        IssueSummary {
            number,
            title: format!("Issue {}", number),
            url: None,
            labels: vec![],
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_recover_after_crash() {
        let repo = TestRepo::new();
        let clock = ManualClock::default();
        let store =
            WorkStore::open_with_clock(&repo.temp.path().join("state.db"), Arc::new(clock.clone())).unwrap();
        let manager = repo.workspace_manager();
        store.upsert_issues(&[summary(1), summary(2)]).unwrap();

        // Crashed holder of 1, live holder of 2
        store.claim(&[1], "dead-1-00000000", Duration::seconds(30)).unwrap().unwrap();
        store.claim(&[2], "live-2-00000000", Duration::seconds(600)).unwrap().unwrap();
        manager.acquire(1).await.unwrap();
        manager.acquire(2).await.unwrap();

        // Nothing expired yet: nothing to do
        assert!(recover(&store, &manager).await.unwrap().is_empty());

        clock.advance(Duration::seconds(31));
        let report = recover(&store, &manager).await.unwrap();

        assert_eq!(report.reclaimed, vec![1]);
        assert!(report.parked.is_empty());
        assert_eq!(report.removed, vec![manager.path_for(1)]);
        assert_eq!(store.get(1).unwrap().unwrap().status, ItemStatus::Pending);
        assert!(manager.path_for(2).exists());

        // Second pass is a no-op
        assert!(recover(&store, &manager).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_parks_item_that_keeps_losing_its_lease() {
        let repo = TestRepo::new();
        let clock = ManualClock::default();
        let store = WorkStore::open_with_clock(&repo.temp.path().join("state.db"), Arc::new(clock.clone()))
            .unwrap()
            .with_max_infra_retries(2);
        let manager = repo.workspace_manager();
        store.upsert_issues(&[summary(5)]).unwrap();

        store.claim(&[5], "dead-1-00000000", Duration::seconds(30)).unwrap().unwrap();
        manager.acquire(5).await.unwrap();
        clock.advance(Duration::seconds(31));
        let report = recover(&store, &manager).await.unwrap();
        assert_eq!(report.reclaimed, vec![5]);
        assert!(report.parked.is_empty());

        store.claim(&[5], "dead-2-00000000", Duration::seconds(30)).unwrap().unwrap();
        manager.acquire(5).await.unwrap();
        clock.advance(Duration::seconds(31));
        let report = recover(&store, &manager).await.unwrap();
        assert_eq!(report.reclaimed, vec![5]);
        assert_eq!(report.parked, vec![5]);
        assert_eq!(report.removed, vec![manager.path_for(5)]);

        let item = store.get(5).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::NeedsAttention);
        assert_eq!(item.infra_failures, 2);
        assert!(store.claimable_among(&[5]).unwrap().is_empty());
    }
}
