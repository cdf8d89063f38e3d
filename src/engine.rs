//! Reconciliation engine - runs lifecycle operations under per-name leases
//!
//! The engine owns everything a pass needs: the lifecycle manager, the lease
//! table and the global concurrency cap. It is shared by the scheduler, the
//! HTTP trigger and the CLI so that all of them serialize on the same leases.

use crate::error::{MirrorError, MirrorResult};
use crate::gateway::RepositoryDescriptor;
use crate::lease::LeaseTable;
use crate::lifecycle::{MirrorAction, MirrorManager, MirrorOutcome};
use crate::store::{MirrorState, MirrorStore};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Which reconciliation routine a pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Create mirrors for recently desired repositories
    Incremental,
    /// Update every desired repository
    Full,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassKind::Incremental => write!(f, "incremental"),
            PassKind::Full => write!(f, "full"),
        }
    }
}

/// Result of reconciling one descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created { name: String },
    Updated { name: String },
    AlreadyPresent { name: String },
    Skipped { name: String, reason: String },
    Failed { name: String, error: String },
}

impl ReconcileOutcome {
    pub fn name(&self) -> &str {
        match self {
            ReconcileOutcome::Created { name }
            | ReconcileOutcome::Updated { name }
            | ReconcileOutcome::AlreadyPresent { name }
            | ReconcileOutcome::Skipped { name, .. }
            | ReconcileOutcome::Failed { name, .. } => name,
        }
    }

    fn from_action(name: &str, action: MirrorAction) -> Self {
        match action {
            MirrorAction::Created => ReconcileOutcome::Created {
                name: name.to_string(),
            },
            MirrorAction::Updated => ReconcileOutcome::Updated {
                name: name.to_string(),
            },
        }
    }
}

/// Results from one reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub kind: PassKind,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
    pub outcomes: Vec<ReconcileOutcome>,
}

impl PassSummary {
    fn compile(kind: PassKind, outcomes: Vec<ReconcileOutcome>, duration: Duration) -> Self {
        let mut summary = PassSummary {
            kind,
            total: outcomes.len(),
            created: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
            duration,
            outcomes: Vec::new(),
        };

        for outcome in &outcomes {
            match outcome {
                ReconcileOutcome::Created { .. } => summary.created += 1,
                ReconcileOutcome::Updated { .. } => summary.updated += 1,
                ReconcileOutcome::AlreadyPresent { .. } => summary.unchanged += 1,
                ReconcileOutcome::Skipped { .. } => summary.skipped += 1,
                ReconcileOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        summary.outcomes = outcomes;
        summary
    }

    /// Outcome recorded for `name`, if it took part in the pass
    pub fn outcome_for(&self, name: &str) -> Option<&ReconcileOutcome> {
        self.outcomes.iter().find(|o| o.name() == name)
    }
}

/// Runs lifecycle operations with per-name exclusion and a global cap
pub struct MirrorEngine {
    manager: Arc<MirrorManager>,
    leases: Arc<LeaseTable>,
    permits: Arc<Semaphore>,
    lease_wait: Duration,
}

impl MirrorEngine {
    pub fn new(
        manager: Arc<MirrorManager>,
        leases: Arc<LeaseTable>,
        max_parallel: usize,
        lease_wait: Duration,
    ) -> Self {
        Self {
            manager,
            leases,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            lease_wait,
        }
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        self.manager.store()
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    pub fn manager(&self) -> &Arc<MirrorManager> {
        &self.manager
    }

    /// Create a mirror for a descriptor unless one is already ready
    pub async fn reconcile_new(&self, descriptor: &RepositoryDescriptor) -> ReconcileOutcome {
        let name = descriptor.name.as_str();
        let _lease = match self.leases.acquire(name, self.lease_wait).await {
            Ok(lease) => lease,
            Err(e) => return Self::skipped(name, e),
        };

        let key = name.to_string();
        match self.store().blocking(move |store| store.lookup(&key)).await {
            Ok(Some(record)) if record.state == MirrorState::Ready => {
                debug!("Mirror {} already present", name);
                return ReconcileOutcome::AlreadyPresent {
                    name: name.to_string(),
                };
            }
            Ok(_) => {}
            Err(e) => return Self::failed(name, e),
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return Self::failed_closed(name);
        };

        match self.manager.create_mirror(descriptor).await {
            Ok(outcome) => ReconcileOutcome::from_action(name, outcome.action),
            Err(e) => Self::failed(name, e),
        }
    }

    /// Update an existing mirror, creating it if it has gone missing
    pub async fn reconcile_existing(&self, descriptor: &RepositoryDescriptor) -> ReconcileOutcome {
        let name = descriptor.name.as_str();
        let _lease = match self.leases.acquire(name, self.lease_wait).await {
            Ok(lease) => lease,
            Err(e) => return Self::skipped(name, e),
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return Self::failed_closed(name);
        };

        match self.manager.update_mirror(descriptor).await {
            Ok(outcome) => ReconcileOutcome::from_action(name, outcome.action),
            Err(e) => Self::failed(name, e),
        }
    }

    /// Ad-hoc create under the lease; errors are returned to the caller
    pub async fn mirror_now(&self, descriptor: &RepositoryDescriptor) -> MirrorResult<MirrorOutcome> {
        crate::lifecycle::validate_descriptor(descriptor)?;

        let _lease = self
            .leases
            .acquire(&descriptor.name, self.lease_wait)
            .await?;
        let _permit = self.permits.acquire().await.map_err(|_| {
            MirrorError::LeaseTimeout {
                name: descriptor.name.clone(),
                waited: self.lease_wait,
            }
        })?;

        self.manager.create_mirror(descriptor).await
    }

    /// Reconcile every descriptor concurrently and summarize the results
    pub async fn run_pass(
        &self,
        kind: PassKind,
        descriptors: Vec<RepositoryDescriptor>,
    ) -> PassSummary {
        let start_time = Instant::now();
        info!("Starting {} pass over {} repositories", kind, descriptors.len());

        let mut futures = FuturesUnordered::new();
        for descriptor in &descriptors {
            futures.push(async move {
                match kind {
                    PassKind::Incremental => self.reconcile_new(descriptor).await,
                    PassKind::Full => self.reconcile_existing(descriptor).await,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(descriptors.len());
        while let Some(outcome) = futures.next().await {
            debug!("Reconciled: {:?}", outcome);
            outcomes.push(outcome);
        }
        drop(futures);

        let summary = PassSummary::compile(kind, outcomes, start_time.elapsed());
        info!(
            "{} pass completed in {:.2}s: {} created, {} updated, {} unchanged, {} skipped, {} failed",
            kind,
            summary.duration.as_secs_f64(),
            summary.created,
            summary.updated,
            summary.unchanged,
            summary.skipped,
            summary.failed
        );

        summary
    }

    fn skipped(name: &str, err: MirrorError) -> ReconcileOutcome {
        warn!("Skipping {} this cycle: {}", name, err);
        ReconcileOutcome::Skipped {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    fn failed(name: &str, err: MirrorError) -> ReconcileOutcome {
        error!("Reconciliation of {} failed: {}", name, err);
        ReconcileOutcome::Failed {
            name: name.to_string(),
            error: err.to_string(),
        }
    }

    fn failed_closed(name: &str) -> ReconcileOutcome {
        ReconcileOutcome::Failed {
            name: name.to_string(),
            error: "engine is shutting down".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockVcs;
    use crate::lifecycle::ExportAddress;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    fn fake_bare_repo(dest: &Path) {
        std::fs::create_dir_all(dest.join("objects")).unwrap();
        std::fs::create_dir_all(dest.join("refs")).unwrap();
        std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    fn engine(root: &Path, vcs: MockVcs, lease_wait: Duration) -> MirrorEngine {
        let store = Arc::new(MirrorStore::open_in_memory(root).unwrap());
        let manager = Arc::new(MirrorManager::new(
            store,
            Arc::new(vcs),
            ExportAddress::new("localhost", 9418),
            Duration::from_secs(5),
        ));
        MirrorEngine::new(manager, Arc::new(LeaseTable::new()), 4, lease_wait)
    }

    fn descriptor(name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor::new(name, format!("example.com/{}.git", name), Utc::now())
    }

    #[test]
    fn test_summary_counts() {
        let outcomes = vec![
            ReconcileOutcome::Created { name: "a".into() },
            ReconcileOutcome::Updated { name: "b".into() },
            ReconcileOutcome::AlreadyPresent { name: "c".into() },
            ReconcileOutcome::Skipped {
                name: "d".into(),
                reason: "lease".into(),
            },
            ReconcileOutcome::Failed {
                name: "e".into(),
                error: "boom".into(),
            },
        ];

        let summary = PassSummary::compile(PassKind::Full, outcomes, Duration::from_secs(3));
        assert_eq!(summary.total, 5);
        assert_eq!(
            (summary.created, summary.updated, summary.unchanged, summary.skipped, summary.failed),
            (1, 1, 1, 1, 1)
        );
        assert_matches!(summary.outcome_for("e"), Some(ReconcileOutcome::Failed { .. }));
        assert!(summary.outcome_for("zzz").is_none());
    }

    #[tokio::test]
    async fn test_incremental_skips_ready_mirror() {
        let tmp = TempDir::new().unwrap();
        let mut vcs = MockVcs::new();
        vcs.expect_clone_mirror().times(1).returning(|_, dest| {
            fake_bare_repo(dest);
            Ok(())
        });

        let engine = engine(tmp.path(), vcs, Duration::from_secs(1));
        let first = engine.reconcile_new(&descriptor("demo")).await;
        assert_matches!(first, ReconcileOutcome::Created { .. });

        let second = engine.reconcile_new(&descriptor("demo")).await;
        assert_matches!(second, ReconcileOutcome::AlreadyPresent { .. });
    }

    #[tokio::test]
    async fn test_incremental_recreates_failed_mirror() {
        let tmp = TempDir::new().unwrap();
        let mut vcs = MockVcs::new();
        vcs.expect_clone_mirror().times(1).returning(|_, dest| {
            fake_bare_repo(dest);
            Ok(())
        });

        let engine = engine(tmp.path(), vcs, Duration::from_secs(1));
        engine
            .store()
            .record_transition("demo", MirrorState::Failed, Some("earlier failure"))
            .unwrap();

        let outcome = engine.reconcile_new(&descriptor("demo")).await;
        assert_matches!(outcome, ReconcileOutcome::Created { .. });
    }

    #[tokio::test]
    async fn test_lease_timeout_is_skipped_without_touching_record() {
        let tmp = TempDir::new().unwrap();
        let mut vcs = MockVcs::new();
        vcs.expect_clone_mirror().times(0);
        vcs.expect_fetch_mirror().times(0);

        let engine = engine(tmp.path(), vcs, Duration::from_millis(50));
        engine
            .store()
            .record_transition("demo", MirrorState::Failed, Some("previous"))
            .unwrap();

        let _held = engine
            .leases()
            .acquire("demo", Duration::from_secs(1))
            .await
            .unwrap();

        let outcome = engine.reconcile_existing(&descriptor("demo")).await;
        assert_matches!(outcome, ReconcileOutcome::Skipped { .. });

        let record = engine.store().lookup("demo").unwrap().unwrap();
        assert_eq!(record.state, MirrorState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("previous"));
    }

    #[tokio::test]
    async fn test_mirror_now_surfaces_errors() {
        let tmp = TempDir::new().unwrap();
        let mut vcs = MockVcs::new();
        vcs.expect_clone_mirror().times(1).returning(|url, _| {
            Err(MirrorError::CloneFailure {
                url: url.to_string(),
                message: "repository not found".to_string(),
            })
        });

        let engine = engine(tmp.path(), vcs, Duration::from_secs(1));
        let result = engine.mirror_now(&descriptor("missing")).await;
        assert_matches!(result, Err(MirrorError::CloneFailure { .. }));

        let invalid = engine
            .mirror_now(&RepositoryDescriptor::new("a/b", "example.com/x", Utc::now()))
            .await;
        assert_matches!(invalid, Err(MirrorError::InvalidDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_run_pass_full_creates_missing() {
        let tmp = TempDir::new().unwrap();
        let mut vcs = MockVcs::new();
        vcs.expect_clone_mirror().times(2).returning(|_, dest| {
            fake_bare_repo(dest);
            Ok(())
        });

        let engine = engine(tmp.path(), vcs, Duration::from_secs(1));
        let summary = engine
            .run_pass(PassKind::Full, vec![descriptor("one"), descriptor("two")])
            .await;

        assert_eq!(summary.kind, PassKind::Full);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 0);
    }
}
