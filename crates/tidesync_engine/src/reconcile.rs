//! Periodic full comparison of local and remote version state.
//!
//! Realtime delivery is best effort. Reconciliation fetches the narrow
//! `(id, version, deleted)` projection of every registered table, diffs it
//! against the local projection and hands each difference to the
//! application's [`ReconciliationDelegate`].

use crate::error::{SyncError, SyncResult};
use crate::registry::{EntityDescriptor, EntityRegistry};
use crate::remote::{ColumnFilter, RemoteStore};
use crate::session::SessionCell;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    resolve, resolve_existence, ExistenceAction, SyncAction, VersionState, VERSION_PROJECTION,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Application callbacks that act on reconciliation results.
#[async_trait]
pub trait ReconciliationDelegate: Send + Sync {
    /// Returns `id -> (version, deleted)` for every local entity of `table`.
    async fn local_version_states(&self, table: &str) -> SyncResult<HashMap<String, VersionState>>;

    /// Fetches these rows and merges or materializes them locally.
    async fn pull_entities(&self, table: &str, ids: &[String]) -> SyncResult<()>;

    /// Pushes these local entities.
    async fn push_entities(&self, table: &str, ids: &[String]) -> SyncResult<()>;

    /// Repairs entities whose deletion state disagrees.
    async fn heal_deletion_drift(&self, table: &str, drifts: &[DeletionDrift]) -> SyncResult<()>;
}

/// An entity whose tombstone flag differs between the two sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionDrift {
    /// Entity ID.
    pub id: String,
    /// Local state.
    pub local: VersionState,
    /// Remote state.
    pub remote: VersionState,
    /// Resolver verdict: `AdoptTombstone` heals locally, `Push` remotely.
    pub action: SyncAction,
}

/// Differences found in one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    /// Live rows missing locally.
    pub remote_only: Vec<String>,
    /// Live entities missing remotely.
    pub local_only: Vec<String>,
    /// Remote ahead.
    pub remote_newer: Vec<String>,
    /// Local ahead.
    pub local_newer: Vec<String>,
    /// Deletion state disagrees.
    pub deletion_drift: Vec<DeletionDrift>,
    /// Remote-only tombstones, ignored.
    pub skipped_remote_tombstones: usize,
    /// Local-only tombstones, ignored.
    pub skipped_local_tombstones: usize,
    /// Entities identical on both sides.
    pub in_sync: usize,
}

impl TableDiff {
    /// Returns true if nothing needs doing.
    pub fn is_clean(&self) -> bool {
        self.remote_only.is_empty()
            && self.local_only.is_empty()
            && self.remote_newer.is_empty()
            && self.local_newer.is_empty()
            && self.deletion_drift.is_empty()
    }

    /// IDs to pull: remote-only first, then remote-newer.
    pub fn to_pull(&self) -> Vec<String> {
        self.remote_only
            .iter()
            .chain(&self.remote_newer)
            .cloned()
            .collect()
    }

    /// IDs to push: local-only first, then local-newer.
    pub fn to_push(&self) -> Vec<String> {
        self.local_only
            .iter()
            .chain(&self.local_newer)
            .cloned()
            .collect()
    }
}

/// Sorts every `(local, remote)` pair into reconciliation buckets.
///
/// Same-version pairs with differing tombstones, and pairs the resolver
/// settles by adopting a tombstone, are deletion drift.
pub fn diff_states(
    local: &HashMap<String, VersionState>,
    remote: &HashMap<String, VersionState>,
    undelete_delta: u64,
) -> TableDiff {
    let ids: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut diff = TableDiff::default();

    for id in ids {
        match (local.get(id), remote.get(id)) {
            (None, Some(r)) => match resolve_existence(false, true, false, r.deleted) {
                ExistenceAction::CreateLocal => diff.remote_only.push(id.clone()),
                _ => diff.skipped_remote_tombstones += 1,
            },
            (Some(l), None) => match resolve_existence(true, false, l.deleted, false) {
                ExistenceAction::CreateRemote => diff.local_only.push(id.clone()),
                _ => diff.skipped_local_tombstones += 1,
            },
            (Some(l), Some(r)) => {
                let action = resolve(l.version, l.deleted, r.version, r.deleted, undelete_delta);
                let drifted = action == SyncAction::AdoptTombstone
                    || (l.version == r.version && l.deleted != r.deleted);
                if drifted {
                    diff.deletion_drift.push(DeletionDrift {
                        id: id.clone(),
                        local: *l,
                        remote: *r,
                        action,
                    });
                    continue;
                }
                match action {
                    SyncAction::Push if r.undeletes(l, undelete_delta) => {
                        diff.remote_newer.push(id.clone())
                    }
                    SyncAction::Pull => diff.remote_newer.push(id.clone()),
                    SyncAction::Push => diff.local_newer.push(id.clone()),
                    _ => diff.in_sync += 1,
                }
            }
            (None, None) => {}
        }
    }

    diff
}

/// Reconciliation result for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    /// Table name.
    pub table: String,
    /// Remote rows fetched.
    pub remote_rows: usize,
    /// Local entities compared.
    pub local_rows: usize,
    /// Buckets.
    pub diff: TableDiff,
    /// First error hit while processing the table.
    pub error: Option<String>,
}

impl TableSummary {
    fn failed(table: &str, error: &SyncError) -> Self {
        Self {
            table: table.to_string(),
            remote_rows: 0,
            local_rows: 0,
            diff: TableDiff::default(),
            error: Some(error.to_string()),
        }
    }
}

/// Result of one full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Per-table results, ordered by table name.
    pub tables: Vec<TableSummary>,
}

impl ReconciliationReport {
    /// Returns the summary of `table`.
    pub fn table(&self, table: &str) -> Option<&TableSummary> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Returns true if any table reported an error.
    pub fn has_errors(&self) -> bool {
        self.tables.iter().any(|t| t.error.is_some())
    }
}

/// Outcome of a `reconcile` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A pass ran.
    Completed(ReconciliationReport),
    /// Another pass is in progress.
    AlreadyRunning,
    /// The last pass started less than the minimum interval ago.
    TooSoon,
}

/// Runs reconciliation passes.
pub struct ReconciliationService<R, D> {
    registry: Arc<EntityRegistry>,
    remote: Arc<R>,
    delegate: Arc<D>,
    session: Arc<SessionCell>,
    undelete_delta: u64,
    min_interval: Duration,
    running: AtomicBool,
    last_run: Mutex<Option<Instant>>,
}

impl<R, D> ReconciliationService<R, D>
where
    R: RemoteStore + 'static,
    D: ReconciliationDelegate + 'static,
{
    /// Creates a service.
    pub fn new(
        registry: Arc<EntityRegistry>,
        remote: Arc<R>,
        delegate: Arc<D>,
        session: Arc<SessionCell>,
        undelete_delta: u64,
        min_interval: Duration,
    ) -> Self {
        Self {
            registry,
            remote,
            delegate,
            session,
            undelete_delta,
            min_interval,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    /// Runs one pass over every registered table.
    ///
    /// Skipped if a pass is already running, or, unless `force` is set,
    /// if the previous pass started less than the minimum interval ago. A
    /// failing table is recorded in the report and does not stop the
    /// others.
    pub async fn reconcile(&self, force: bool) -> ReconcileOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reconciliation already running");
            return ReconcileOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        {
            let mut last_run = self.last_run.lock();
            if !force && last_run.is_some_and(|at| at.elapsed() < self.min_interval) {
                debug!("reconciliation ran recently, skipping");
                return ReconcileOutcome::TooSoon;
            }
            *last_run = Some(Instant::now());
        }

        let mut report = ReconciliationReport::default();
        for descriptor in self.registry.descriptors() {
            let table = descriptor.table_name().to_string();
            let summary = match self.reconcile_table(descriptor.as_ref()).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(table = %table, error = %e, "reconciliation failed for table");
                    TableSummary::failed(&table, &e)
                }
            };
            info!(
                table = %summary.table,
                remote = summary.remote_rows,
                local = summary.local_rows,
                remote_only = summary.diff.remote_only.len(),
                local_only = summary.diff.local_only.len(),
                remote_newer = summary.diff.remote_newer.len(),
                local_newer = summary.diff.local_newer.len(),
                drift = summary.diff.deletion_drift.len(),
                "reconciled table"
            );
            report.tables.push(summary);
        }

        ReconcileOutcome::Completed(report)
    }

    async fn reconcile_table(&self, descriptor: &dyn EntityDescriptor) -> SyncResult<TableSummary> {
        let table = descriptor.table_name();

        let filter = match descriptor.owner_column() {
            Some(column) => {
                let session = self.session.current().ok_or(SyncError::NoSession)?;
                Some(ColumnFilter::eq(column, session.user_id()))
            }
            None => None,
        };

        let rows = self
            .remote
            .select(table, &VERSION_PROJECTION, filter.as_ref())
            .await?;
        let mut remote = HashMap::with_capacity(rows.len());
        for row in &rows {
            match (row.id(), row.version_state()) {
                (Ok(id), Ok(state)) => {
                    remote.insert(id.to_string(), state);
                }
                _ => warn!(table, "skipping malformed remote row"),
            }
        }

        let local = self.delegate.local_version_states(table).await?;
        let diff = diff_states(&local, &remote, self.undelete_delta);
        let mut error = None;

        let to_pull = diff.to_pull();
        if !to_pull.is_empty() {
            if let Err(e) = self.delegate.pull_entities(table, &to_pull).await {
                warn!(table, count = to_pull.len(), error = %e, "pull during reconciliation failed");
                error.get_or_insert(e.to_string());
            }
        }

        let to_push = diff.to_push();
        if !to_push.is_empty() {
            if let Err(e) = self.delegate.push_entities(table, &to_push).await {
                warn!(table, count = to_push.len(), error = %e, "push during reconciliation failed");
                error.get_or_insert(e.to_string());
            }
        }

        if !diff.deletion_drift.is_empty() {
            if let Err(e) = self
                .delegate
                .heal_deletion_drift(table, &diff.deletion_drift)
                .await
            {
                warn!(table, count = diff.deletion_drift.len(), error = %e, "deletion drift repair failed");
                error.get_or_insert(e.to_string());
            }
        }

        Ok(TableSummary {
            table: table.to_string(),
            remote_rows: remote.len(),
            local_rows: local.len(),
            diff,
            error,
        })
    }

    /// Runs unforced passes every `interval` on a background task.
    ///
    /// The first pass runs immediately.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reconcile(false).await;
            }
        })
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
