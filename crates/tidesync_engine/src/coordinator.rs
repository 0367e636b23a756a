//! The sync coordinator.
//!
//! Every local mutation runs the same pipeline:
//!
//! ```text
//! bump version → local commit → parent signal → push → classify failure
//! ```
//!
//! Failures after the local commit never fail the mutation. They are
//! classified once: permanent rejections raise a reconciliation signal,
//! duplicates are swallowed, everything else transient lands in the
//! offline queue.

use crate::config::SyncConfig;
use crate::echo::EchoTracker;
use crate::entity::SyncableEntity;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::local::LocalStore;
use crate::merge::{MergeOutcome, PullEngine};
use crate::notifier::DebouncedNotifier;
use crate::observer::SyncObserver;
use crate::push::{build_record, tombstone_record, PushEngine};
use crate::queue::OfflineQueue;
use crate::realtime::{ChangeSink, RealtimeRouter};
use crate::reconcile::{ReconciliationDelegate, ReconciliationService};
use crate::registry::{EntityConfig, EntityRegistry};
use crate::remote::{ColumnFilter, RemoteStore};
use crate::session::{SessionCell, SyncSession};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    OfflineAction, OfflineOperation, VersionState, WireRecord, DELETED_COLUMN, ID_COLUMN,
    UPDATED_AT_COLUMN, VERSION_COLUMN,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What happened to the remote side of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote accepted the write.
    Pushed,
    /// The write failed transiently and waits in the offline queue.
    Queued {
        /// The failure.
        reason: String,
    },
    /// The remote already held this version.
    Duplicate,
    /// The remote refused the write for good; reconciliation will settle it.
    Rejected {
        /// The failure.
        reason: String,
    },
    /// No wire record could be built; nothing was sent or queued.
    Dropped {
        /// The failure.
        reason: String,
    },
    /// Nothing to do.
    Unchanged,
}

/// Sync statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Records the remote accepted.
    pub pushed: u64,
    /// Mutations sent to the offline queue.
    pub queued: u64,
    /// Mutations dropped because no record could be built.
    pub dropped: u64,
    /// Writes the remote already held.
    pub duplicates: u64,
    /// Writes the remote refused permanently.
    pub rejected: u64,
    /// Version regression and invalid undelete signals raised.
    pub version_regressions: u64,
    /// Offline operations replayed successfully.
    pub replayed: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Client-side sync engine.
///
/// Owns the echo tracker, offline queue, push and pull engines and the
/// debounced notifier, and shares the registry, stores and session with
/// the reconciliation service and realtime router it creates.
pub struct SyncEngine<R, L> {
    config: SyncConfig,
    registry: Arc<EntityRegistry>,
    remote: Arc<R>,
    local: Arc<L>,
    echo: Arc<EchoTracker>,
    queue: Arc<OfflineQueue>,
    push: PushEngine<R>,
    pull: PullEngine,
    notifier: Arc<DebouncedNotifier>,
    observer: Arc<dyn SyncObserver>,
    session: Arc<SessionCell>,
    stats: RwLock<SyncStats>,
}

impl<R, L> SyncEngine<R, L>
where
    R: RemoteStore + 'static,
    L: LocalStore + 'static,
{
    /// Creates an engine.
    ///
    /// Opens the offline queue at `config.queue_path` and signs in
    /// `config.user_id`, if set.
    pub fn new(
        config: SyncConfig,
        registry: Arc<EntityRegistry>,
        remote: Arc<R>,
        local: Arc<L>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        let echo = Arc::new(EchoTracker::new(config.echo_window));
        let queue = Arc::new(match &config.queue_path {
            Some(path) => OfflineQueue::open(path.clone()),
            None => OfflineQueue::in_memory(),
        });
        let session = Arc::new(SessionCell::new());
        if let Some(user_id) = &config.user_id {
            session.set(SyncSession::new(user_id.clone(), config.app_secret.as_deref()));
        }
        let notifier = Arc::new(DebouncedNotifier::new(
            config.debounce_delay,
            Arc::clone(&observer),
        ));

        Self {
            push: PushEngine::new(Arc::clone(&remote), Arc::clone(&echo)),
            pull: PullEngine::new(Arc::clone(&echo), config.undelete_delta),
            config,
            registry,
            remote,
            local,
            echo,
            queue,
            notifier,
            observer,
            session,
            stats: RwLock::new(SyncStats::default()),
        }
    }

    // === Mutations ===

    /// Commits a new entity and pushes it.
    pub async fn create<E: SyncableEntity>(&self, entity: &E) -> SyncResult<PushOutcome> {
        let config = self.registry.config::<E>()?;
        self.commit_local(entity)?;
        self.signal_parent(entity, &config);

        let outcome = self.push_full(entity, &config, OfflineAction::Insert).await;
        self.notifier.post(E::ENTITY_TYPE);
        outcome
    }

    /// Increments the version, commits and pushes.
    pub async fn update<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PushOutcome> {
        let config = self.registry.config::<E>()?;
        entity.set_version(entity.version().wrapping_add(1));
        self.commit_local(entity)?;
        self.signal_parent(entity, &config);

        let outcome = self.push_full(entity, &config, OfflineAction::Update).await;
        self.notifier.post(E::ENTITY_TYPE);
        outcome
    }

    /// Tombstones the entity, commits and pushes a narrow update.
    pub async fn delete<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PushOutcome> {
        let config = self.registry.config::<E>()?;
        let version = entity.version().wrapping_add(1);
        entity.set_version_state(VersionState::new(version, true));
        self.commit_local(entity)?;
        self.signal_parent(entity, &config);

        // The full tombstone lets the push create the row if the remote
        // never saw it; the narrow update is used whenever it exists.
        let session = self.session.current();
        let record = match build_record(entity, &config, session.as_deref()) {
            Ok(record) => record,
            Err(e) => {
                debug!(table = config.table_name(), entity_id = entity.id(), error = %e, "sending narrow tombstone only");
                tombstone_record(entity.id(), version, true)
            }
        };
        let outcome = self
            .deliver(
                E::ENTITY_TYPE,
                config.table_name(),
                entity.id(),
                OfflineAction::Delete,
                record,
            )
            .await;
        self.notifier.post(E::ENTITY_TYPE);
        outcome
    }

    /// Clears the tombstone with a version jump of the undelete delta.
    ///
    /// The only way to revive a deleted entity. A live entity is left
    /// alone.
    pub async fn undelete<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PushOutcome> {
        let config = self.registry.config::<E>()?;
        if !entity.is_deleted() {
            return Ok(PushOutcome::Unchanged);
        }
        let version = entity.version().wrapping_add(self.config.undelete_delta);
        entity.set_version_state(VersionState::new(version, false));
        self.commit_local(entity)?;
        self.signal_parent(entity, &config);

        let outcome = self.push_full(entity, &config, OfflineAction::Update).await;
        self.notifier.post(E::ENTITY_TYPE);
        outcome
    }

    /// Increments a parent's version so subtree watchers see a change.
    ///
    /// Call this from [`SyncObserver::parent_needs_bump`] handling. The
    /// bump propagates further up if the parent has a parent itself.
    pub async fn bump_hierarchy<E: SyncableEntity>(
        &self,
        parent: &mut E,
    ) -> SyncResult<PushOutcome> {
        self.update(parent).await
    }

    /// Pushes many entities in batches without changing them.
    ///
    /// Returns the number the remote accepted.
    ///
    /// # Errors
    ///
    /// `NotRegistered` for an unknown type, `NoSession` for an owned table
    /// without a signed-in user. Nothing is sent in either case.
    pub async fn push_batch<E: SyncableEntity>(&self, entities: &[E]) -> SyncResult<usize> {
        let config = self.registry.config::<E>()?;
        let session = self.session.current();
        if config.owner_column().is_some() && session.is_none() {
            return Err(SyncError::NoSession);
        }
        let pushed = self
            .push
            .push_batch(
                entities,
                &config,
                session.as_deref(),
                self.config.push_batch_size,
            )
            .await;
        let pushed_ids: HashSet<&str> = pushed.iter().map(String::as_str).collect();
        for entity in entities.iter().filter(|e| pushed_ids.contains(e.id())) {
            self.supersede_queued(config.table_name(), entity.id(), entity.version());
        }
        self.stats.write().pushed += pushed.len() as u64;
        Ok(pushed.len())
    }

    // === Incoming ===

    /// Merges a remote row into a local entity and commits the result.
    pub async fn merge_remote<E: SyncableEntity>(
        &self,
        record: &WireRecord,
        local: Option<&mut E>,
    ) -> SyncResult<MergeOutcome> {
        let config = self.registry.config::<E>()?;
        let session = self.session.current();
        let Some(entity) = local else {
            return Ok(MergeOutcome::RequiresCreation);
        };

        let outcome = self
            .pull
            .merge_into(record, Some(&mut *entity), &config, session.as_deref())?;
        if outcome.is_updated() {
            self.commit_local(&*entity)?;
            self.notifier.post(E::ENTITY_TYPE);
        }
        Ok(outcome)
    }

    /// Creates and commits a local entity from a remote-only row.
    ///
    /// Returns `None` for tombstones and unusable rows.
    pub async fn materialize<E: SyncableEntity>(
        &self,
        record: &WireRecord,
    ) -> SyncResult<Option<E>> {
        let config = self.registry.config::<E>()?;
        let session = self.session.current();
        let entity = self.pull.materialize(record, &config, session.as_deref())?;
        if let Some(entity) = &entity {
            self.commit_local(entity)?;
            self.notifier.post(E::ENTITY_TYPE);
        }
        Ok(entity)
    }

    /// Fetches full remote rows by ID.
    pub async fn fetch_records(&self, table: &str, ids: &[String]) -> SyncResult<Vec<WireRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = ColumnFilter::any_of(ID_COLUMN, ids.iter().map(String::as_str));
        self.remote.select(table, &[], Some(&filter)).await
    }

    // === Offline queue ===

    /// Replays the offline queue. Returns how many operations succeeded.
    pub async fn replay_offline_queue(&self) -> usize {
        let replayed = self
            .queue
            .process_queue(|operation| self.replay_operation(operation))
            .await;
        if replayed > 0 {
            info!(replayed, remaining = self.queue.len(), "replayed offline queue");
            self.stats.write().replayed += replayed as u64;
        }
        replayed
    }

    /// Replays the offline queue every `interval` on a background task.
    pub fn spawn_queue_replay(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !self.queue.is_empty() {
                    self.replay_offline_queue().await;
                }
            }
        })
    }

    async fn replay_operation(&self, operation: OfflineOperation) -> SyncResult<()> {
        let record = operation
            .record()?
            .ok_or_else(|| SyncError::build("queued operation has no payload"))?;

        let result = self
            .write(&operation.table, &operation.entity_id, operation.action, &record)
            .await;

        if let Err(e) = &result {
            if e.needs_reconciliation() {
                let entity_type = self
                    .registry
                    .descriptor_for_table(&operation.table)
                    .map_or("unknown", |d| d.entity_type());
                self.signal_regression(entity_type, &operation.entity_id, &operation.table, e);
            }
        }
        result
    }

    // === Components ===

    /// Creates a reconciliation service sharing this engine's state.
    pub fn reconciliation<D: ReconciliationDelegate + 'static>(
        &self,
        delegate: Arc<D>,
    ) -> ReconciliationService<R, D> {
        ReconciliationService::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.remote),
            delegate,
            Arc::clone(&self.session),
            self.config.undelete_delta,
            self.config.reconcile_min_interval,
        )
    }

    /// Starts periodic reconciliation at `config.reconcile_interval`.
    pub fn spawn_reconciliation<D: ReconciliationDelegate + 'static>(
        &self,
        delegate: Arc<D>,
    ) -> JoinHandle<()> {
        Arc::new(self.reconciliation(delegate)).spawn_periodic(self.config.reconcile_interval)
    }

    /// Creates a realtime router sharing this engine's echo tracker.
    pub fn realtime_router<S: ChangeSink + 'static>(&self, sink: Arc<S>) -> RealtimeRouter<S> {
        RealtimeRouter::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.echo),
            Arc::clone(&self.notifier),
            sink,
        )
    }

    /// Subscribes to every registered table and routes changes to `sink`.
    pub async fn start_realtime<S: ChangeSink + 'static>(
        &self,
        sink: Arc<S>,
    ) -> SyncResult<Vec<JoinHandle<usize>>> {
        let router = Arc::new(self.realtime_router(sink));
        let mut handles = Vec::new();
        for descriptor in self.registry.descriptors() {
            let stream = self.remote.subscribe(descriptor.table_name()).await?;
            debug!(table = descriptor.table_name(), "subscribed to realtime changes");
            handles.push(Arc::clone(&router).spawn(stream));
        }
        Ok(handles)
    }

    // === Session ===

    /// Switches the acting user and derives their field key.
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        info!(user_id = %user_id, "signed in");
        self.session
            .set(SyncSession::new(user_id, self.config.app_secret.as_deref()));
    }

    /// Clears the acting user.
    pub fn sign_out(&self) {
        info!("signed out");
        self.session.clear();
    }

    /// Current user ID.
    pub fn current_user(&self) -> Option<String> {
        self.session.current().map(|s| s.user_id().to_string())
    }

    // === Accessors ===

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Entity registry.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Remote store.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Local store.
    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    /// Offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Echo tracker.
    pub fn echo_tracker(&self) -> &Arc<EchoTracker> {
        &self.echo
    }

    /// Debounced notifier.
    pub fn notifier(&self) -> &Arc<DebouncedNotifier> {
        &self.notifier
    }

    // === Pipeline ===

    fn commit_local<E: SyncableEntity>(&self, entity: &E) -> SyncResult<()> {
        self.local.save(entity)?;
        self.local.commit()
    }

    fn signal_parent<E: SyncableEntity>(&self, entity: &E, config: &EntityConfig<E>) {
        let Some(relation) = config.parent() else {
            return;
        };
        let Some(parent_id) = relation.parent_id(entity) else {
            return;
        };
        match self.registry.parent_table(relation) {
            Some(parent_table) => {
                debug!(parent_table = %parent_table, parent_id = %parent_id, "parent needs bump");
                self.observer.parent_needs_bump(&parent_table, &parent_id);
            }
            None => warn!(
                parent_type = relation.parent_type(),
                "parent type not registered, skipping hierarchy bump"
            ),
        }
    }

    async fn push_full<E: SyncableEntity>(
        &self,
        entity: &E,
        config: &EntityConfig<E>,
        action: OfflineAction,
    ) -> SyncResult<PushOutcome> {
        let session = self.session.current();
        let record = match build_record(entity, config, session.as_deref()) {
            Ok(record) => record,
            Err(e) if e.classify() == ErrorClass::Configuration => return Err(e),
            Err(e) => {
                error!(table = config.table_name(), entity_id = entity.id(), error = %e, "cannot build record, mutation not pushed");
                self.record_failure(&e, |stats| stats.dropped += 1);
                return Ok(PushOutcome::Dropped {
                    reason: e.to_string(),
                });
            }
        };
        self.deliver(E::ENTITY_TYPE, config.table_name(), entity.id(), action, record)
            .await
    }

    async fn deliver(
        &self,
        entity_type: &str,
        table: &str,
        id: &str,
        action: OfflineAction,
        record: WireRecord,
    ) -> SyncResult<PushOutcome> {
        let mut attempt = 0;
        let result = loop {
            match self.write(table, id, action, &record).await {
                Err(e) if e.is_retryable() && attempt + 1 < self.config.retry.max_attempts => {
                    attempt += 1;
                    debug!(table, entity_id = id, attempt, error = %e, "retrying push");
                    tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                }
                other => break other,
            }
        };

        let e = match result {
            Ok(()) => {
                self.supersede_queued(table, id, record.version()?);
                self.stats.write().pushed += 1;
                return Ok(PushOutcome::Pushed);
            }
            Err(e) => e,
        };

        match e.classify() {
            ErrorClass::Configuration => Err(e),
            ErrorClass::Benign => {
                debug!(table, entity_id = id, error = %e, "remote already has this version");
                self.supersede_queued(table, id, record.version()?);
                self.stats.write().duplicates += 1;
                Ok(PushOutcome::Duplicate)
            }
            ErrorClass::Permanent => {
                warn!(table, entity_id = id, error = %e, "push rejected permanently");
                self.record_failure(&e, |stats| stats.rejected += 1);
                if e.needs_reconciliation() {
                    self.signal_regression(entity_type, id, table, &e);
                }
                Ok(PushOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
            ErrorClass::Transient => {
                let payload = match record.encode() {
                    Ok(payload) => payload,
                    Err(encode_error) => {
                        error!(table, entity_id = id, error = %encode_error, "cannot encode record for offline queue");
                        self.record_failure(&e, |stats| stats.dropped += 1);
                        return Ok(PushOutcome::Dropped {
                            reason: encode_error.to_string(),
                        });
                    }
                };
                if let Err(persist_error) = self.queue.enqueue(table, action, Some(payload), id) {
                    warn!(table, entity_id = id, error = %persist_error, "offline queue not persisted");
                }
                debug!(table, entity_id = id, error = %e, "push failed, queued for replay");
                self.record_failure(&e, |stats| stats.queued += 1);
                Ok(PushOutcome::Queued {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Sends one write. A delete is a narrow update of the existing row; if
    /// there is none and `record` carries the full tombstone, it is upserted.
    async fn write(
        &self,
        table: &str,
        id: &str,
        action: OfflineAction,
        record: &WireRecord,
    ) -> SyncResult<()> {
        match action {
            OfflineAction::Insert | OfflineAction::Update => {
                self.push.push_record(table, record.clone()).await
            }
            OfflineAction::Delete => {
                let state = record.version_state()?;
                if self
                    .push
                    .update_tombstone(id, state.version, state.deleted, table)
                    .await?
                {
                    return Ok(());
                }
                if is_narrow(record) {
                    debug!(table, entity_id = id, "no remote row to tombstone");
                    return Ok(());
                }
                debug!(table, entity_id = id, "no remote row, upserting full tombstone");
                self.push.push_record(table, record.clone()).await
            }
        }
    }

    fn supersede_queued(&self, table: &str, id: &str, version: u64) {
        if let Err(e) = self.queue.supersede(table, id, version) {
            warn!(table, entity_id = id, error = %e, "offline queue not persisted");
        }
    }

    fn signal_regression(&self, entity_type: &str, id: &str, table: &str, e: &SyncError) {
        info!(entity_type, entity_id = id, table, error = %e, "remote is ahead, reconciliation needed");
        self.stats.write().version_regressions += 1;
        self.observer.version_regression(entity_type, id, table);
    }

    fn record_failure(&self, e: &SyncError, count: impl FnOnce(&mut SyncStats)) {
        let mut stats = self.stats.write();
        count(&mut *stats);
        stats.last_error = Some(e.to_string());
    }
}

fn is_narrow(record: &WireRecord) -> bool {
    record.iter().all(|(column, _)| {
        [ID_COLUMN, VERSION_COLUMN, DELETED_COLUMN, UPDATED_AT_COLUMN].contains(&column.as_str())
    })
}

impl<R, L> std::fmt::Debug for SyncEngine<R, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}
