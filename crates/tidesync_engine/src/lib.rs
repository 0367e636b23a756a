//! # tidesync engine
//!
//! Client-side, offline-first record sync.
//!
//! Local entities are the source of truth for the UI. Every mutation is
//! committed locally first and then pushed to a remote table store; a
//! failed push lands in a durable offline queue and is replayed later.
//! Incoming rows are merged with a version/tombstone resolver, and a
//! reconciliation pass heals whatever realtime delivery missed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SyncEngine                        │
//! │  create / update / delete / undelete / bump_hierarchy    │
//! ├──────────────┬──────────────┬──────────────┬─────────────┤
//! │  PushEngine  │  PullEngine  │ OfflineQueue │ Reconciler  │
//! ├──────────────┴──────┬───────┴──────────────┴─────────────┤
//! │     EchoTracker     │  DebouncedNotifier → SyncObserver  │
//! ├─────────────────────┴────────────────────────────────────┤
//! │       EntityRegistry (field maps, rules, parents)        │
//! ├──────────────────────────────┬───────────────────────────┤
//! │   RemoteStore (async trait)  │   LocalStore (trait)      │
//! └──────────────────────────────┴───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidesync_engine::{
//!     EntityConfig, EntityRegistry, FieldMapping, MemoryLocalStore, MemoryRemoteStore,
//!     NoopObserver, SyncConfig, SyncEngine,
//! };
//!
//! let registry = Arc::new(EntityRegistry::new());
//! registry.register(
//!     EntityConfig::<Note>::new("notes")
//!         .field(FieldMapping::text("title", "title", |n: &Note| n.title.clone(), |n, v| n.title = v))
//!         .owned_by("user_id"),
//! )?;
//!
//! let engine = SyncEngine::new(
//!     SyncConfig::new().with_user("user-1"),
//!     registry,
//!     Arc::new(MemoryRemoteStore::new()),
//!     Arc::new(MemoryLocalStore::new()),
//!     Arc::new(NoopObserver),
//! );
//! engine.create(&note).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod echo;
mod entity;
mod error;
mod local;
mod merge;
mod notifier;
mod observer;
mod push;
mod queue;
mod realtime;
mod reconcile;
mod registry;
mod remote;
mod session;

pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{PushOutcome, SyncEngine, SyncStats};
pub use echo::{EchoTracker, DEFAULT_ECHO_WINDOW};
pub use entity::SyncableEntity;
pub use error::{ErrorClass, SyncError, SyncResult};
pub use local::{LocalStore, MemoryLocalStore};
pub use merge::{MergeOutcome, PullEngine, RejectReason, SkipReason};
pub use notifier::DebouncedNotifier;
pub use observer::{NoopObserver, RecordingObserver, SyncNotification, SyncObserver};
pub use push::{build_record, tombstone_record, PushEngine};
pub use queue::OfflineQueue;
pub use realtime::{ChangeSink, RealtimeRouter, RouteOutcome};
pub use reconcile::{
    diff_states, DeletionDrift, ReconcileOutcome, ReconciliationDelegate,
    ReconciliationReport, ReconciliationService, TableDiff, TableSummary,
};
pub use registry::{
    ConflictRules, EntityConfig, EntityDescriptor, EntityRegistry, FieldMapping,
    ParentRelation,
};
pub use remote::{ChangeStream, ColumnFilter, MemoryRemoteStore, RemoteStore, CHANGE_STREAM_CAPACITY};
pub use session::{SessionCell, SyncSession};

pub use tidesync_crypto::FieldCipher;
pub use tidesync_protocol::{
    ChangeEvent, ChangeKind, OfflineAction, OfflineOperation, SyncAction, VersionState,
    WireRecord, WireValue,
};
