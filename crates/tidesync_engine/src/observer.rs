//! Notifications the engine raises for the application layer.

use parking_lot::Mutex;

/// Receives engine notifications. Every method defaults to a no-op.
pub trait SyncObserver: Send + Sync {
    /// Entities of `entity_type` changed (debounced).
    fn entities_changed(&self, _entity_type: &str) {}

    /// The remote rejected a write because it is ahead of us.
    fn version_regression(&self, _entity_type: &str, _entity_id: &str, _table: &str) {}

    /// A child changed; the application should call `bump_hierarchy` on
    /// the parent.
    fn parent_needs_bump(&self, _parent_table: &str, _parent_id: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// A recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    /// See [`SyncObserver::entities_changed`].
    EntitiesChanged {
        /// Entity type.
        entity_type: String,
    },
    /// See [`SyncObserver::version_regression`].
    VersionRegression {
        /// Entity type.
        entity_type: String,
        /// Entity ID.
        entity_id: String,
        /// Remote table.
        table: String,
    },
    /// See [`SyncObserver::parent_needs_bump`].
    ParentNeedsBump {
        /// Parent table.
        parent_table: String,
        /// Parent ID.
        parent_id: String,
    },
}

/// Observer that records every notification, for tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    notifications: Mutex<Vec<SyncNotification>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything recorded so far.
    pub fn notifications(&self) -> Vec<SyncNotification> {
        self.notifications.lock().clone()
    }

    /// Number of `entities_changed` calls for `entity_type`.
    pub fn changes_for(&self, entity_type: &str) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| {
                matches!(n, SyncNotification::EntitiesChanged { entity_type: t } if t == entity_type)
            })
            .count()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.notifications.lock().clear();
    }

    fn record(&self, notification: SyncNotification) {
        self.notifications.lock().push(notification);
    }
}

impl SyncObserver for RecordingObserver {
    fn entities_changed(&self, entity_type: &str) {
        self.record(SyncNotification::EntitiesChanged {
            entity_type: entity_type.to_string(),
        });
    }

    fn version_regression(&self, entity_type: &str, entity_id: &str, table: &str) {
        self.record(SyncNotification::VersionRegression {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            table: table.to_string(),
        });
    }

    fn parent_needs_bump(&self, parent_table: &str, parent_id: &str) {
        self.record(SyncNotification::ParentNeedsBump {
            parent_table: parent_table.to_string(),
            parent_id: parent_id.to_string(),
        });
    }
}
