//! The contract every synced entity type implements.

use tidesync_protocol::VersionState;

/// A locally stored entity that participates in sync.
///
/// Version and tombstone state belong to the engine: application code
/// reads them freely but changes them only through `SyncEngine` mutations
/// (`update`, `delete`, `undelete`, `bump_hierarchy`) or remote merges.
/// A plain write to `set_deleted(false)` would resurrect a tombstone
/// without the undelete jump and be reverted by the next sync.
pub trait SyncableEntity: Clone + Send + Sync + 'static {
    /// Stable type key, used by the registry and in notifications.
    const ENTITY_TYPE: &'static str;

    /// Primary key, shared with the remote row.
    fn id(&self) -> &str;

    /// Current version.
    fn version(&self) -> u64;

    /// Overwrites the version.
    fn set_version(&mut self, version: u64);

    /// Tombstone flag.
    fn is_deleted(&self) -> bool;

    /// Overwrites the tombstone flag.
    fn set_deleted(&mut self, deleted: bool);

    /// Returns the comparable version state.
    fn version_state(&self) -> VersionState {
        VersionState::new(self.version(), self.is_deleted())
    }

    /// Overwrites version and tombstone flag together.
    fn set_version_state(&mut self, state: VersionState) {
        self.set_version(state.version);
        self.set_deleted(state.deleted);
    }
}
