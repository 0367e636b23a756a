//! Local store abstraction.

use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tidesync_protocol::VersionState;

/// The application's local persistence.
///
/// `save` stages an entity; `commit` makes every staged change durable.
/// The engine always commits before it pushes.
pub trait LocalStore: Send + Sync {
    /// Stages the current state of `entity`.
    fn save<E: SyncableEntity>(&self, entity: &E) -> SyncResult<()>;

    /// Durably persists everything staged so far.
    fn commit(&self) -> SyncResult<()>;
}

struct StoredEntity {
    state: VersionState,
    value: Box<dyn Any + Send + Sync>,
}

type EntityKey = (&'static str, String);

/// In-memory local store for testing.
#[derive(Default)]
pub struct MemoryLocalStore {
    staged: Mutex<Vec<(EntityKey, StoredEntity)>>,
    committed: Mutex<HashMap<EntityKey, StoredEntity>>,
    commits: AtomicUsize,
    fail_next_commit: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed copy of an entity.
    pub fn get<E: SyncableEntity>(&self, id: &str) -> Option<E> {
        self.committed
            .lock()
            .get(&(E::ENTITY_TYPE, id.to_string()))
            .and_then(|stored| stored.value.downcast_ref::<E>())
            .cloned()
    }

    /// Returns every committed entity of type `E`, ordered by ID.
    pub fn all<E: SyncableEntity>(&self) -> Vec<E> {
        let mut all: Vec<E> = self
            .committed
            .lock()
            .iter()
            .filter(|((entity_type, _), _)| *entity_type == E::ENTITY_TYPE)
            .filter_map(|(_, stored)| stored.value.downcast_ref::<E>().cloned())
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Returns the committed `(version, deleted)` projection of one type.
    pub fn version_states(&self, entity_type: &str) -> HashMap<String, VersionState> {
        self.committed
            .lock()
            .iter()
            .filter(|((kind, _), _)| *kind == entity_type)
            .map(|((_, id), stored)| (id.clone(), stored.state))
            .collect()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of staged, uncommitted saves.
    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    /// Makes the next `commit` fail.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl LocalStore for MemoryLocalStore {
    fn save<E: SyncableEntity>(&self, entity: &E) -> SyncResult<()> {
        self.staged.lock().push((
            (E::ENTITY_TYPE, entity.id().to_string()),
            StoredEntity {
                state: entity.version_state(),
                value: Box::new(entity.clone()),
            },
        ));
        Ok(())
    }

    fn commit(&self) -> SyncResult<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(SyncError::local_store("commit failed"));
        }
        let staged = std::mem::take(&mut *self.staged.lock());
        self.committed.lock().extend(staged);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocalStore")
            .field("committed", &self.committed.lock().len())
            .field("staged", &self.staged_count())
            .field("commits", &self.commit_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: String,
        version: u64,
        deleted: bool,
    }

    impl SyncableEntity for Tag {
        const ENTITY_TYPE: &'static str = "Tag";
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
        fn is_deleted(&self) -> bool {
            self.deleted
        }
        fn set_deleted(&mut self, deleted: bool) {
            self.deleted = deleted;
        }
    }

    fn tag(id: &str, version: u64) -> Tag {
        Tag {
            id: id.into(),
            version,
            deleted: false,
        }
    }

    #[test]
    fn save_is_invisible_until_commit() {
        let store = MemoryLocalStore::new();
        store.save(&tag("t1", 1)).unwrap();
        assert!(store.get::<Tag>("t1").is_none());
        assert_eq!(store.staged_count(), 1);

        store.commit().unwrap();
        assert_eq!(store.get::<Tag>("t1"), Some(tag("t1", 1)));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn later_save_wins() {
        let store = MemoryLocalStore::new();
        store.save(&tag("t1", 1)).unwrap();
        store.save(&tag("t1", 2)).unwrap();
        store.save(&tag("t2", 7)).unwrap();
        store.commit().unwrap();

        let states = store.version_states("Tag");
        assert_eq!(states["t1"], VersionState::new(2, false));
        assert_eq!(states["t2"], VersionState::new(7, false));
        assert_eq!(store.all::<Tag>().len(), 2);
    }

    #[test]
    fn failed_commit_keeps_staged() {
        let store = MemoryLocalStore::new();
        store.save(&tag("t1", 1)).unwrap();
        store.fail_next_commit();
        assert!(store.commit().is_err());
        assert_eq!(store.staged_count(), 1);

        store.commit().unwrap();
        assert!(store.get::<Tag>("t1").is_some());
    }
}
