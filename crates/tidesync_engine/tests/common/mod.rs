//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use tidesync_engine::{
    ConflictRules, EntityConfig, EntityRegistry, FieldMapping, MemoryLocalStore,
    MemoryRemoteStore, ParentRelation, RecordingObserver, RetryConfig, SyncConfig, SyncEngine,
    SyncableEntity,
};

pub const APP_SECRET: &[u8] = b"integration-test-secret";
pub const USER: &str = "user-1";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Folder {
    pub id: String,
    pub version: u64,
    pub deleted: bool,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Note {
    pub id: String,
    pub version: u64,
    pub deleted: bool,
    pub folder_id: Option<String>,
    pub title: String,
    pub body: String,
    pub pinned: bool,
}

impl SyncableEntity for Folder {
    const ENTITY_TYPE: &'static str = "Folder";

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

impl SyncableEntity for Note {
    const ENTITY_TYPE: &'static str = "Note";

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

pub fn folder(id: &str, name: &str) -> Folder {
    Folder {
        id: id.into(),
        version: 1,
        name: name.into(),
        ..Folder::default()
    }
}

pub fn note(id: &str, folder_id: Option<&str>, title: &str, body: &str) -> Note {
    Note {
        id: id.into(),
        version: 1,
        folder_id: folder_id.map(str::to_owned),
        title: title.into(),
        body: body.into(),
        ..Note::default()
    }
}

/// Registers `Folder` on `folders` and `Note` on `notes`.
///
/// Notes are user-scoped, keep a non-empty title, encrypt the body and
/// signal their folder on every change.
pub fn registry() -> Arc<EntityRegistry> {
    let registry = Arc::new(EntityRegistry::new());
    registry
        .register(
            EntityConfig::<Folder>::new("folders")
                .field(FieldMapping::text("name", "name", |f: &Folder| f.name.clone(), |f, v| f.name = v))
                .owned_by("user_id")
                .with_factory(|id| Folder {
                    id: id.to_string(),
                    ..Folder::default()
                }),
        )
        .unwrap();
    registry
        .register(
            EntityConfig::<Note>::new("notes")
                .field(
                    FieldMapping::text("title", "title", |n: &Note| n.title.clone(), |n, v| n.title = v)
                        .reject_if_empty(),
                )
                .field(
                    FieldMapping::text("body", "body", |n: &Note| n.body.clone(), |n, v| n.body = v)
                        .encrypted(),
                )
                .field(FieldMapping::boolean("is_pinned", "pinned", |n: &Note| n.pinned, |n, v| n.pinned = v))
                .field(FieldMapping::optional_text(
                    "folder_id",
                    "folder_id",
                    |n: &Note| n.folder_id.clone(),
                    |n, v| n.folder_id = v,
                ))
                .owned_by("user_id")
                .with_conflict_rules(ConflictRules::new().protect_non_empty_content())
                .with_parent(ParentRelation::new::<Folder, _>(|n: &Note| n.folder_id.clone()))
                .with_factory(|id| Note {
                    id: id.to_string(),
                    ..Note::default()
                }),
        )
        .unwrap();
    registry
}

pub type Engine = SyncEngine<MemoryRemoteStore, MemoryLocalStore>;

pub struct Device {
    pub engine: Arc<Engine>,
    pub observer: Arc<RecordingObserver>,
}

impl Device {
    pub fn local(&self) -> &Arc<MemoryLocalStore> {
        self.engine.local()
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::new()
        .with_user(USER)
        .with_app_secret(APP_SECRET)
        .with_retry(RetryConfig::no_retry())
}

/// One device connected to `remote`.
pub fn device(remote: &Arc<MemoryRemoteStore>) -> Device {
    device_with(remote, config())
}

pub fn device_with(remote: &Arc<MemoryRemoteStore>, config: SyncConfig) -> Device {
    let observer = Arc::new(RecordingObserver::new());
    let engine = Arc::new(SyncEngine::new(
        config,
        registry(),
        Arc::clone(remote),
        Arc::new(MemoryLocalStore::new()),
        observer.clone(),
    ));
    Device { engine, observer }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
