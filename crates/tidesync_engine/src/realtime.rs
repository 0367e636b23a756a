//! Realtime change routing.

use crate::echo::EchoTracker;
use crate::error::SyncResult;
use crate::notifier::DebouncedNotifier;
use crate::registry::EntityRegistry;
use crate::remote::ChangeStream;
use async_trait::async_trait;
use std::sync::Arc;
use tidesync_protocol::ChangeEvent;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Application hook that applies a remote change locally.
///
/// Implementations usually look up the local entity and call
/// `SyncEngine::merge_remote` or `SyncEngine::materialize`.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Applies one change event.
    async fn apply_change(&self, event: ChangeEvent) -> SyncResult<()>;
}

/// What happened to one routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the sink.
    Delivered,
    /// Our own write; dropped.
    Echo,
    /// No registered entity type for the table, or no row image.
    Unroutable,
    /// The sink returned an error.
    Failed,
}

/// Consumes change streams and forwards foreign changes to a sink.
pub struct RealtimeRouter<S> {
    registry: Arc<EntityRegistry>,
    echo: Arc<EchoTracker>,
    notifier: Arc<DebouncedNotifier>,
    sink: Arc<S>,
}

impl<S: ChangeSink + 'static> RealtimeRouter<S> {
    /// Creates a router.
    pub fn new(
        registry: Arc<EntityRegistry>,
        echo: Arc<EchoTracker>,
        notifier: Arc<DebouncedNotifier>,
        sink: Arc<S>,
    ) -> Self {
        Self {
            registry,
            echo,
            notifier,
            sink,
        }
    }

    /// Routes one event.
    pub async fn handle(&self, event: ChangeEvent) -> RouteOutcome {
        let Some(descriptor) = self.registry.descriptor_for_table(&event.table) else {
            warn!(table = %event.table, "change for unregistered table");
            return RouteOutcome::Unroutable;
        };
        let Ok(id) = event.entity_id().map(str::to_owned) else {
            warn!(table = %event.table, "change without row image");
            return RouteOutcome::Unroutable;
        };

        if self.echo.was_pushed_recently(&id, &event.table) {
            debug!(table = %event.table, entity_id = %id, "dropping realtime echo");
            return RouteOutcome::Echo;
        }

        let table = event.table.clone();
        match self.sink.apply_change(event).await {
            Ok(()) => {
                self.notifier.post(descriptor.entity_type());
                RouteOutcome::Delivered
            }
            Err(e) => {
                warn!(table = %table, entity_id = %id, error = %e, "failed to apply realtime change");
                RouteOutcome::Failed
            }
        }
    }

    /// Routes events until the stream closes. Returns how many were
    /// delivered.
    pub async fn run(&self, mut stream: ChangeStream) -> usize {
        let mut delivered = 0;
        while let Some(event) = stream.recv().await {
            if self.handle(event).await == RouteOutcome::Delivered {
                delivered += 1;
            }
        }
        info!(delivered, "realtime stream closed");
        delivered
    }

    /// Runs the router on a background task.
    pub fn spawn(self: Arc<Self>, stream: ChangeStream) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run(stream).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SyncableEntity;
    use crate::error::SyncError;
    use crate::observer::RecordingObserver;
    use crate::registry::EntityConfig;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tidesync_protocol::{WireRecord, ID_COLUMN};

    #[derive(Debug, Clone)]
    struct Pin {
        id: String,
        version: u64,
        deleted: bool,
    }

    impl SyncableEntity for Pin {
        const ENTITY_TYPE: &'static str = "Pin";
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

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChangeSink for CollectingSink {
        async fn apply_change(&self, event: ChangeEvent) -> SyncResult<()> {
            let id = event.entity_id()?.to_string();
            if id == "broken" {
                return Err(SyncError::local_store("disk full"));
            }
            self.seen.lock().push(id);
            Ok(())
        }
    }

    fn router() -> (RealtimeRouter<CollectingSink>, Arc<EchoTracker>, Arc<CollectingSink>) {
        let registry = Arc::new(EntityRegistry::new());
        registry.register(EntityConfig::<Pin>::new("pins")).unwrap();
        let echo = Arc::new(EchoTracker::default());
        let observer = Arc::new(RecordingObserver::new());
        let notifier = Arc::new(DebouncedNotifier::new(Duration::from_millis(10), observer));
        let sink = Arc::new(CollectingSink::default());
        (
            RealtimeRouter::new(registry, echo.clone(), notifier, sink.clone()),
            echo,
            sink,
        )
    }

    fn event(table: &str, id: &str) -> ChangeEvent {
        ChangeEvent::insert(table, WireRecord::new().with(ID_COLUMN, id))
    }

    #[tokio::test]
    async fn routes_foreign_changes_and_drops_echoes() {
        let (router, echo, sink) = router();
        echo.mark_as_pushed("mine", "pins");

        assert_eq!(router.handle(event("pins", "theirs")).await, RouteOutcome::Delivered);
        assert_eq!(router.handle(event("pins", "mine")).await, RouteOutcome::Echo);
        assert_eq!(router.handle(event("other", "x")).await, RouteOutcome::Unroutable);
        assert_eq!(router.handle(event("pins", "broken")).await, RouteOutcome::Failed);

        assert_eq!(sink.seen.lock().clone(), vec!["theirs"]);
    }

    #[tokio::test]
    async fn run_drains_stream() {
        let (router, _, sink) = router();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(event("pins", "a")).await.unwrap();
        tx.send(event("pins", "b")).await.unwrap();
        drop(tx);

        assert_eq!(router.run(rx).await, 2);
        assert_eq!(sink.seen.lock().len(), 2);
    }
}
