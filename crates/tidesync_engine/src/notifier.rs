//! Debounced change notifications.

use crate::observer::SyncObserver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

type Pending = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

/// Coalesces bursts of change notifications per entity type.
///
/// Posting starts a timer; posting the same key again before it fires
/// restarts it. The observer hears about a key once per quiet period.
pub struct DebouncedNotifier {
    delay: Duration,
    observer: Arc<dyn SyncObserver>,
    pending: Pending,
    generation: AtomicU64,
}

impl DebouncedNotifier {
    /// Creates a notifier that reports to `observer` after `delay`.
    pub fn new(delay: Duration, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            delay,
            observer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedules `entities_changed(entity_type)`, restarting its timer.
    ///
    /// Outside a tokio runtime the notification is delivered immediately.
    pub fn post(&self, entity_type: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(entity_type, "no runtime, notifying immediately");
            self.observer.entities_changed(entity_type);
            return;
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key = entity_type.to_string();
        let pending = Arc::clone(&self.pending);
        let observer = Arc::clone(&self.observer);
        // The quiet period starts now, not when the task is first polled.
        let deadline = tokio::time::Instant::now() + self.delay;

        // Hold the lock across spawn so the task cannot fire before its
        // entry is in the map.
        let mut map = self.pending.lock();
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut map = pending.lock();
                match map.get(&task_key) {
                    Some((current, _)) if *current == generation => {
                        map.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                observer.entities_changed(&task_key);
            }
        });
        if let Some((_, previous)) = map.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    /// Cancels a pending notification. A no-op if it already fired.
    pub fn cancel(&self, entity_type: &str) {
        if let Some((_, handle)) = self.pending.lock().remove(entity_type) {
            handle.abort();
        }
    }

    /// Returns true if a notification for `entity_type` is waiting.
    pub fn is_pending(&self, entity_type: &str) -> bool {
        self.pending.lock().contains_key(entity_type)
    }

    /// Quiet period.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for DebouncedNotifier {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.pending.lock().drain() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for DebouncedNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedNotifier")
            .field("delay", &self.delay)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
