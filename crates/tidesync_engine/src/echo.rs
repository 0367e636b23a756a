//! Suppression of our own writes coming back over the realtime channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default echo window.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Remembers which `(table, id)` pairs this process pushed recently.
///
/// The realtime channel carries no origin, so every push comes back as a
/// change event. An entry lives for the echo window; stale entries are
/// evicted lazily on access.
#[derive(Debug)]
pub struct EchoTracker {
    window: Duration,
    pushed: Mutex<HashMap<(String, String), Instant>>,
}

impl EchoTracker {
    /// Creates a tracker with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pushed: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `id` in `table` is about to be pushed.
    pub fn mark_as_pushed(&self, id: &str, table: &str) {
        let now = Instant::now();
        let mut pushed = self.pushed.lock();
        pushed.retain(|_, at| now.duration_since(*at) < self.window);
        pushed.insert((table.to_string(), id.to_string()), now);
    }

    /// Returns true if `id` in `table` was pushed within the window.
    pub fn was_pushed_recently(&self, id: &str, table: &str) -> bool {
        let key = (table.to_string(), id.to_string());
        let mut pushed = self.pushed.lock();
        match pushed.get(&key) {
            Some(at) if at.elapsed() < self.window => true,
            Some(_) => {
                pushed.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Number of tracked entries, including ones not yet evicted.
    pub fn len(&self) -> usize {
        self.pushed.lock().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Echo window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for EchoTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_WINDOW)
    }
}
