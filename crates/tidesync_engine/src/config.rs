//! Configuration for the sync engine.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tidesync_protocol::DEFAULT_UNDELETE_DELTA;

/// Configuration for sync operations.
#[derive(Clone)]
pub struct SyncConfig {
    /// Acting user; scopes owner columns and selects the field key.
    pub user_id: Option<String>,
    /// Input key material for per-user field keys.
    pub app_secret: Option<Vec<u8>>,
    /// Offline queue file. `None` keeps the queue in memory.
    pub queue_path: Option<PathBuf>,
    /// Maximum records per batch upsert.
    pub push_batch_size: usize,
    /// How long a pushed entity is treated as an echo.
    pub echo_window: Duration,
    /// Quiet period before a change notification fires.
    pub debounce_delay: Duration,
    /// Minimum time between unforced reconciliations.
    pub reconcile_min_interval: Duration,
    /// Period of the background reconciliation timer.
    pub reconcile_interval: Duration,
    /// Version jump required to clear a tombstone.
    pub undelete_delta: u64,
    /// Inline retry behavior for pushes.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default settings and no user.
    pub fn new() -> Self {
        Self {
            user_id: None,
            app_secret: None,
            queue_path: None,
            push_batch_size: 50,
            echo_window: Duration::from_secs(5),
            debounce_delay: Duration::from_millis(500),
            reconcile_min_interval: Duration::from_secs(5 * 60),
            reconcile_interval: Duration::from_secs(15 * 60),
            undelete_delta: DEFAULT_UNDELETE_DELTA,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the acting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the application secret used for key derivation.
    pub fn with_app_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    /// Persists the offline queue at `path`.
    pub fn with_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the echo window.
    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Sets the debounce delay.
    pub fn with_debounce_delay(mut self, delay: Duration) -> Self {
        self.debounce_delay = delay;
        self
    }

    /// Sets the minimum interval between unforced reconciliations.
    pub fn with_reconcile_min_interval(mut self, interval: Duration) -> Self {
        self.reconcile_min_interval = interval;
        self
    }

    /// Sets the periodic reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Sets the undelete delta.
    pub fn with_undelete_delta(mut self, delta: u64) -> Self {
        self.undelete_delta = delta;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("user_id", &self.user_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("queue_path", &self.queue_path)
            .field("push_batch_size", &self.push_batch_size)
            .field("echo_window", &self.echo_window)
            .field("debounce_delay", &self.debounce_delay)
            .field("reconcile_min_interval", &self.reconcile_min_interval)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("undelete_delta", &self.undelete_delta)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}
