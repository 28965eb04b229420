//! Configuration for the bus, publisher and realtime layers.
//!
//! Every struct has sensible defaults and a `from_env()` constructor reading
//! `HRMS_*` variables; unparsable values fall back to the default and are
//! caught by `validate()` only when they are out of range.

use std::str::FromStr;
use std::time::Duration;

use hrms_core::{DomainError, DomainResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Run matching handlers concurrently (`true`) or one by one in priority order.
    pub enable_async_processing: bool,
    /// Failures tolerated per subscription before it is paused.
    pub max_retries: u32,
    /// Delay between scheduled-event retry attempts.
    pub retry_delay: Duration,
    /// Persist every published event before dispatch.
    pub enable_event_store: bool,
    pub enable_metrics: bool,
    /// Keep exhausted scheduled events and auto-paused deliveries in a queryable queue.
    pub dead_letter_queue: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_async_processing: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            enable_event_store: true,
            enable_metrics: true,
            dead_letter_queue: false,
        }
    }
}

impl EventBusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enable_async_processing: env_or("HRMS_BUS_ASYNC", d.enable_async_processing),
            max_retries: env_or("HRMS_BUS_MAX_RETRIES", d.max_retries),
            retry_delay: Duration::from_millis(env_or(
                "HRMS_BUS_RETRY_DELAY_MS",
                d.retry_delay.as_millis() as u64,
            )),
            enable_event_store: env_or("HRMS_BUS_EVENT_STORE", d.enable_event_store),
            enable_metrics: env_or("HRMS_BUS_METRICS", d.enable_metrics),
            dead_letter_queue: env_or("HRMS_BUS_DEAD_LETTER_QUEUE", d.dead_letter_queue),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retries == 0 {
            return Err(DomainError::validation("bus max_retries must be at least 1"));
        }
        Ok(())
    }

    pub fn sequential(mut self) -> Self {
        self.enable_async_processing = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn without_event_store(mut self) -> Self {
        self.enable_event_store = false;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn with_dead_letter_queue(mut self, enabled: bool) -> Self {
        self.dead_letter_queue = enabled;
        self
    }
}

/// Event publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Chunk size of `publish_batch`.
    pub max_batch_size: usize,
    /// Retries of a scheduled event when the caller does not say otherwise.
    pub default_schedule_retries: u32,
    /// Flush a transaction buffer this long after its first event, without an
    /// explicit commit. `None` means only `commit_transaction` flushes.
    pub outbox_auto_commit: Option<Duration>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            default_schedule_retries: 3,
            outbox_auto_commit: None,
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let auto_commit_ms: u64 = env_or("HRMS_OUTBOX_AUTO_COMMIT_MS", 0);
        Self {
            max_batch_size: env_or("HRMS_PUBLISHER_MAX_BATCH_SIZE", d.max_batch_size),
            default_schedule_retries: env_or(
                "HRMS_PUBLISHER_SCHEDULE_RETRIES",
                d.default_schedule_retries,
            ),
            outbox_auto_commit: (auto_commit_ms > 0).then(|| Duration::from_millis(auto_commit_ms)),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_batch_size == 0 {
            return Err(DomainError::validation("publisher max_batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_outbox_auto_commit(mut self, after: Duration) -> Self {
        self.outbox_auto_commit = Some(after);
        self
    }
}

/// Realtime publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Broadcast history is trimmed once it grows past this many entries...
    pub history_capacity: usize,
    /// ...down to this many most recent ones.
    pub history_retain: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            history_retain: 500,
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            history_capacity: env_or("HRMS_REALTIME_HISTORY_CAPACITY", d.history_capacity),
            history_retain: env_or("HRMS_REALTIME_HISTORY_RETAIN", d.history_retain),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.history_retain > self.history_capacity {
            return Err(DomainError::validation(format!(
                "realtime history_retain ({}) exceeds history_capacity ({})",
                self.history_retain, self.history_capacity
            )));
        }
        Ok(())
    }
}
