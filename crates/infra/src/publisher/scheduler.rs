//! Delayed publishing.
//!
//! Each scheduled event is a spawned task that waits for its delay or its
//! cancellation token, whichever comes first. A failed publish re-arms the
//! task after `retry_delay` until the retry budget is spent; the event is then
//! dropped with an error log, or dead-lettered when the queue is enabled.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hrms_core::ScheduleId;
use hrms_events::{DomainEvent, EventMetadata, PublishContext};

use super::{EventPublisher, PublishError, failure_reason};
use crate::dead_letter::{DeadLetterEntry, DeadLetterSource};
use crate::event_store::PersistenceError;

/// Options of [`EventPublisher::schedule_event`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub delay: Duration,
    /// Defaults to `PublisherConfig::default_schedule_retries`.
    pub max_retries: Option<u32>,
    /// Defaults to `EventBusConfig::retry_delay`.
    pub retry_delay: Option<Duration>,
    /// Write the schedule to the configured `ScheduleStore` so it can be
    /// recovered after a restart.
    pub enable_persistence: bool,
}

impl ScheduleOptions {
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.enable_persistence = true;
        self
    }
}

/// A pending scheduled publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: ScheduleId,
    pub event: DomainEvent,
    pub context: PublishContext,
    pub metadata: Option<EventMetadata>,
    /// Next planned attempt.
    pub fire_at: DateTime<Utc>,
    pub retries_left: u32,
    pub retry_delay: Duration,
    /// Failed attempts so far.
    pub attempts: u32,
    pub persistent: bool,
}

/// Durable home of persistent schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace.
    async fn persist(&self, scheduled: &ScheduledEvent) -> Result<(), PersistenceError>;

    async fn remove(&self, id: ScheduleId) -> Result<(), PersistenceError>;

    async fn load_all(&self) -> Result<Vec<ScheduledEvent>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    entries: RwLock<HashMap<ScheduleId, ScheduledEvent>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn persist(&self, scheduled: &ScheduledEvent) -> Result<(), PersistenceError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))?;
        entries.insert(scheduled.id, scheduled.clone());
        Ok(())
    }

    async fn remove(&self, id: ScheduleId) -> Result<(), PersistenceError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))?;
        entries.remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ScheduledEvent>, PersistenceError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| PersistenceError::Storage("lock poisoned".to_string()))?;
        let mut all: Vec<ScheduledEvent> = entries.values().cloned().collect();
        all.sort_by_key(|s| s.fire_at);
        Ok(all)
    }
}

/// A schedule with a live timer task.
pub(super) struct Armed {
    scheduled: ScheduledEvent,
    token: CancellationToken,
}

enum Next {
    Retry(Duration, Option<ScheduledEvent>),
    Exhausted(ScheduledEvent),
}

impl EventPublisher {
    /// Publish `event` after `options.delay`; requires a tokio runtime.
    pub async fn schedule_event(
        &self,
        event: DomainEvent,
        options: ScheduleOptions,
        context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> Result<ScheduleId, PublishError> {
        let handle = Handle::try_current().map_err(|_| PublishError::NoRuntime("schedule_event"))?;
        let delay = chrono::Duration::from_std(options.delay)
            .map_err(|_| PublishError::Schedule(format!("delay {:?} out of range", options.delay)))?;

        let scheduled = ScheduledEvent {
            id: ScheduleId::new(),
            event,
            context,
            metadata,
            fire_at: Utc::now() + delay,
            retries_left: options
                .max_retries
                .unwrap_or(self.inner.config.default_schedule_retries),
            retry_delay: options
                .retry_delay
                .unwrap_or(self.inner.bus.config().retry_delay),
            attempts: 0,
            persistent: options.enable_persistence,
        };

        if scheduled.persistent {
            match &self.inner.schedule_store {
                Some(store) => store.persist(&scheduled).await?,
                None => warn!(
                    schedule_id = %scheduled.id,
                    "schedule persistence requested but no schedule store is configured"
                ),
            }
        }

        let id = scheduled.id;
        info!(
            schedule_id = %id,
            event_type = scheduled.event.event_type(),
            fire_at = %scheduled.fire_at,
            retries = scheduled.retries_left,
            "event scheduled"
        );
        self.arm(&handle, scheduled, options.delay);
        Ok(id)
    }

    /// Cancel a pending schedule. Returns `false` if it already fired, was
    /// cancelled, or never existed.
    pub async fn cancel_scheduled_event(&self, id: ScheduleId) -> bool {
        let Some(armed) = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        else {
            return false;
        };
        armed.token.cancel();
        if armed.scheduled.persistent {
            self.forget_persisted(id).await;
        }
        info!(schedule_id = %id, "scheduled event cancelled");
        true
    }

    /// Re-arm every schedule found in the schedule store that is not already
    /// pending. Overdue schedules fire immediately.
    pub async fn recover_scheduled_events(&self) -> Result<usize, PublishError> {
        let Some(store) = &self.inner.schedule_store else {
            return Ok(0);
        };
        let handle =
            Handle::try_current().map_err(|_| PublishError::NoRuntime("recover_scheduled_events"))?;

        let mut recovered = 0;
        for scheduled in store.load_all().await? {
            if self.is_armed(scheduled.id) {
                continue;
            }
            let delay = (scheduled.fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.arm(&handle, scheduled, delay);
            recovered += 1;
        }
        info!(recovered, "scheduled events recovered");
        Ok(recovered)
    }

    /// Pending schedules, soonest first.
    pub fn list_scheduled(&self) -> Vec<ScheduledEvent> {
        let mut pending: Vec<ScheduledEvent> = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|a| a.scheduled.clone())
            .collect();
        pending.sort_by_key(|s| s.fire_at);
        pending
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_armed(&self, id: ScheduleId) -> bool {
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn arm(&self, handle: &Handle, scheduled: ScheduledEvent, delay: Duration) {
        let id = scheduled.id;
        let token = CancellationToken::new();
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Armed {
                    scheduled,
                    token: token.clone(),
                },
            );

        let publisher = self.clone();
        handle.spawn(async move { publisher.run_schedule(id, token, delay).await });
    }

    async fn run_schedule(self, id: ScheduleId, token: CancellationToken, mut delay: Duration) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(schedule_id = %id, "schedule timer stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(scheduled) = self.pending(id) else {
                return;
            };
            let result = self
                .publish(&scheduled.event, scheduled.context.clone(), scheduled.metadata.clone())
                .await;

            if result.success {
                self.take_schedule(id);
                if scheduled.persistent {
                    self.forget_persisted(id).await;
                }
                info!(
                    schedule_id = %id,
                    event_id = %scheduled.event.id(),
                    attempts = scheduled.attempts + 1,
                    "scheduled event published"
                );
                return;
            }

            let reason = failure_reason(&result);
            match self.record_attempt(id) {
                None => return,
                Some(Next::Retry(retry_delay, persist)) => {
                    warn!(
                        schedule_id = %id,
                        event_id = %scheduled.event.id(),
                        retry_in_ms = retry_delay.as_millis() as u64,
                        error = %reason,
                        "scheduled publish failed; retrying"
                    );
                    if let Some(snapshot) = persist {
                        self.persist_snapshot(&snapshot).await;
                    }
                    delay = retry_delay;
                }
                Some(Next::Exhausted(final_state)) => {
                    self.exhaust(final_state, reason).await;
                    return;
                }
            }
        }
    }

    fn pending(&self, id: ScheduleId) -> Option<ScheduledEvent> {
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|a| a.scheduled.clone())
    }

    fn take_schedule(&self, id: ScheduleId) -> Option<Armed> {
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Count a failed attempt. `None` if the schedule was cancelled meanwhile.
    fn record_attempt(&self, id: ScheduleId) -> Option<Next> {
        let mut schedules = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let armed = schedules.get_mut(&id)?;
        let s = &mut armed.scheduled;
        s.attempts += 1;

        if s.retries_left == 0 {
            let exhausted = schedules.remove(&id).map(|a| a.scheduled)?;
            return Some(Next::Exhausted(exhausted));
        }
        s.retries_left -= 1;
        s.fire_at = Utc::now()
            + chrono::Duration::from_std(s.retry_delay).unwrap_or(chrono::Duration::zero());
        let snapshot = s.persistent.then(|| s.clone());
        Some(Next::Retry(s.retry_delay, snapshot))
    }

    async fn exhaust(&self, scheduled: ScheduledEvent, reason: String) {
        error!(
            schedule_id = %scheduled.id,
            event_id = %scheduled.event.id(),
            event_type = scheduled.event.event_type(),
            attempts = scheduled.attempts,
            error = %reason,
            "scheduled event dropped after exhausting retries"
        );
        if scheduled.persistent {
            self.forget_persisted(scheduled.id).await;
        }
        if let Some(queue) = self.inner.bus.dead_letters() {
            queue.push(DeadLetterEntry::new(
                scheduled.event,
                scheduled.metadata.unwrap_or_default(),
                scheduled.context,
                reason,
                DeadLetterSource::Schedule {
                    schedule_id: scheduled.id,
                    attempts: scheduled.attempts,
                },
            ));
        }
    }

    async fn persist_snapshot(&self, scheduled: &ScheduledEvent) {
        if let Some(store) = &self.inner.schedule_store {
            if let Err(err) = store.persist(scheduled).await {
                warn!(schedule_id = %scheduled.id, error = %err, "failed to persist schedule");
            }
        }
    }

    async fn forget_persisted(&self, id: ScheduleId) {
        if let Some(store) = &self.inner.schedule_store {
            if let Err(err) = store.remove(id).await {
                warn!(schedule_id = %id, error = %err, "failed to remove persisted schedule");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hrms_events::{FnHandler, HandlerError, SubscriptionOptions};

    use super::*;
    use crate::config::{EventBusConfig, PublisherConfig};
    use crate::event_bus::EventBus;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::publisher::tests::alert;

    fn bus_with_counter(fail_first: usize) -> (Arc<EventBus>, Arc<AtomicUsize>) {
        let bus = Arc::new(EventBus::new(
            EventBusConfig::default()
                .without_event_store()
                .with_max_retries(100)
                .with_dead_letter_queue(true),
            None,
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("bank-export", move |_, _| {
                if c.fetch_add(1, Ordering::SeqCst) < fail_first {
                    Err(HandlerError::transient("bank gateway timeout"))
                } else {
                    Ok(())
                }
            })),
            SubscriptionOptions::new(),
        );
        (bus, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (bus, calls) = bus_with_counter(0);
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        publisher
            .schedule_event(alert("x"), ScheduleOptions::after(Duration::from_secs(5)), PublishContext::new(), None)
            .await
            .unwrap();
        assert_eq!(publisher.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.scheduled_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_prevents_publish_and_is_idempotent() {
        let (bus, calls) = bus_with_counter(0);
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        let id = publisher
            .schedule_event(alert("x"), ScheduleOptions::after(Duration::from_secs(5)), PublishContext::new(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(publisher.cancel_scheduled_event(id).await);
        assert!(!publisher.cancel_scheduled_event(id).await);
        assert_eq!(publisher.get_status().await.scheduled_events, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let (bus, calls) = bus_with_counter(2);
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        publisher
            .schedule_event(
                alert("x"),
                ScheduleOptions::after(Duration::from_millis(100))
                    .with_max_retries(3)
                    .with_retry_delay(Duration::from_millis(500)),
                PublishContext::new(),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.list_scheduled()[0].attempts, 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.scheduled_count(), 0);
        assert!(publisher.dead_letters(10).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_with_event_store_enabled() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(EventBus::new(
            EventBusConfig::default()
                .with_max_retries(100)
                .with_dead_letter_queue(true),
            Some(store.clone() as Arc<dyn EventStore>),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("bank-export", move |_, _| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("bank gateway timeout"))
                } else {
                    Ok(())
                }
            })),
            SubscriptionOptions::new(),
        );
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        publisher
            .schedule_event(
                alert("x"),
                ScheduleOptions::after(Duration::from_millis(100))
                    .with_max_retries(3)
                    .with_retry_delay(Duration::from_millis(200)),
                PublishContext::new(),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.scheduled_count(), 0);
        assert!(publisher.dead_letters(10).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_schedule_is_dead_lettered() {
        let (bus, calls) = bus_with_counter(usize::MAX);
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        let id = publisher
            .schedule_event(
                alert("x"),
                ScheduleOptions::after(Duration::from_millis(10))
                    .with_max_retries(2)
                    .with_retry_delay(Duration::from_millis(10)),
                PublishContext::new(),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.scheduled_count(), 0);

        let dead = publisher.dead_letters(10);
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].source,
            DeadLetterSource::Schedule {
                schedule_id: id,
                attempts: 3
            }
        );
        assert!(dead[0].reason.contains("bank gateway timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_schedules_survive_a_restart() {
        let store = Arc::new(InMemoryScheduleStore::new());
        let (bus, _) = bus_with_counter(0);
        let before = EventPublisher::with_schedule_store(bus, PublisherConfig::default(), store.clone());
        let id = before
            .schedule_event(
                alert("x"),
                ScheduleOptions::after(Duration::from_secs(60)).persistent(),
                PublishContext::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        // A fresh publisher over the same store, as after a process restart.
        let (bus, calls) = bus_with_counter(0);
        let after = EventPublisher::with_schedule_store(bus, PublisherConfig::default(), store.clone());
        assert_eq!(after.recover_scheduled_events().await.unwrap(), 1);
        assert_eq!(after.list_scheduled()[0].id, id);

        before.cancel_scheduled_event(id).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
