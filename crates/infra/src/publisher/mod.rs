//! Caller-facing publishing façade over the event bus.
//!
//! `EventPublisher` adds the orchestration the bus does not provide:
//! - `batch`: chunked batch publishing (concurrent, stop-on-error or transactional)
//! - `outbox`: after-commit buffering keyed by transaction id
//! - `scheduler`: delayed publishing with retries and cancellation

pub mod batch;
pub mod outbox;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use hrms_core::ScheduleId;
use hrms_events::{DomainEvent, EventMetadata, PublishContext, PublishResult};

use crate::config::PublisherConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterId};
use crate::event_bus::{BusMetrics, EventBus};
use crate::event_store::PersistenceError;
use crate::realtime::RealtimeError;

pub use batch::{BatchEntry, BatchOptions};
pub use scheduler::{InMemoryScheduleStore, ScheduleOptions, ScheduleStore, ScheduledEvent};

use scheduler::Armed;

/// Publisher errors.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("{0} requires a running tokio runtime")]
    NoRuntime(&'static str),

    #[error("invalid schedule: {0}")]
    Schedule(String),
}

/// Destination for best-effort re-broadcast of published events.
///
/// Returns the number of intended recipients.
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn forward(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
    ) -> Result<usize, RealtimeError>;
}

/// Snapshot returned by [`EventPublisher::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherStatus {
    pub healthy: bool,
    pub pending_transactional_events: usize,
    pub scheduled_events: usize,
    pub metrics: BusMetrics,
    pub dead_letters: usize,
}

struct Inner {
    bus: Arc<EventBus>,
    config: PublisherConfig,
    realtime: RwLock<Option<Arc<dyn RealtimeSink>>>,
    outbox: Mutex<HashMap<String, Vec<BatchEntry>>>,
    schedules: Mutex<HashMap<ScheduleId, Armed>>,
    schedule_store: Option<Arc<dyn ScheduleStore>>,
}

/// Cheaply cloneable publisher handle; clones share all state.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>, config: PublisherConfig) -> Self {
        Self::build(bus, config, None)
    }

    /// A publisher that persists `enable_persistence` schedules to `store`.
    pub fn with_schedule_store(
        bus: Arc<EventBus>,
        config: PublisherConfig,
        store: Arc<dyn ScheduleStore>,
    ) -> Self {
        Self::build(bus, config, Some(store))
    }

    fn build(
        bus: Arc<EventBus>,
        config: PublisherConfig,
        schedule_store: Option<Arc<dyn ScheduleStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                config,
                realtime: RwLock::new(None),
                outbox: Mutex::new(HashMap::new()),
                schedules: Mutex::new(HashMap::new()),
                schedule_store,
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// Install (or replace) the realtime sink events are forwarded to.
    pub fn set_realtime_sink(&self, sink: Arc<dyn RealtimeSink>) {
        *self
            .inner
            .realtime
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn realtime_sink(&self) -> Option<Arc<dyn RealtimeSink>> {
        self.inner
            .realtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish one event through the bus.
    ///
    /// Missing metadata gets the defaults, taking the correlation id from the
    /// context when present. When a realtime sink is installed the event is
    /// re-broadcast afterwards; sink failures are logged and never affect the
    /// returned result.
    pub async fn publish(
        &self,
        event: &DomainEvent,
        context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> PublishResult {
        self.publish_inner(event, &context, metadata, true).await
    }

    pub(crate) async fn publish_inner(
        &self,
        event: &DomainEvent,
        context: &PublishContext,
        metadata: Option<EventMetadata>,
        forward: bool,
    ) -> PublishResult {
        let metadata = metadata.unwrap_or_else(|| default_metadata(context));
        let result = self
            .inner
            .bus
            .publish(event, Some(metadata.clone()), Some(context))
            .await;
        if forward {
            self.forward_realtime(event, &metadata, context).await;
        }
        result
    }

    pub(crate) async fn forward_realtime(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
    ) {
        let Some(sink) = self.realtime_sink() else {
            return;
        };
        match sink.forward(event, metadata, context).await {
            Ok(delivered) => debug!(
                event_id = %event.id(),
                event_type = event.event_type(),
                delivered,
                "event forwarded to realtime"
            ),
            Err(err) => warn!(
                event_id = %event.id(),
                event_type = event.event_type(),
                error = %err,
                "realtime forwarding failed"
            ),
        }
    }

    pub async fn get_status(&self) -> PublisherStatus {
        let health = self.inner.bus.health().await;
        PublisherStatus {
            healthy: health.healthy,
            pending_transactional_events: self.pending_transactional_events(),
            scheduled_events: self.scheduled_count(),
            metrics: self.inner.bus.metrics(),
            dead_letters: self.inner.bus.dead_letters().map_or(0, |q| q.len()),
        }
    }

    /// Up to `limit` dead-lettered events, oldest first. Empty when the
    /// dead-letter queue is disabled.
    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.inner
            .bus
            .dead_letters()
            .map(|q| q.list(limit))
            .unwrap_or_default()
    }

    /// Publish a dead-lettered event again.
    ///
    /// The entry leaves the queue only if the new publish succeeds. `None` if
    /// no such entry exists.
    pub async fn replay_dead_letter(&self, id: DeadLetterId) -> Option<PublishResult> {
        let queue = self.inner.bus.dead_letters()?;
        let entry = queue.get(id)?;
        let result = self
            .publish(&entry.event, entry.context.clone(), Some(entry.metadata.clone()))
            .await;
        if result.success {
            queue.remove(id);
            info!(dead_letter_id = %id, event_id = %entry.event.id(), "dead letter replayed");
        } else {
            warn!(dead_letter_id = %id, event_id = %entry.event.id(), "dead letter replay failed");
        }
        Some(result)
    }
}

pub(crate) fn default_metadata(context: &PublishContext) -> EventMetadata {
    let metadata = EventMetadata::default();
    match &context.correlation_id {
        Some(correlation_id) => metadata.with_correlation_id(correlation_id.clone()),
        None => metadata,
    }
}

/// Human readable cause of a failed publish.
pub(crate) fn failure_reason(result: &PublishResult) -> String {
    if let Some(err) = &result.persistence_error {
        return err.clone();
    }
    result
        .failed_handlers()
        .filter_map(|r| r.error.as_deref().map(|e| format!("{}: {e}", r.handler_name)))
        .collect::<Vec<_>>()
        .join("; ")
}
