//! In-process publish/subscribe dispatcher.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use hrms_core::SubscriptionId;
use hrms_events::{
    DomainEvent, EventHandler, EventMetadata, EventSubscription, EventTypeFilter, HandlerError,
    HandlerOutcome, LastError, PublishContext, PublishResult, SubscriptionMetadata,
    SubscriptionOptions,
};

use super::metrics::BusMetrics;
use crate::config::EventBusConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterSource};
use crate::event_store::{EventStore, NewEventRecord, PersistenceError, StoreHealth};

struct Registration {
    state: EventSubscription,
    handler: Arc<dyn EventHandler>,
}

/// A subscription selected for one dispatch.
struct Target {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
}

/// Liveness of the bus and its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusHealth {
    pub healthy: bool,
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    /// `None` when persistence is disabled.
    pub store: Option<StoreHealth>,
}

/// In-memory event bus.
///
/// Routes each published event to every active subscription whose type filter
/// matches, lowest `priority` first, and isolates failures per subscription.
///
/// ## Failure accounting
///
/// A failing (or panicking) handler increments its subscription's
/// `error_count` and records `last_error`. Once `error_count` reaches the
/// subscription's `max_retries` the subscription is paused and receives
/// nothing until `resume_subscription`. Other subscriptions and the publish
/// call itself are unaffected.
pub struct EventBus {
    config: EventBusConfig,
    store: Option<Arc<dyn EventStore>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Registration>>,
    metrics: Mutex<BusMetrics>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
}

impl EventBus {
    /// `store` is ignored when `config.enable_event_store` is false.
    pub fn new(config: EventBusConfig, store: Option<Arc<dyn EventStore>>) -> Self {
        let store = if config.enable_event_store { store } else { None };
        if config.enable_event_store && store.is_none() {
            warn!("event store enabled but none supplied; events will not be persisted");
        }
        let dead_letters = config
            .dead_letter_queue
            .then(|| Arc::new(DeadLetterQueue::new()));
        Self {
            config,
            store,
            subscriptions: RwLock::new(HashMap::new()),
            metrics: Mutex::new(BusMetrics::default()),
            dead_letters,
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// The store events are persisted to, if persistence is enabled.
    pub fn store(&self) -> Option<&Arc<dyn EventStore>> {
        self.store.as_ref()
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letters.as_ref()
    }

    /// Persist (if enabled) and dispatch one event.
    ///
    /// A persistence failure does not stop dispatch, but the result reports
    /// `success = false`, no `event_id`, and the storage error. An event whose
    /// id is already in the store is dispatched again without a second insert.
    pub async fn publish(
        &self,
        event: &DomainEvent,
        metadata: Option<EventMetadata>,
        context: Option<&PublishContext>,
    ) -> PublishResult {
        let started = Instant::now();
        let metadata = metadata.unwrap_or_default();

        let (event_id, persistence_error) = match &self.store {
            Some(store) => {
                let record = match context {
                    Some(ctx) => NewEventRecord::from_context(event.clone(), metadata.clone(), ctx),
                    None => NewEventRecord::new(event.clone(), metadata.clone()),
                };
                match store.save_event(record).await {
                    Ok(id) => (Some(id), None),
                    // Redelivery of a stored event (scheduled retry, dead-letter replay).
                    Err(PersistenceError::Duplicate(id)) if id == event.id() => {
                        debug!(event_id = %id, "event already stored; redelivering");
                        (Some(id), None)
                    }
                    Err(e) => {
                        warn!(
                            event_id = %event.id(),
                            event_type = event.event_type(),
                            error = %e,
                            "event persistence failed; dispatching anyway"
                        );
                        (None, Some(e.to_string()))
                    }
                }
            }
            None => (Some(event.id()), None),
        };

        let handler_results = self.dispatch(event, &metadata, context).await;
        self.finish(event, started, event_id, persistence_error, handler_results)
    }

    /// Dispatch an event that has already been persisted (e.g. by a
    /// transactional batch insert).
    pub async fn publish_persisted(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: Option<&PublishContext>,
    ) -> PublishResult {
        let started = Instant::now();
        let handler_results = self.dispatch(event, metadata, context).await;
        self.finish(event, started, Some(event.id()), None, handler_results)
    }

    fn finish(
        &self,
        event: &DomainEvent,
        started: Instant,
        event_id: Option<hrms_core::EventId>,
        persistence_error: Option<String>,
        handler_results: Vec<HandlerOutcome>,
    ) -> PublishResult {
        let failed = handler_results.iter().filter(|r| !r.success).count();
        let succeeded = handler_results.len() - failed;
        let execution_time = started.elapsed();

        if self.config.enable_metrics {
            self.metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_publish(execution_time, succeeded, failed);
        }

        let success = persistence_error.is_none() && failed == 0;
        debug!(
            event_id = %event.id(),
            event_type = event.event_type(),
            handlers = handler_results.len(),
            failed,
            success,
            "event published"
        );

        PublishResult {
            event_id,
            success,
            handler_results,
            execution_time,
            persistence_error,
        }
    }

    /// Active subscriptions matching `event_type`, lowest priority first.
    fn targets(&self, event_type: &str) -> Vec<Target> {
        let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&Registration> = subs
            .values()
            .filter(|r| r.state.is_active && r.state.event_types.matches(event_type))
            .collect();
        matched.sort_by(|a, b| {
            a.state
                .priority
                .cmp(&b.state.priority)
                .then(a.state.created_at.cmp(&b.state.created_at))
                .then(a.state.id.cmp(&b.state.id))
        });
        matched
            .into_iter()
            .map(|r| Target {
                id: r.state.id,
                name: r.state.metadata.subscriber_name.clone(),
                handler: Arc::clone(&r.handler),
            })
            .collect()
    }

    async fn dispatch(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: Option<&PublishContext>,
    ) -> Vec<HandlerOutcome> {
        let targets = self.targets(event.event_type());
        if targets.is_empty() {
            warn!(
                event_id = %event.id(),
                event_type = event.event_type(),
                "no subscription matches event"
            );
            return Vec::new();
        }

        if self.config.enable_async_processing {
            join_all(
                targets
                    .iter()
                    .map(|t| self.run_handler(t, event, metadata, context)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(targets.len());
            for t in &targets {
                outcomes.push(self.run_handler(t, event, metadata, context).await);
            }
            outcomes
        }
    }

    async fn run_handler(
        &self,
        target: &Target,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: Option<&PublishContext>,
    ) -> HandlerOutcome {
        let started = Instant::now();
        let event_type = event.event_type();

        if !target.handler.can_handle(event_type) {
            debug!(
                subscription_id = %target.id,
                handler = %target.name,
                event_type,
                "handler does not support event type"
            );
            return outcome(
                target,
                started.elapsed(),
                Err(HandlerError::permanent(format!(
                    "handler {} does not support event type {event_type}",
                    target.name
                ))),
            );
        }

        let result = AssertUnwindSafe(target.handler.handle(event, metadata))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::permanent(panic_message(panic.as_ref()))));
        let elapsed = started.elapsed();

        if let Err(err) = &result {
            self.record_failure(target, err, event, metadata, context);
        }
        outcome(target, elapsed, result)
    }

    fn record_failure(
        &self,
        target: &Target,
        err: &HandlerError,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: Option<&PublishContext>,
    ) {
        let paused_at = {
            let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
            // Unsubscribed while the handler was running.
            let Some(reg) = subs.get_mut(&target.id) else {
                return;
            };
            let state = &mut reg.state;
            state.error_count += 1;
            state.last_error = Some(LastError {
                message: err.message.clone(),
                timestamp: Utc::now(),
            });

            if state.is_active && state.is_failed() {
                state.is_active = false;
                Some(state.error_count)
            } else {
                warn!(
                    subscription_id = %target.id,
                    handler = %target.name,
                    event_type = event.event_type(),
                    error_count = state.error_count,
                    error = %err,
                    "event handler failed"
                );
                None
            }
        };

        let Some(error_count) = paused_at else {
            return;
        };
        error!(
            subscription_id = %target.id,
            handler = %target.name,
            error_count,
            error = %err,
            "subscription paused after repeated handler failures"
        );
        if let Some(dlq) = &self.dead_letters {
            dlq.push(DeadLetterEntry::new(
                event.clone(),
                metadata.clone(),
                context.cloned().unwrap_or_default(),
                err.message.clone(),
                DeadLetterSource::Subscription {
                    subscription_id: target.id,
                    handler_name: target.name.clone(),
                    error_count,
                },
            ));
        }
    }

    /// Register `handler` for `event_types` (`"*"` for every type).
    pub fn subscribe<I, S>(
        &self,
        event_types: I,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = SubscriptionId::new();
        let state = EventSubscription {
            id,
            event_types: EventTypeFilter::from_types(event_types),
            priority: options.priority.unwrap_or_else(|| handler.priority()),
            is_active: true,
            error_count: 0,
            last_error: None,
            metadata: SubscriptionMetadata {
                subscriber_name: options
                    .subscriber_name
                    .unwrap_or_else(|| handler.name().to_string()),
                description: options.description,
                max_retries: options.max_retries.unwrap_or(self.config.max_retries),
            },
            created_at: Utc::now(),
        };

        info!(
            subscription_id = %id,
            subscriber = %state.metadata.subscriber_name,
            priority = state.priority,
            event_types = ?state.event_types,
            "subscription registered"
        );
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Registration { state, handler });
        id
    }

    /// Returns `false` if the subscription is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            info!(subscription_id = %id, "subscription removed");
        }
        removed
    }

    pub fn pause_subscription(&self, id: SubscriptionId) -> bool {
        self.with_subscription(id, |s| s.is_active = false)
    }

    /// Reactivate a subscription and reset its failure accounting.
    pub fn resume_subscription(&self, id: SubscriptionId) -> bool {
        self.with_subscription(id, |s| {
            s.is_active = true;
            s.error_count = 0;
            s.last_error = None;
        })
    }

    fn with_subscription(&self, id: SubscriptionId, f: impl FnOnce(&mut EventSubscription)) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        match subs.get_mut(&id) {
            Some(reg) => {
                f(&mut reg.state);
                debug!(subscription_id = %id, is_active = reg.state.is_active, "subscription updated");
                true
            }
            None => false,
        }
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> Option<EventSubscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|r| r.state.clone())
    }

    /// Every subscription, lowest priority first.
    pub fn subscriptions(&self) -> Vec<EventSubscription> {
        let mut all: Vec<EventSubscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| r.state.clone())
            .collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        all
    }

    pub fn metrics(&self) -> BusMetrics {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        metrics.total_subscriptions = subs.len();
        metrics.active_subscriptions = subs.values().filter(|r| r.state.is_active).count();
        metrics
    }

    /// Remove subscriptions with at least `max_errors` recorded failures.
    pub fn cleanup_failed_subscriptions(&self, max_errors: u32) -> usize {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|id, r| {
            let keep = r.state.error_count < max_errors;
            if !keep {
                info!(
                    subscription_id = %id,
                    error_count = r.state.error_count,
                    "removing failed subscription"
                );
            }
            keep
        });
        before - subs.len()
    }

    pub async fn health(&self) -> BusHealth {
        let store = match &self.store {
            Some(s) => Some(s.health_check().await),
            None => None,
        };
        let metrics = self.metrics();
        BusHealth {
            healthy: store.as_ref().is_none_or(|s| s.healthy),
            total_subscriptions: metrics.total_subscriptions,
            active_subscriptions: metrics.active_subscriptions,
            store,
        }
    }
}

fn outcome(target: &Target, duration: Duration, result: Result<(), HandlerError>) -> HandlerOutcome {
    match result {
        Ok(()) => HandlerOutcome {
            subscription_id: target.id,
            handler_name: target.name.clone(),
            success: true,
            error: None,
            retryable: false,
            duration,
        },
        Err(err) => HandlerOutcome {
            subscription_id: target.id,
            handler_name: target.name.clone(),
            success: false,
            retryable: err.retryable,
            error: Some(err.message),
            duration,
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use hrms_core::AggregateId;
    use hrms_events::{EmployeeCreated, EventPayload, FnHandler, SystemAlert, event_types};

    use crate::event_store::{EventQuery, InMemoryEventStore};

    fn hired() -> DomainEvent {
        DomainEvent::new(EventPayload::EmployeeCreated(EmployeeCreated {
            employee_id: AggregateId::new(),
            employee_code: "E-042".to_string(),
            full_name: "Tran Thi B".to_string(),
            department: None,
            hired_on: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        }))
    }

    fn alert() -> DomainEvent {
        DomainEvent::new(EventPayload::SystemAlert(SystemAlert {
            component: "bus".to_string(),
            severity: "info".to_string(),
            message: "ping".to_string(),
        }))
    }

    fn in_memory_bus(config: EventBusConfig) -> (EventBus, Arc<InMemoryEventStore>) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = EventBus::new(config, Some(store.clone() as Arc<dyn EventStore>));
        (bus, store)
    }

    #[tokio::test]
    async fn sequential_dispatch_follows_priority() {
        let (bus, _) = in_memory_bus(EventBusConfig::default().sequential());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("late", 2), ("early", 1), ("middle", 1)] {
            let order = order.clone();
            let handler = FnHandler::new(name, move |_, _| {
                order.lock().unwrap().push(name);
                Ok(())
            })
            .with_priority(priority);
            bus.subscribe([event_types::EMPLOYEE_CREATED], Arc::new(handler), SubscriptionOptions::new());
        }

        let result = bus.publish(&hired(), None, None).await;
        assert!(result.success);
        assert_eq!(result.handler_results.len(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn zero_subscribers_is_still_a_success() {
        let (bus, store) = in_memory_bus(EventBusConfig::default());
        let event = alert();
        let result = bus.publish(&event, None, None).await;
        assert!(result.success);
        assert_eq!(result.event_id, Some(event.id()));
        assert!(result.handler_results.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_and_type_filters() {
        let (bus, _) = in_memory_bus(EventBusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("audit", move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            SubscriptionOptions::new(),
        );
        let h = hits.clone();
        bus.subscribe(
            [event_types::PAYROLL_PAID],
            Arc::new(FnHandler::new("bank", move |_, _| {
                h.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })),
            SubscriptionOptions::new(),
        );

        bus.publish(&alert(), None, None).await;
        bus.publish(&hired(), None, None).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistence_failure_still_dispatches() {
        let (bus, store) = in_memory_bus(EventBusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("counter", move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            SubscriptionOptions::new(),
        );

        store.simulate_outage(true);
        let result = bus.publish(&alert(), None, None).await;
        assert!(!result.success);
        assert!(result.event_id.is_none());
        assert!(result.persistence_error.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_type_fails_without_counting_errors() {
        let (bus, _) = in_memory_bus(EventBusConfig::default());
        let picky = FnHandler::new("payroll-only", |_, _| Ok(())).only([event_types::PAYROLL_PAID]);
        let id = bus.subscribe(["*"], Arc::new(picky), SubscriptionOptions::new());

        let result = bus.publish(&alert(), None, None).await;
        assert!(!result.success);
        assert!(!result.handler_results[0].retryable);
        assert_eq!(bus.get_subscription(id).unwrap().error_count, 0);
    }

    #[tokio::test]
    async fn repeated_failures_pause_until_resumed() {
        let (bus, _) = in_memory_bus(EventBusConfig::default().with_dead_letter_queue(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("flaky", move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::transient("ledger offline"))
            })),
            SubscriptionOptions::new().with_max_retries(2),
        );

        for _ in 0..4 {
            bus.publish(&alert(), None, None).await;
        }
        let sub = bus.get_subscription(id).unwrap();
        assert!(!sub.is_active);
        assert_eq!(sub.error_count, 2);
        assert_eq!(sub.last_error.unwrap().message, "ledger offline");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.dead_letters().unwrap().len(), 1);

        assert!(bus.resume_subscription(id));
        let sub = bus.get_subscription(id).unwrap();
        assert!(sub.is_active);
        assert_eq!(sub.error_count, 0);
        assert!(sub.last_error.is_none());
        bus.publish(&alert(), None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let (bus, _) = in_memory_bus(EventBusConfig::default());
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("panics", |_, _| panic!("bad payroll row"))),
            SubscriptionOptions::new().with_priority(1),
        );
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("fine", |_, _| Ok(()))),
            SubscriptionOptions::new().with_priority(2),
        );

        let result = bus.publish(&alert(), None, None).await;
        assert!(!result.success);
        let failed: Vec<_> = result.failed_handlers().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("bad payroll row"));
        assert!(result.handler_results.iter().any(|r| r.success));
    }

    #[tokio::test]
    async fn parallel_dispatch_runs_every_handler_despite_a_panic() {
        let (bus, _) = in_memory_bus(EventBusConfig::default());
        assert!(bus.config().enable_async_processing);
        let calls = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let c = calls.clone();
            bus.subscribe(
                ["*"],
                Arc::new(FnHandler::new(format!("worker-{i}"), move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                SubscriptionOptions::new().with_priority(i),
            );
        }
        let panicking = bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("panics", |_, _| panic!("corrupt timesheet"))),
            SubscriptionOptions::new().with_priority(2),
        );

        let result = bus.publish(&hired(), None, None).await;
        assert!(!result.success);
        assert_eq!(result.handler_results.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.failed_handlers().count(), 1);
        assert_eq!(bus.get_subscription(panicking).unwrap().error_count, 1);

        // The panic did not poison the bus.
        let result = bus.publish(&hired(), None, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(result.failed_handlers().count(), 1);
    }

    #[tokio::test]
    async fn stored_event_is_redelivered_without_a_second_insert() {
        let (bus, store) = in_memory_bus(EventBusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("counter", move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            SubscriptionOptions::new(),
        );
        let event = alert();

        assert!(bus.publish(&event, None, None).await.success);
        let again = bus.publish(&event, None, None).await;
        assert!(again.success);
        assert_eq!(again.event_id, Some(event.id()));
        assert!(again.persistence_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_cleanup_removes_failed() {
        let (bus, _) = in_memory_bus(EventBusConfig::default());
        let ok = bus.subscribe(["*"], Arc::new(FnHandler::new("ok", |_, _| Ok(()))), SubscriptionOptions::new());
        let bad = bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("bad", |_, _| Err(HandlerError::permanent("nope")))),
            SubscriptionOptions::new(),
        );

        bus.publish(&alert(), None, None).await;
        assert_eq!(bus.cleanup_failed_subscriptions(1), 1);
        assert!(bus.get_subscription(bad).is_none());

        assert!(bus.unsubscribe(ok));
        assert!(!bus.unsubscribe(ok));
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn metrics_and_context_reach_the_store() {
        let (bus, store) = in_memory_bus(EventBusConfig::default());
        bus.subscribe(["*"], Arc::new(FnHandler::new("ok", |_, _| Ok(()))), SubscriptionOptions::new());
        let ctx = PublishContext::for_user("hr-7").with_session("s-1");

        bus.publish(&hired(), None, Some(&ctx)).await;
        bus.publish(&hired(), None, Some(&ctx)).await;

        let metrics = bus.metrics();
        assert_eq!(metrics.events_published, 2);
        assert_eq!(metrics.events_processed, 2);
        assert_eq!(metrics.active_subscriptions, 1);

        let page = store.query_events(&EventQuery::new().user("hr-7")).await.unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.events[0].session_id.as_deref(), Some("s-1"));
        assert!(bus.health().await.healthy);
    }
}
