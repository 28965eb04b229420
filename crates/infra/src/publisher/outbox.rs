//! After-commit (outbox) publishing.
//!
//! Events are buffered per transaction id and published together, as one
//! batch, when the transaction commits. Nothing in a buffer is visible to
//! subscribers before that.

use std::sync::PoisonError;
use std::time::Duration;

use tracing::{debug, info, warn};

use hrms_events::{BatchPublishResult, DomainEvent, EventMetadata, PublishContext};

use super::{BatchEntry, BatchOptions, EventPublisher};

/// Buffer key: the context's transaction id, else its session id, else a
/// fresh id.
fn transaction_key(context: &PublishContext) -> String {
    context
        .transaction_id
        .clone()
        .or_else(|| context.session_id.clone())
        .unwrap_or_else(|| format!("tx-{}", uuid::Uuid::now_v7()))
}

impl EventPublisher {
    /// Buffer `event` until its transaction commits; returns the transaction id.
    pub fn publish_after_commit(
        &self,
        event: DomainEvent,
        mut context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> String {
        let transaction_id = transaction_key(&context);
        context.transaction_id = Some(transaction_id.clone());

        let buffered = {
            let mut outbox = self.inner.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = outbox.entry(transaction_id.clone()).or_default();
            pending.push(BatchEntry {
                event,
                context,
                metadata,
            });
            pending.len()
        };
        debug!(transaction_id = %transaction_id, buffered, "event buffered until commit");

        if buffered == 1 {
            if let Some(delay) = self.inner.config.outbox_auto_commit {
                self.arm_auto_commit(transaction_id.clone(), delay);
            }
        }
        transaction_id
    }

    fn arm_auto_commit(&self, transaction_id: String, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                transaction_id = %transaction_id,
                "no async runtime; transaction must be committed explicitly"
            );
            return;
        };
        let publisher = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if publisher.commit_transaction(&transaction_id).await.is_some() {
                debug!(transaction_id = %transaction_id, "transaction auto-committed");
            }
        });
    }

    /// Publish everything buffered under `transaction_id` and clear the buffer.
    ///
    /// `None` if nothing was buffered (unknown, already committed or rolled back).
    pub async fn commit_transaction(&self, transaction_id: &str) -> Option<BatchPublishResult> {
        let entries = self
            .inner
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transaction_id)?;

        info!(transaction_id, events = entries.len(), "committing transaction events");
        Some(self.publish_batch(entries, BatchOptions::default()).await)
    }

    /// Discard the buffer of `transaction_id`; returns how many events were dropped.
    pub fn rollback_transaction(&self, transaction_id: &str) -> usize {
        let dropped = self
            .inner
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transaction_id)
            .map_or(0, |entries| entries.len());
        if dropped > 0 {
            info!(transaction_id, dropped, "transaction events discarded");
        }
        dropped
    }

    /// Events buffered across all open transactions.
    pub fn pending_transactional_events(&self) -> usize {
        self.inner
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use hrms_events::{FnHandler, HandlerError, SubscriptionOptions};

    use super::*;
    use crate::config::{EventBusConfig, PublisherConfig};
    use crate::event_bus::EventBus;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::publisher::tests::alert;

    fn setup(config: PublisherConfig) -> (EventPublisher, Arc<AtomicUsize>) {
        let bus = Arc::new(EventBus::new(EventBusConfig::default().without_event_store(), None));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("counter", move |_, _| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            SubscriptionOptions::new(),
        );
        (EventPublisher::new(bus, config), seen)
    }

    #[tokio::test]
    async fn nothing_is_visible_before_commit() {
        let (publisher, seen) = setup(PublisherConfig::default());
        let ctx = PublishContext::new().with_transaction("payroll-close-2024-05");

        let tx = publisher.publish_after_commit(alert("a"), ctx.clone(), None);
        publisher.publish_after_commit(alert("b"), ctx, None);
        assert_eq!(tx, "payroll-close-2024-05");
        assert_eq!(publisher.pending_transactional_events(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let batch = publisher.commit_transaction(&tx).await.unwrap();
        assert_eq!(batch.summary.successful, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.pending_transactional_events(), 0);
        assert!(publisher.commit_transaction(&tx).await.is_none());
    }

    #[tokio::test]
    async fn session_keys_the_buffer_and_rollback_discards() {
        let (publisher, seen) = setup(PublisherConfig::default());
        let tx = publisher.publish_after_commit(alert("a"), PublishContext::new().with_session("sess-4"), None);
        assert_eq!(tx, "sess-4");

        let anonymous = publisher.publish_after_commit(alert("b"), PublishContext::new(), None);
        assert!(anonymous.starts_with("tx-"));

        assert_eq!(publisher.rollback_transaction(&tx), 1);
        assert_eq!(publisher.rollback_transaction(&tx), 0);
        assert_eq!(publisher.pending_transactional_events(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_commit_flushes_after_delay() {
        let (publisher, seen) =
            setup(PublisherConfig::default().with_outbox_auto_commit(Duration::from_millis(100)));
        publisher.publish_after_commit(alert("a"), PublishContext::new().with_session("s"), None);
        publisher.publish_after_commit(alert("b"), PublishContext::new().with_session("s"), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.pending_transactional_events(), 0);
    }

    #[tokio::test]
    async fn committed_event_can_be_redelivered_from_dead_letters() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(EventBus::new(
            EventBusConfig::default().with_dead_letter_queue(true),
            Some(store.clone() as Arc<dyn EventStore>),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new("gl-posting", move |_, _| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("ledger locked"))
                } else {
                    Ok(())
                }
            })),
            SubscriptionOptions::new().with_max_retries(1),
        );
        let publisher = EventPublisher::new(bus, PublisherConfig::default());

        let tx = publisher.publish_after_commit(
            alert("close"),
            PublishContext::new().with_transaction("payroll-close-2024-06"),
            None,
        );
        let batch = publisher.commit_transaction(&tx).await.unwrap();
        assert_eq!(batch.summary.failed, 1);
        assert_eq!(store.len(), 1);

        publisher.bus().resume_subscription(sub);
        let entry = publisher.dead_letters(10).remove(0);
        let replayed = publisher.replay_dead_letter(entry.id).await.unwrap();
        assert!(replayed.success);
        assert!(replayed.persistence_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
        assert!(publisher.dead_letters(10).is_empty());
    }
}
