//! Dead-letter queue for events that could not be delivered.
//!
//! Only populated when `EventBusConfig::dead_letter_queue` is enabled.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hrms_core::{ScheduleId, SubscriptionId};
use hrms_events::{DomainEvent, EventMetadata, PublishContext};

/// Unique dead-letter entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the undeliverable event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterSource {
    /// A scheduled publish that exhausted its retries.
    Schedule { schedule_id: ScheduleId, attempts: u32 },
    /// The delivery that pushed a subscription into the paused state.
    Subscription {
        subscription_id: SubscriptionId,
        handler_name: String,
        error_count: u32,
    },
}

/// An event moved to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub event: DomainEvent,
    pub metadata: EventMetadata,
    pub context: PublishContext,
    pub reason: String,
    pub source: DeadLetterSource,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        event: DomainEvent,
        metadata: EventMetadata,
        context: PublishContext,
        reason: impl Into<String>,
        source: DeadLetterSource,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            event,
            metadata,
            context,
            reason: reason.into(),
            source,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// In-memory dead-letter queue, oldest entry first.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: DeadLetterEntry) {
        tracing::warn!(
            dead_letter_id = %entry.id,
            event_id = %entry.event.id(),
            event_type = entry.event.event_type(),
            reason = %entry.reason,
            "event dead-lettered"
        );
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Up to `limit` oldest entries.
    pub fn list(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().take(limit).cloned().collect()
    }

    pub fn get(&self, id: DeadLetterId) -> Option<DeadLetterEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: DeadLetterId) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let idx = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(idx))
    }

    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut *self.entries.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrms_events::{EventPayload, SystemAlert};

    fn entry(message: &str) -> DeadLetterEntry {
        DeadLetterEntry::new(
            DomainEvent::new(EventPayload::SystemAlert(SystemAlert {
                component: "payroll".to_string(),
                severity: "error".to_string(),
                message: message.to_string(),
            })),
            EventMetadata::default(),
            PublishContext::default(),
            "handler kept failing",
            DeadLetterSource::Schedule {
                schedule_id: ScheduleId::new(),
                attempts: 4,
            },
        )
    }

    #[test]
    fn list_is_oldest_first_and_bounded() {
        let dlq = DeadLetterQueue::new();
        dlq.push(entry("first"));
        dlq.push(entry("second"));
        dlq.push(entry("third"));

        let listed = dlq.list(2);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reason, "handler kept failing");
        assert_eq!(dlq.len(), 3);
    }

    #[test]
    fn remove_and_drain() {
        let dlq = DeadLetterQueue::new();
        let first = entry("first");
        let id = first.id;
        dlq.push(first);
        dlq.push(entry("second"));

        assert!(dlq.get(id).is_some());
        assert_eq!(dlq.remove(id).map(|e| e.id), Some(id));
        assert!(dlq.remove(id).is_none());
        assert_eq!(dlq.drain().len(), 1);
        assert!(dlq.is_empty());
    }
}
