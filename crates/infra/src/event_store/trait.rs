use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use hrms_core::{AggregateId, AggregateRef, EventId};
use hrms_events::{DomainEvent, EventMetadata, PublishContext};

use super::query::{EventQuery, EventQueryResult, EventStats, StoreHealth};

/// An event ready to be appended to the log (not yet assigned a version).
///
/// ## Construction
///
/// - `NewEventRecord::new()` files the event under its payload's natural
///   aggregate stream (employee, payroll period, audit subject).
/// - `NewEventRecord::from_context()` additionally takes the acting user and
///   session from a [`PublishContext`], and lets `context.aggregate` override
///   the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEventRecord {
    pub event: DomainEvent,
    pub metadata: EventMetadata,
    pub aggregate: Option<AggregateRef>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl NewEventRecord {
    pub fn new(event: DomainEvent, metadata: EventMetadata) -> Self {
        let aggregate = event.aggregate();
        Self {
            event,
            metadata,
            aggregate,
            user_id: None,
            session_id: None,
        }
    }

    pub fn from_context(event: DomainEvent, metadata: EventMetadata, context: &PublishContext) -> Self {
        let aggregate = context.aggregate.clone().or_else(|| event.aggregate());
        Self {
            event,
            metadata,
            aggregate,
            user_id: context.user_id.clone(),
            session_id: context.session_id.clone(),
        }
    }

    pub fn with_aggregate(mut self, aggregate: AggregateRef) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Build the stored form at the given stream position.
    pub fn into_record(
        self,
        version: u64,
        created_at: DateTime<Utc>,
    ) -> Result<EventStoreRecord, PersistenceError> {
        let event_data = self.event.payload_json()?;
        let (aggregate_id, aggregate_type) = match self.aggregate {
            Some(a) => (Some(a.aggregate_id), Some(a.aggregate_type)),
            None => (None, None),
        };
        Ok(EventStoreRecord {
            id: self.event.id(),
            event_type: self.event.event_type().to_string(),
            aggregate_id,
            aggregate_type,
            event_data,
            correlation_id: Some(self.metadata.correlation_id.clone()),
            caused_by: self.metadata.caused_by,
            metadata: self.metadata,
            occurred_at: self.event.occurred_at(),
            created_at,
            version,
            user_id: self.user_id,
            session_id: self.session_id,
        })
    }
}

/// A persisted event (the `domain_events` row).
///
/// ## Versions
///
/// `version` is assigned by the store at append time:
/// - **Monotonic per stream**: within one `(aggregate_id, aggregate_type)`
///   stream each append gets the previous maximum + 1
/// - Records without an aggregate always carry version 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreRecord {
    pub id: EventId,
    pub event_type: String,
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    /// Payload body, without the type tag.
    pub event_data: JsonValue,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub correlation_id: Option<String>,
    pub caused_by: Option<EventId>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl EventStoreRecord {
    pub fn aggregate(&self) -> Option<AggregateRef> {
        match (self.aggregate_id, &self.aggregate_type) {
            (Some(id), Some(kind)) => Some(AggregateRef::new(id, kind.clone())),
            _ => None,
        }
    }

    /// Decode the typed event back from `event_type` + `event_data`.
    pub fn to_domain_event(&self) -> Result<DomainEvent, PersistenceError> {
        DomainEvent::from_parts(
            self.id,
            self.occurred_at,
            &self.event_type,
            self.event_data.clone(),
        )
        .map_err(|e| {
            PersistenceError::Serialization(format!(
                "cannot decode {} event {}: {e}",
                self.event_type, self.id
            ))
        })
    }
}

/// Event store failure.
///
/// The store never retries internally; callers decide.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("event {0} already stored")]
    Duplicate(EventId),

    #[error("concurrent append conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Append-only domain event log.
///
/// ## Contract
///
/// - **Append-only**: records are never updated; `cleanup_expired_events` is
///   the only deletion
/// - **Atomic batches**: `save_events` stores the whole batch or nothing
/// - **Point lookups return `None`** when absent, never an error
/// - **No internal retries**: every I/O failure surfaces as [`PersistenceError`]
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append one record, returning its id.
    async fn save_event(&self, record: NewEventRecord) -> Result<EventId, PersistenceError>;

    /// Append a batch in one round trip; all-or-nothing.
    async fn save_events(&self, records: Vec<NewEventRecord>) -> Result<Vec<EventId>, PersistenceError>;

    async fn query_events(&self, query: &EventQuery) -> Result<EventQueryResult, PersistenceError>;

    async fn get_event_by_id(&self, id: EventId) -> Result<Option<EventStoreRecord>, PersistenceError>;

    /// Records of one aggregate stream in ascending `version` order, starting
    /// at `from_version` (inclusive) when given.
    async fn get_aggregate_events(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: Option<&str>,
        from_version: Option<u64>,
    ) -> Result<Vec<EventStoreRecord>, PersistenceError>;

    /// Aggregates over records whose `occurred_at` falls in `[from, to]`.
    async fn get_event_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<EventStats, PersistenceError>;

    /// Delete records created more than `older_than_days` days ago.
    async fn cleanup_expired_events(&self, older_than_days: u32) -> Result<u64, PersistenceError>;

    /// Cheap liveness probe; failures are reported in the result.
    async fn health_check(&self) -> StoreHealth;
}
