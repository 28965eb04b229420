//! Event metadata and publish context.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use hrms_core::{AggregateRef, EventId};

/// Delivery priority of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "LOW",
            EventPriority::Normal => "NORMAL",
            EventPriority::High => "HIGH",
            EventPriority::Critical => "CRITICAL",
        }
    }
}

/// Broad classification of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    #[default]
    Business,
    System,
    Audit,
    Integration,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Business => "BUSINESS",
            EventCategory::System => "SYSTEM",
            EventCategory::Audit => "AUDIT",
            EventCategory::Integration => "INTEGRATION",
        }
    }
}

/// Metadata carried alongside every published event.
///
/// `correlation_id` links causally related events across publishes;
/// `caused_by` names the parent event, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub priority: EventPriority,
    pub category: EventCategory,
    pub retryable: bool,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<EventId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            priority: EventPriority::Normal,
            category: EventCategory::Business,
            retryable: true,
            correlation_id: new_correlation_id(),
            caused_by: None,
            tags: BTreeSet::new(),
            ttl: None,
        }
    }
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn caused_by(mut self, parent: EventId) -> Self {
        self.caused_by = Some(parent);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }
}

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}

/// Who/what published an event, and where it should be filed.
///
/// Every field is optional. `aggregate` overrides the payload's natural stream
/// when persisting. `transaction_id` (or, failing that, `session_id`) keys the
/// after-commit buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub transaction_id: Option<String>,
    pub correlation_id: Option<String>,
    pub aggregate: Option<AggregateRef>,
    pub source: Option<String>,
    #[serde(default)]
    pub attributes: JsonValue,
}

impl PublishContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateRef) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
