//! Subscription value types (the bus owns the live table).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hrms_core::SubscriptionId;

/// Event-type selector of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTypeFilter {
    /// Wildcard (`*`): every event type.
    Any,
    Only(BTreeSet<String>),
}

impl EventTypeFilter {
    /// Build a filter from a list of event types; `*` anywhere means [`EventTypeFilter::Any`].
    pub fn from_types<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: BTreeSet<String> = event_types.into_iter().map(Into::into).collect();
        if types.contains("*") {
            EventTypeFilter::Any
        } else {
            EventTypeFilter::Only(types)
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventTypeFilter::Any => true,
            EventTypeFilter::Only(types) => types.contains(event_type),
        }
    }
}

/// Optional knobs for `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Overrides `EventHandler::priority()`.
    pub priority: Option<i32>,
    /// Overrides `EventHandler::name()`.
    pub subscriber_name: Option<String>,
    pub description: Option<String>,
    /// Overrides the bus-level `max_retries`.
    pub max_retries: Option<u32>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.subscriber_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Most recent handler failure of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Descriptive metadata of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMetadata {
    pub subscriber_name: String,
    pub description: Option<String>,
    /// Effective failure budget before the subscription is paused.
    pub max_retries: u32,
}

/// Snapshot of a registered subscription.
///
/// Lifecycle: `Active` → (sustained handler failure) → paused/failed →
/// (only via explicit resume) → `Active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub event_types: EventTypeFilter,
    /// Lower runs earlier.
    pub priority: i32,
    pub is_active: bool,
    pub error_count: u32,
    pub last_error: Option<LastError>,
    pub metadata: SubscriptionMetadata,
    pub created_at: DateTime<Utc>,
}

impl EventSubscription {
    /// Whether sustained failures have exhausted the failure budget.
    pub fn is_failed(&self) -> bool {
        self.error_count >= self.metadata.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        let filter = EventTypeFilter::from_types(["PayrollPaid", "*"]);
        assert_eq!(filter, EventTypeFilter::Any);
        assert!(filter.matches("EmployeeCreated"));
    }

    #[test]
    fn explicit_types_match_exactly() {
        let filter = EventTypeFilter::from_types(["PayrollPaid"]);
        assert!(filter.matches("PayrollPaid"));
        assert!(!filter.matches("PayrollPaidLate"));
    }
}
