//! Event log query, statistics and health types.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use hrms_core::AggregateId;
use hrms_events::{EventCategory, EventPriority};

use super::r#trait::EventStoreRecord;

/// Number of users reported in [`EventStats::top_users`].
pub const TOP_USERS_LIMIT: usize = 10;

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Limit is capped at 1000.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    OccurredAt,
    CreatedAt,
}

impl SortField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortField::OccurredAt => "occurred_at",
            SortField::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub(crate) fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Filter, ordering and pagination of a log query.
///
/// Empty lists and `None` fields do not filter, so `EventQuery::default()`
/// pages through the whole log, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    pub event_types: Vec<String>,
    pub aggregate_ids: Vec<AggregateId>,
    pub aggregate_type: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<EventPriority>,
    pub category: Option<EventCategory>,
    pub pagination: Pagination,
    pub sort_by: SortField,
    pub direction: SortDirection,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    pub fn aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_ids.push(aggregate_id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn category(mut self, category: EventCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn order_by(mut self, sort_by: SortField, direction: SortDirection) -> Self {
        self.sort_by = sort_by;
        self.direction = direction;
        self
    }

    /// Whether a record passes every filter of this query.
    pub fn matches(&self, record: &EventStoreRecord) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&record.event_type) {
            return false;
        }
        if !self.aggregate_ids.is_empty()
            && !record
                .aggregate_id
                .is_some_and(|id| self.aggregate_ids.contains(&id))
        {
            return false;
        }
        if let Some(kind) = &self.aggregate_type {
            if record.aggregate_type.as_ref() != Some(kind) {
                return false;
            }
        }
        if self.from.is_some_and(|from| record.occurred_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.occurred_at > to) {
            return false;
        }
        if self.user_id.is_some() && record.user_id != self.user_id {
            return false;
        }
        if self.correlation_id.is_some() && record.correlation_id != self.correlation_id {
            return false;
        }
        if self.priority.is_some_and(|p| record.metadata.priority != p) {
            return false;
        }
        if self.category.is_some_and(|c| record.metadata.category != c) {
            return false;
        }
        true
    }
}

/// Paginated query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQueryResult {
    pub events: Vec<EventStoreRecord>,
    /// Number of records matching the filter (across all pages).
    pub total_count: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl EventQueryResult {
    pub(crate) fn page(events: Vec<EventStoreRecord>, total_count: u64, pagination: Pagination) -> Self {
        let has_more = total_count > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            events,
            total_count,
            pagination,
            has_more,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: String,
    pub event_count: u64,
}

/// Aggregation over the raw log, computed at query time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_category: BTreeMap<String, u64>,
    pub events_by_date: BTreeMap<NaiveDate, u64>,
    /// Most active users, busiest first, at most [`TOP_USERS_LIMIT`].
    pub top_users: Vec<UserActivity>,
}

/// Result of a store liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub total_events: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            total_events: 0,
            last_event_time: None,
            error: Some(error.into()),
        }
    }
}
