//! Channel and subscriber model, and recipient selection.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hrms_core::{BroadcastId, EventId, SubscriberId};
use hrms_events::DomainEvent;

/// Custom per-user predicate of a channel: `(user_id, event) -> deliver?`.
pub type UserFilter = Arc<dyn Fn(&str, &DomainEvent) -> bool + Send + Sync>;

/// Routing and access rules of a named channel.
#[derive(Clone)]
pub struct RealtimeChannelConfig {
    pub channel_name: String,
    /// Private channels are only reached by explicit name.
    pub is_private: bool,
    /// Anonymous subscribers cannot join.
    pub require_auth: bool,
    /// Only subscribers holding one of these roles receive broadcasts.
    pub allowed_roles: Option<BTreeSet<String>>,
    /// Event types this channel receives without being named (`*` for all).
    pub event_types: Option<BTreeSet<String>>,
    pub user_filter: Option<UserFilter>,
}

impl RealtimeChannelConfig {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            is_private: false,
            require_auth: false,
            allowed_roles: None,
            event_types: None,
            user_filter: None,
        }
    }

    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }

    pub fn requiring_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn allow_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_user_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &DomainEvent) -> bool + Send + Sync + 'static,
    {
        self.user_filter = Some(Arc::new(filter));
        self
    }

    /// Whether an un-addressed publish of `event_type` targets this channel.
    pub fn routes(&self, event_type: &str) -> bool {
        !self.is_private
            && self
                .event_types
                .as_ref()
                .is_some_and(|types| types.contains(event_type) || types.contains("*"))
    }
}

impl fmt::Debug for RealtimeChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeChannelConfig")
            .field("channel_name", &self.channel_name)
            .field("is_private", &self.is_private)
            .field("require_auth", &self.require_auth)
            .field("allowed_roles", &self.allowed_roles)
            .field("event_types", &self.event_types)
            .field("user_filter", &self.user_filter.is_some())
            .finish()
    }
}

/// An external listener registered on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSubscriber {
    pub id: SubscriberId,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub roles: BTreeSet<String>,
    pub channel_name: String,
    /// Informational; delivery is decided by the channel.
    pub event_types: BTreeSet<String>,
    pub subscribed_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl RealtimeSubscriber {
    pub fn new(channel_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriberId::new(),
            user_id: None,
            session_id: None,
            roles: BTreeSet::new(),
            channel_name: channel_name.into(),
            event_types: BTreeSet::new(),
            subscribed_at: now,
            last_activity: now,
            metadata: JsonValue::Null,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types.extend(event_types.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Addressing of one realtime publish. Empty sets do not filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Send only to this channel instead of every routed one.
    pub channel_name: Option<String>,
    pub target_users: BTreeSet<String>,
    pub exclude_users: BTreeSet<String>,
    pub target_roles: BTreeSet<String>,
    pub include_metadata: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            channel_name: None,
            target_users: BTreeSet::new(),
            exclude_users: BTreeSet::new(),
            target_roles: BTreeSet::new(),
            include_metadata: true,
        }
    }
}

impl BroadcastOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = Some(channel_name.into());
        self
    }

    pub fn to_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_users.extend(users.into_iter().map(Into::into));
        self
    }

    pub fn excluding_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_users.extend(users.into_iter().map(Into::into));
        self
    }

    pub fn to_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.include_metadata = false;
        self
    }
}

/// Outcome of one channel broadcast.
///
/// `delivered_count` is the number of intended recipients after filtering,
/// not a confirmed delivery count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeNotificationResult {
    pub broadcast_id: BroadcastId,
    pub channel_name: String,
    pub delivered_count: usize,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// History entry of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub broadcast_id: BroadcastId,
    pub channel_name: String,
    pub event_id: EventId,
    pub event_type: String,
    pub delivered_count: usize,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel_name: String,
    pub is_private: bool,
    pub require_auth: bool,
    pub subscriber_count: usize,
    /// Distinct authenticated users among the subscribers.
    pub user_count: usize,
    /// Broadcasts still held in history.
    pub recent_broadcasts: usize,
    pub last_broadcast_at: Option<DateTime<Utc>>,
}

/// Narrow a channel's subscribers to the recipients of one broadcast.
///
/// Filters apply in order: target users, excluded users, target roles, the
/// channel's allowed roles, then the channel's user filter. A subscriber
/// without a user id never passes a user filter.
pub(crate) fn select_recipients<'a>(
    channel: &RealtimeChannelConfig,
    subscribers: impl IntoIterator<Item = &'a RealtimeSubscriber>,
    options: &BroadcastOptions,
    event: &DomainEvent,
) -> Vec<&'a RealtimeSubscriber> {
    subscribers
        .into_iter()
        .filter(|s| {
            options.target_users.is_empty()
                || s.user_id
                    .as_ref()
                    .is_some_and(|u| options.target_users.contains(u))
        })
        .filter(|s| {
            s.user_id
                .as_ref()
                .is_none_or(|u| !options.exclude_users.contains(u))
        })
        .filter(|s| options.target_roles.is_empty() || !s.roles.is_disjoint(&options.target_roles))
        .filter(|s| {
            channel
                .allowed_roles
                .as_ref()
                .is_none_or(|allowed| !s.roles.is_disjoint(allowed))
        })
        .filter(|s| {
            channel
                .user_filter
                .as_ref()
                .is_none_or(|f| s.user_id.as_deref().is_some_and(|u| f(u, event)))
        })
        .collect()
}
