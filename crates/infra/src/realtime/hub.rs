//! Channel registry, subscriber registry and broadcast history.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use hrms_core::{BroadcastId, SubscriberId};
use hrms_events::{DomainEvent, EventMetadata, PublishContext};

use super::channel::{
    BroadcastOptions, BroadcastRecord, ChannelStats, RealtimeChannelConfig,
    RealtimeNotificationResult, RealtimeSubscriber, select_recipients,
};
use super::transport::{BroadcastPayload, RealtimeTransport};
use super::RealtimeError;
use crate::config::RealtimeConfig;
use crate::publisher::RealtimeSink;

/// Name of the private channel of `user_id`.
pub fn user_channel_name(user_id: &str) -> String {
    format!("user-{user_id}")
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, RealtimeChannelConfig>,
    subscribers: HashMap<SubscriberId, RealtimeSubscriber>,
    history: VecDeque<BroadcastRecord>,
}

/// Owns realtime channels and their subscribers and sends broadcasts through
/// a [`RealtimeTransport`].
pub struct RealtimeHub {
    config: RealtimeConfig,
    transport: Arc<dyn RealtimeTransport>,
    state: RwLock<HubState>,
}

impl RealtimeHub {
    /// `history_retain` is clamped to `history_capacity`.
    pub fn new(mut config: RealtimeConfig, transport: Arc<dyn RealtimeTransport>) -> Self {
        if config.history_retain > config.history_capacity {
            warn!(
                history_retain = config.history_retain,
                history_capacity = config.history_capacity,
                "history_retain exceeds history_capacity; clamping"
            );
            config.history_retain = config.history_capacity;
        }
        Self {
            config,
            transport,
            state: RwLock::new(HubState::default()),
        }
    }

    /// Register a channel. `Ok(false)` if the name is already taken.
    pub async fn create_channel(&self, channel: RealtimeChannelConfig) -> Result<bool, RealtimeError> {
        let name = channel.channel_name.clone();
        {
            let mut state = self.state.write().await;
            if state.channels.contains_key(&name) {
                debug!(channel = %name, "channel already exists");
                return Ok(false);
            }
            state.channels.insert(name.clone(), channel);
        }

        if let Err(err) = self.transport.open_channel(&name).await {
            self.state.write().await.channels.remove(&name);
            return Err(err.into());
        }
        info!(channel = %name, "realtime channel created");
        Ok(true)
    }

    /// Remove a channel and every subscriber registered on it.
    pub async fn remove_channel(&self, channel_name: &str) -> bool {
        let dropped = {
            let mut state = self.state.write().await;
            if state.channels.remove(channel_name).is_none() {
                return false;
            }
            let before = state.subscribers.len();
            state.subscribers.retain(|_, s| s.channel_name != channel_name);
            before - state.subscribers.len()
        };

        if let Err(err) = self.transport.close_channel(channel_name).await {
            warn!(channel = channel_name, error = %err, "failed to close transport channel");
        }
        info!(channel = channel_name, subscribers = dropped, "realtime channel removed");
        true
    }

    pub async fn has_channel(&self, channel_name: &str) -> bool {
        self.state.read().await.channels.contains_key(channel_name)
    }

    pub async fn register_subscriber(
        &self,
        subscriber: RealtimeSubscriber,
    ) -> Result<SubscriberId, RealtimeError> {
        let mut state = self.state.write().await;
        let channel = state
            .channels
            .get(&subscriber.channel_name)
            .ok_or_else(|| RealtimeError::ChannelNotFound(subscriber.channel_name.clone()))?;
        if channel.require_auth && subscriber.user_id.is_none() {
            return Err(RealtimeError::AuthRequired(subscriber.channel_name.clone()));
        }

        let id = subscriber.id;
        debug!(
            subscriber_id = %id,
            channel = %subscriber.channel_name,
            user_id = subscriber.user_id.as_deref().unwrap_or("-"),
            "realtime subscriber registered"
        );
        state.subscribers.insert(id, subscriber);
        Ok(id)
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.state.write().await.subscribers.remove(&id).is_some()
    }

    /// Refresh `last_activity` of a subscriber.
    pub async fn touch_subscriber(&self, id: SubscriberId) -> bool {
        let mut state = self.state.write().await;
        match state.subscribers.get_mut(&id) {
            Some(s) => {
                s.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn subscribers(&self, channel_name: &str) -> Vec<RealtimeSubscriber> {
        let state = self.state.read().await;
        let mut subs: Vec<RealtimeSubscriber> = state
            .subscribers
            .values()
            .filter(|s| s.channel_name == channel_name)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.subscribed_at);
        subs
    }

    /// Create the private channel of `user_id` if missing; returns its name.
    pub async fn ensure_user_channel(&self, user_id: &str) -> Result<String, RealtimeError> {
        let name = user_channel_name(user_id);
        if self.has_channel(&name).await {
            return Ok(name);
        }
        let owner = user_id.to_string();
        let channel = RealtimeChannelConfig::new(name.clone())
            .private()
            .requiring_auth()
            .with_user_filter(move |uid, _| uid == owner);
        self.create_channel(channel).await?;
        Ok(name)
    }

    /// Broadcast to `options.channel_name`, or to every channel that routes
    /// the event type when no channel is named.
    pub async fn publish(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
        options: &BroadcastOptions,
    ) -> Vec<RealtimeNotificationResult> {
        let targets = match &options.channel_name {
            Some(name) => vec![name.clone()],
            None => self.routed_channels(event.event_type()).await,
        };
        if targets.is_empty() {
            debug!(event_type = event.event_type(), "no realtime channel routes event");
        }

        let mut results = Vec::with_capacity(targets.len());
        for channel in targets {
            results.push(self.broadcast(&channel, event, metadata, context, options).await);
        }
        results
    }

    async fn routed_channels(&self, event_type: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .channels
            .values()
            .filter(|c| c.routes(event_type))
            .map(|c| c.channel_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Broadcast to one channel. Failures are reported in the result.
    pub async fn broadcast(
        &self,
        channel_name: &str,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
        options: &BroadcastOptions,
    ) -> RealtimeNotificationResult {
        let broadcast_id = BroadcastId::new();
        let outcome = self
            .send(channel_name, event, metadata, context, options)
            .await;

        let (delivered_count, error) = match outcome {
            Ok(n) => (n, None),
            Err(err) => {
                warn!(
                    channel = channel_name,
                    event_id = %event.id(),
                    error = %err,
                    "realtime broadcast failed"
                );
                (0, Some(err.to_string()))
            }
        };
        let result = RealtimeNotificationResult {
            broadcast_id,
            channel_name: channel_name.to_string(),
            delivered_count,
            success: error.is_none(),
            error,
            timestamp: Utc::now(),
        };
        self.record(&result, event).await;
        result
    }

    async fn send(
        &self,
        channel_name: &str,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
        options: &BroadcastOptions,
    ) -> Result<usize, RealtimeError> {
        let recipients = {
            let state = self.state.read().await;
            let channel = state
                .channels
                .get(channel_name)
                .ok_or_else(|| RealtimeError::ChannelNotFound(channel_name.to_string()))?;
            let members = state
                .subscribers
                .values()
                .filter(|s| s.channel_name == channel_name);
            select_recipients(channel, members, options, event).len()
        };

        let event_data = event.payload_json().map_err(|e| RealtimeError::PublishFailed {
            event_id: event.id(),
            reason: e.to_string(),
        })?;
        let payload = BroadcastPayload {
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            event_data,
            context: context.clone(),
            metadata: options.include_metadata.then(|| metadata.clone()),
            timestamp: Utc::now(),
        };
        self.transport
            .broadcast(channel_name, event.event_type(), &payload)
            .await?;

        debug!(
            channel = channel_name,
            event_id = %event.id(),
            recipients,
            "realtime broadcast sent"
        );
        Ok(recipients)
    }

    async fn record(&self, result: &RealtimeNotificationResult, event: &DomainEvent) {
        let mut state = self.state.write().await;
        state.history.push_back(BroadcastRecord {
            broadcast_id: result.broadcast_id,
            channel_name: result.channel_name.clone(),
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            delivered_count: result.delivered_count,
            success: result.success,
            timestamp: result.timestamp,
        });
        if state.history.len() > self.config.history_capacity {
            let excess = state.history.len().saturating_sub(self.config.history_retain);
            state.history.drain(..excess);
        }
    }

    /// Up to `limit` most recent broadcasts, newest first.
    pub async fn broadcast_history(&self, limit: usize) -> Vec<BroadcastRecord> {
        let state = self.state.read().await;
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn channel_stats(&self) -> Vec<ChannelStats> {
        let state = self.state.read().await;
        let mut stats: Vec<ChannelStats> = state
            .channels
            .values()
            .map(|c| {
                let subs: Vec<&RealtimeSubscriber> = state
                    .subscribers
                    .values()
                    .filter(|s| s.channel_name == c.channel_name)
                    .collect();
                let users: BTreeSet<&str> = subs.iter().filter_map(|s| s.user_id.as_deref()).collect();
                let broadcasts = state
                    .history
                    .iter()
                    .filter(|h| h.channel_name == c.channel_name);
                ChannelStats {
                    channel_name: c.channel_name.clone(),
                    is_private: c.is_private,
                    require_auth: c.require_auth,
                    subscriber_count: subs.len(),
                    user_count: users.len(),
                    recent_broadcasts: broadcasts.clone().count(),
                    last_broadcast_at: broadcasts.map(|h| h.timestamp).max(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
        stats
    }
}

#[async_trait]
impl RealtimeSink for RealtimeHub {
    async fn forward(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
        context: &PublishContext,
    ) -> Result<usize, RealtimeError> {
        let results = self
            .publish(event, metadata, context, &BroadcastOptions::default())
            .await;
        let errors: Vec<String> = results.iter().filter_map(|r| r.error.clone()).collect();
        if !errors.is_empty() {
            return Err(RealtimeError::PublishFailed {
                event_id: event.id(),
                reason: errors.join("; "),
            });
        }
        Ok(results.iter().map(|r| r.delivered_count).sum())
    }
}
