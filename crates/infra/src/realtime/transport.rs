use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};

use hrms_core::EventId;
use hrms_events::{EventMetadata, PublishContext};

/// Default buffer of each in-memory channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel {0} is not open")]
    ChannelClosed(String),

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Body sent on a channel; the event name is the domain event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub event_id: EventId,
    pub event_type: String,
    pub event_data: JsonValue,
    pub context: PublishContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    pub timestamp: DateTime<Utc>,
}

/// A message as seen by an in-memory channel listener.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub event_name: String,
    pub payload: BroadcastPayload,
}

/// Channel send primitive of the realtime layer.
///
/// A broadcast is fire-and-forget: the transport does not report which
/// listeners received it.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open_channel(&self, channel: &str) -> Result<(), TransportError>;

    async fn broadcast(
        &self,
        channel: &str,
        event_name: &str,
        payload: &BroadcastPayload,
    ) -> Result<(), TransportError>;

    async fn close_channel(&self, channel: &str) -> Result<(), TransportError>;
}

/// Transport over `tokio::sync::broadcast`, one sender per channel.
pub struct InMemoryTransport {
    channels: RwLock<HashMap<String, broadcast::Sender<TransportMessage>>>,
    capacity: usize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Listen on an open channel.
    pub async fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<TransportMessage>> {
        let channels = self.channels.read().await;
        channels.get(channel).map(|tx| tx.subscribe())
    }

    pub async fn listener_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().await;
        channels.get(channel).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryTransport {
    async fn open_channel(&self, channel: &str) -> Result<(), TransportError> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(())
    }

    async fn broadcast(
        &self,
        channel: &str,
        event_name: &str,
        payload: &BroadcastPayload,
    ) -> Result<(), TransportError> {
        let channels = self.channels.read().await;
        let tx = channels
            .get(channel)
            .ok_or_else(|| TransportError::ChannelClosed(channel.to_string()))?;
        // No listeners is not an error.
        let _ = tx.send(TransportMessage {
            event_name: event_name.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn close_channel(&self, channel: &str) -> Result<(), TransportError> {
        self.channels.write().await.remove(channel);
        Ok(())
    }
}
