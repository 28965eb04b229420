//! Realtime fan-out of published events to external subscribers.
//!
//! Routing happens on named channels, independently of in-process bus
//! subscriptions. `RealtimeHub` owns channels, subscribers and the broadcast
//! history; `RealtimeEventPublisher` combines it with an `EventPublisher`.

pub mod channel;
pub mod hub;
pub mod publisher;
pub mod transport;

use thiserror::Error;

use hrms_core::EventId;

pub use channel::{
    BroadcastOptions, BroadcastRecord, ChannelStats, RealtimeChannelConfig,
    RealtimeNotificationResult, RealtimeSubscriber, UserFilter,
};
pub use hub::RealtimeHub;
pub use publisher::RealtimeEventPublisher;
pub use transport::{
    BroadcastPayload, InMemoryTransport, RealtimeTransport, TransportError, TransportMessage,
};

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("publish of event {event_id} failed: {reason}")]
    PublishFailed { event_id: EventId, reason: String },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel {0} requires an authenticated subscriber")]
    AuthRequired(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
