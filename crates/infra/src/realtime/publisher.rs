use std::sync::Arc;

use tracing::{debug, warn};

use hrms_core::SubscriberId;
use hrms_events::{DomainEvent, EventMetadata, PublishContext};

use super::channel::{
    BroadcastOptions, BroadcastRecord, ChannelStats, RealtimeChannelConfig,
    RealtimeNotificationResult, RealtimeSubscriber,
};
use super::hub::RealtimeHub;
use super::RealtimeError;
use crate::publisher::{EventPublisher, PublisherStatus, default_metadata, failure_reason};

/// Event publisher with realtime channel fan-out.
///
/// Installs its hub as the publisher's realtime sink, so events published
/// through the plain `EventPublisher` API reach routed channels too.
#[derive(Clone)]
pub struct RealtimeEventPublisher {
    publisher: EventPublisher,
    hub: Arc<RealtimeHub>,
}

impl RealtimeEventPublisher {
    pub fn new(publisher: EventPublisher, hub: Arc<RealtimeHub>) -> Self {
        publisher.set_realtime_sink(hub.clone());
        Self { publisher, hub }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    /// Publish through the bus, then broadcast to the target channels.
    ///
    /// Fails with [`RealtimeError::PublishFailed`] if the bus publish does not
    /// succeed; nothing is broadcast in that case. Individual channel failures
    /// are reported in their results.
    pub async fn publish_to_realtime(
        &self,
        event: &DomainEvent,
        options: BroadcastOptions,
        context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<RealtimeNotificationResult>, RealtimeError> {
        let metadata = metadata.unwrap_or_else(|| default_metadata(&context));
        let published = self
            .publisher
            .publish_inner(event, &context, Some(metadata.clone()), false)
            .await;
        if !published.success {
            let reason = failure_reason(&published);
            warn!(event_id = %event.id(), error = %reason, "realtime publish aborted");
            return Err(RealtimeError::PublishFailed {
                event_id: event.id(),
                reason,
            });
        }

        let results = self.hub.publish(event, &metadata, &context, &options).await;
        debug!(
            event_id = %event.id(),
            channels = results.len(),
            delivered = results.iter().map(|r| r.delivered_count).sum::<usize>(),
            "realtime publish complete"
        );
        Ok(results)
    }

    /// Send to the private channel of `user_id`, creating it on first use.
    pub async fn notify_user(
        &self,
        user_id: &str,
        event: &DomainEvent,
        context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<RealtimeNotificationResult>, RealtimeError> {
        let channel = self.hub.ensure_user_channel(user_id).await?;
        self.publish_to_realtime(
            event,
            BroadcastOptions::new().to_channel(channel),
            context,
            metadata,
        )
        .await
    }

    /// Send to routed channels, restricted to subscribers holding `role`.
    pub async fn notify_role(
        &self,
        role: &str,
        event: &DomainEvent,
        context: PublishContext,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<RealtimeNotificationResult>, RealtimeError> {
        self.publish_to_realtime(event, BroadcastOptions::new().to_roles([role]), context, metadata)
            .await
    }

    pub async fn create_channel(&self, channel: RealtimeChannelConfig) -> Result<bool, RealtimeError> {
        self.hub.create_channel(channel).await
    }

    pub async fn remove_channel(&self, channel_name: &str) -> bool {
        self.hub.remove_channel(channel_name).await
    }

    pub async fn register_subscriber(
        &self,
        subscriber: RealtimeSubscriber,
    ) -> Result<SubscriberId, RealtimeError> {
        self.hub.register_subscriber(subscriber).await
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.hub.remove_subscriber(id).await
    }

    pub async fn get_channel_stats(&self) -> Vec<ChannelStats> {
        self.hub.channel_stats().await
    }

    pub async fn get_broadcast_history(&self, limit: usize) -> Vec<BroadcastRecord> {
        self.hub.broadcast_history(limit).await
    }

    pub async fn get_status(&self) -> PublisherStatus {
        self.publisher.get_status().await
    }
}
