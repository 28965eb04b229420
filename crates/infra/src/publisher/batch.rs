use std::time::Instant;

use futures::future::join_all;
use tracing::{info, warn};

use hrms_events::{BatchPublishResult, DomainEvent, EventMetadata, PublishContext, PublishResult};

use super::{EventPublisher, default_metadata};
use crate::event_store::NewEventRecord;

/// One event of a batch with its own context.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub event: DomainEvent,
    pub context: PublishContext,
    pub metadata: Option<EventMetadata>,
}

impl BatchEntry {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event,
            context: PublishContext::default(),
            metadata: None,
        }
    }

    pub fn with_context(mut self, context: PublishContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl From<DomainEvent> for BatchEntry {
    fn from(event: DomainEvent) -> Self {
        Self::new(event)
    }
}

/// How a batch is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Publish each chunk concurrently and keep going past failures. When
    /// false, events are published one by one and the batch stops at the first
    /// failure; the rest are reported as skipped.
    pub continue_on_error: bool,
    /// Persist each chunk with a single all-or-nothing insert before dispatch.
    pub enable_transaction: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            enable_transaction: false,
        }
    }
}

impl BatchOptions {
    pub fn stop_on_error(mut self) -> Self {
        self.continue_on_error = false;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.enable_transaction = true;
        self
    }
}

impl EventPublisher {
    /// Publish `entries` in chunks of `max_batch_size`.
    pub async fn publish_batch(
        &self,
        entries: Vec<BatchEntry>,
        options: BatchOptions,
    ) -> BatchPublishResult {
        let started = Instant::now();
        let total = entries.len();
        if total == 0 {
            return BatchPublishResult::empty();
        }

        let chunk_size = self.inner.config.max_batch_size.max(1);
        let mut results = Vec::with_capacity(total);

        for chunk in entries.chunks(chunk_size) {
            let stop = if options.enable_transaction {
                let chunk_results = self.publish_chunk_transactional(chunk).await;
                let failed = chunk_results.iter().any(|r| !r.success);
                results.extend(chunk_results);
                failed && !options.continue_on_error
            } else if options.continue_on_error {
                let chunk_results = join_all(
                    chunk
                        .iter()
                        .map(|e| self.publish_inner(&e.event, &e.context, e.metadata.clone(), true)),
                )
                .await;
                results.extend(chunk_results);
                false
            } else {
                let mut failed = false;
                for entry in chunk {
                    let result = self
                        .publish_inner(&entry.event, &entry.context, entry.metadata.clone(), true)
                        .await;
                    failed = !result.success;
                    results.push(result);
                    if failed {
                        break;
                    }
                }
                failed
            };

            if stop {
                warn!(
                    attempted = results.len(),
                    total,
                    "batch stopped at first failure"
                );
                break;
            }
        }

        let batch = BatchPublishResult::from_results(total, results, started.elapsed());
        info!(
            total = batch.summary.total,
            successful = batch.summary.successful,
            failed = batch.summary.failed,
            skipped = batch.summary.skipped,
            transactional = options.enable_transaction,
            "batch published"
        );
        batch
    }

    /// Insert the whole chunk in one store call, then dispatch in order.
    ///
    /// A failed insert rejects every event of the chunk; nothing is dispatched.
    async fn publish_chunk_transactional(&self, chunk: &[BatchEntry]) -> Vec<PublishResult> {
        let prepared: Vec<(&BatchEntry, EventMetadata)> = chunk
            .iter()
            .map(|e| {
                let metadata = e
                    .metadata
                    .clone()
                    .unwrap_or_else(|| default_metadata(&e.context));
                (e, metadata)
            })
            .collect();

        if let Some(store) = self.inner.bus.store() {
            let records = prepared
                .iter()
                .map(|(e, m)| NewEventRecord::from_context(e.event.clone(), m.clone(), &e.context))
                .collect();
            if let Err(err) = store.save_events(records).await {
                warn!(events = chunk.len(), error = %err, "transactional chunk rejected");
                let message = err.to_string();
                return prepared
                    .iter()
                    .map(|_| PublishResult::rejected(None, message.clone()))
                    .collect();
            }
        }

        let mut results = Vec::with_capacity(prepared.len());
        for (entry, metadata) in &prepared {
            let result = self
                .inner
                .bus
                .publish_persisted(&entry.event, metadata, Some(&entry.context))
                .await;
            self.forward_realtime(&entry.event, metadata, &entry.context)
                .await;
            results.push(result);
        }
        results
    }
}
