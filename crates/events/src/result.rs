//! Publish outcome value objects.
//!
//! Always built fresh per call and never persisted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hrms_core::{EventId, SubscriptionId};

/// Outcome of running one subscription's handler for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub subscription_id: SubscriptionId,
    pub handler_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub retryable: bool,
    pub duration: Duration,
}

/// Outcome of publishing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// `None` when persistence was enabled and failed.
    pub event_id: Option<EventId>,
    /// AND of every handler outcome, false on persistence failure.
    pub success: bool,
    pub handler_results: Vec<HandlerOutcome>,
    pub execution_time: Duration,
    pub persistence_error: Option<String>,
}

impl PublishResult {
    pub fn failed_handlers(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.handler_results.iter().filter(|r| !r.success)
    }

    /// A result for an event that never reached dispatch.
    pub fn rejected(event_id: Option<EventId>, error: impl Into<String>) -> Self {
        Self {
            event_id,
            success: false,
            handler_results: Vec::new(),
            execution_time: Duration::ZERO,
            persistence_error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Events never attempted because a sequential batch stopped early.
    pub skipped: usize,
}

/// Outcome of a batch publish, one result per attempted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPublishResult {
    pub results: Vec<PublishResult>,
    pub summary: BatchSummary,
    pub execution_time: Duration,
}

impl BatchPublishResult {
    /// Summarise `results` against the `total` number of submitted events.
    pub fn from_results(total: usize, results: Vec<PublishResult>, execution_time: Duration) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        Self {
            summary: BatchSummary {
                total,
                successful,
                failed,
                skipped: total.saturating_sub(results.len()),
            },
            results,
            execution_time,
        }
    }

    pub fn empty() -> Self {
        Self::from_results(0, Vec::new(), Duration::ZERO)
    }

    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0 && self.summary.skipped == 0
    }
}
