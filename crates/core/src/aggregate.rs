//! Aggregate streams and the replay contract for event-sourced models.

use serde::{Deserialize, Serialize};

use crate::id::AggregateId;

/// Reference to an aggregate stream: the `(aggregate_id, aggregate_type)` pair
/// that scopes a monotonically versioned sequence of events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
}

impl AggregateRef {
    pub fn new(aggregate_id: AggregateId, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
        }
    }
}

/// State that can be rebuilt by replaying its ordered event stream.
///
/// `apply` must be deterministic; replaying the same stream always yields the
/// same state. The replay driver feeds events in ascending `version` order and
/// passes each record's version so implementations can track their own
/// position in the stream.
pub trait Aggregate: Default {
    type Event;

    /// Stable aggregate type name (the `aggregate_type` column of the log).
    fn aggregate_type() -> &'static str;

    /// Evolve in-memory state from a single event at `version`.
    fn apply(&mut self, event: &Self::Event, version: u64);

    /// Version of the last applied event (0 when nothing was applied).
    fn version(&self) -> u64;
}
