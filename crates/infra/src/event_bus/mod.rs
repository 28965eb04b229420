//! In-process event bus.
//!
//! Handlers are registered per event type (or `*`) and receive every
//! published event after it has been written to the `EventStore`.

pub mod dispatcher;
pub mod metrics;

pub use dispatcher::{BusHealth, EventBus};
pub use metrics::BusMetrics;
