//! `hrms-core`: identifiers and domain primitives shared by the event backbone.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRef};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, BroadcastId, EventId, ScheduleId, SubscriberId, SubscriptionId};
