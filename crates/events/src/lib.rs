//! Domain events for the HRMS backbone.
//!
//! - `event`: the closed set of typed events raised by business operations
//! - `metadata`: delivery metadata and the publish context
//! - `handler`: the capability interface the bus dispatches to
//! - `subscription` / `result`: value objects exchanged with the bus

pub mod event;
pub mod handler;
pub mod metadata;
pub mod result;
pub mod subscription;

pub use event::{
    AuditTrailRecorded, DomainEvent, EmployeeCreated, EmployeeTerminated, EmployeeUpdated,
    EventPayload, InsuranceContributionCalculated, PayrollApproval, PayrollCalculated, PayrollPaid,
    SystemAlert, TaxWithholdingCalculated, aggregate_types, event_types,
};
pub use handler::{DEFAULT_HANDLER_PRIORITY, EventHandler, FnHandler, HandlerError};
pub use metadata::{EventCategory, EventMetadata, EventPriority, PublishContext, new_correlation_id};
pub use result::{BatchPublishResult, BatchSummary, HandlerOutcome, PublishResult};
pub use subscription::{
    EventSubscription, EventTypeFilter, LastError, SubscriptionMetadata, SubscriptionOptions,
};
