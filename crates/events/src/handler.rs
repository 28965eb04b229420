//! Event handler capability.
//!
//! The bus only ever sees `dyn EventHandler`; concrete handlers (payroll
//! ledger sync, audit writer, notification fan-out, ...) live with the code
//! that owns the concern.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::{DomainEvent, EventMetadata};

/// Default subscription priority for handlers that do not override it.
pub const DEFAULT_HANDLER_PRIORITY: i32 = 100;

/// Failure raised by a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A failure that may succeed if attempted again.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away by retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Something that reacts to published domain events.
///
/// Lower `priority()` values run earlier.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Human readable name, used as the default subscriber name.
    fn name(&self) -> &str;

    /// Whether this handler understands `event_type`.
    fn can_handle(&self, event_type: &str) -> bool;

    async fn handle(&self, event: &DomainEvent, metadata: &EventMetadata)
    -> Result<(), HandlerError>;

    fn priority(&self) -> i32 {
        DEFAULT_HANDLER_PRIORITY
    }
}

type HandlerFn = dyn Fn(&DomainEvent, &EventMetadata) -> Result<(), HandlerError> + Send + Sync;

/// Handler backed by a synchronous closure.
///
/// Handles every event type unless restricted with [`FnHandler::only`].
pub struct FnHandler {
    name: String,
    priority: i32,
    accepts: Option<BTreeSet<String>>,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&DomainEvent, &EventMetadata) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority: DEFAULT_HANDLER_PRIORITY,
            accepts: None,
            f: Box::new(f),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict `can_handle` to the given event types.
    pub fn only<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepts = Some(event_types.into_iter().map(Into::into).collect());
        self
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("accepts", &self.accepts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, event_type: &str) -> bool {
        self.accepts
            .as_ref()
            .is_none_or(|types| types.contains(event_type))
    }

    async fn handle(
        &self,
        event: &DomainEvent,
        metadata: &EventMetadata,
    ) -> Result<(), HandlerError> {
        (self.f)(event, metadata)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
