//! Infrastructure of the HRMS event backbone.
//!
//! - `event_store`: durable append-only event log (in-memory and Postgres)
//! - `event_bus`: in-process dispatch to subscribed handlers
//! - `publisher`: batch, after-commit and scheduled publishing
//! - `realtime`: channel-based fan-out to external subscribers
//! - `dead_letter`: undeliverable events, when enabled
//! - `config`: environment-driven configuration

pub mod config;
pub mod dead_letter;
pub mod event_bus;
pub mod event_store;
pub mod publisher;
pub mod realtime;
