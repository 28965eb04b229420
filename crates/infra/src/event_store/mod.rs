//! Append-only domain event log.
//!
//! `EventStore` is the persistence boundary; `InMemoryEventStore` serves
//! tests/dev and `PostgresEventStore` production. `replay` folds an aggregate
//! stream back into state.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod replay;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{
    EventQuery, EventQueryResult, EventStats, Pagination, SortDirection, SortField, StoreHealth,
    UserActivity,
};
pub use replay::{catch_up, rehydrate};
pub use r#trait::{EventStore, EventStoreRecord, NewEventRecord, PersistenceError};
