//! Append-only event store boundary.
//!
//! The only storage seam of the engine: per-stream append with optimistic
//! concurrency, ordered reads, and stream discovery by aggregate type.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
