//! `sagaflow-core`: event-sourcing building blocks.
//!
//! Ids, the domain error model and the aggregate contract. Nothing here
//! touches storage, threads or the clock.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, EventSourced, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
