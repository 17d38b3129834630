//! Infrastructure layer: event store, repositories, job scheduling, saga orchestration.
//!
//! Domain aggregates live in `sagaflow-workflow` and never perform IO. Everything
//! here is about persisting their events and driving them from handler outcomes.

pub mod config;
pub mod event_store;
pub mod jobs;
pub mod repository;
pub mod saga;

pub use config::{ConfigError, SchedulerConfig};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
};
pub use jobs::{
    ExecutionOutcome, HandlerError, HandlerRegistry, JobHandler, JobObserver, JobRequest,
    JobScheduler, JobStats, RetryPolicy, SchedulerError, SchedulerHandle, SchedulerStats,
};
pub use repository::{Repository, RepositoryError};
pub use saga::{ActivityStep, SagaCoordinator, SagaError, SagaStarted, StartSaga};

#[cfg(test)]
mod integration_tests;
