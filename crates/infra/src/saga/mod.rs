//! Saga orchestration: activity sequencing and reverse-order compensation.

pub mod coordinator;

pub use coordinator::{ActivityStep, SagaCoordinator, SagaError, SagaStarted, StartSaga};
