//! Workflow domain module (event-sourced).
//!
//! The four aggregates that make up a saga run, implemented purely as
//! deterministic state machines (no IO, no storage, no handler calls):
//!
//! - [`Activity`]: one step of a workflow
//! - [`Workflow`]: the ordered list of activities
//! - [`Saga`]: the compensable transaction wrapping a workflow
//! - [`BackgroundJob`]: the execution vehicle driven by the scheduler

pub mod activity;
pub mod ids;
pub mod job;
pub mod saga;
pub mod workflow;

pub use activity::{Activity, ActivityCommand, ActivityEvent, ActivityStatus};
pub use ids::{ActivityId, JobId, SagaId, WorkflowId};
pub use job::{BackgroundJob, JobCommand, JobEvent, JobStatus};
pub use saga::{Saga, SagaCommand, SagaEvent, SagaStatus};
pub use workflow::{Workflow, WorkflowCommand, WorkflowEvent, WorkflowStatus};
