//! Background job execution: handler registry, retry policy, scheduler.
//!
//! ## Components
//!
//! - `HandlerRegistry`: type key -> pluggable `JobHandler`
//! - `RetryPolicy`: exponential backoff between attempts
//! - `JobScheduler`: persists `BackgroundJob`s, executes them, polls for due work

pub mod registry;
pub mod retry;
pub mod scheduler;

pub use registry::{
    compensation_key, execute_with_timeout, HandlerError, HandlerRegistry, JobHandler,
    COMPENSATION_SUFFIX,
};
pub use retry::RetryPolicy;
pub use scheduler::{
    ExecutionOutcome, JobObserver, JobRequest, JobScheduler, JobStats, SchedulerError,
    SchedulerHandle, SchedulerStats,
};
