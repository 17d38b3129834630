use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sagaflow_core::{Aggregate, DomainError};
use sagaflow_events::Event;

use crate::ids::{ActivityId, SagaId, WorkflowId};

/// Lifecycle of a single workflow step.
///
/// ```text
/// Pending -> Running -> Completed -> Compensating -> Compensated
///               |                         |
///               v                         v
///             Failed                    Failed
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Aggregate root: Activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    id: ActivityId,
    workflow_id: Option<WorkflowId>,
    saga_id: Option<SagaId>,
    activity_type: String,
    input: JsonValue,
    max_retries: Option<u32>,
    status: ActivityStatus,
    attempt_count: u32,
    result: Option<String>,
    error: Option<String>,
    created: bool,
}

impl Activity {
    pub fn id_typed(&self) -> ActivityId {
        self.id
    }

    pub fn workflow_id(&self) -> Option<WorkflowId> {
        self.workflow_id
    }

    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    /// Handler registry key for this step.
    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    /// Retry budget for the jobs executing this step; `None` defers to the scheduler default.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn status(&self) -> ActivityStatus {
        self.status
    }

    /// Attempts dispatched so far (first run plus every retry).
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityCommand {
    Create {
        activity_id: ActivityId,
        workflow_id: WorkflowId,
        saga_id: Option<SagaId>,
        activity_type: String,
        input: JsonValue,
        max_retries: Option<u32>,
        occurred_at: DateTime<Utc>,
    },
    Start {
        occurred_at: DateTime<Utc>,
    },
    /// A failed attempt that will be retried; the activity stays `Running`.
    RecordFailedAttempt {
        error: String,
        occurred_at: DateTime<Utc>,
    },
    Complete {
        result: String,
        occurred_at: DateTime<Utc>,
    },
    Fail {
        error: String,
        occurred_at: DateTime<Utc>,
    },
    BeginCompensation {
        occurred_at: DateTime<Utc>,
    },
    CompleteCompensation {
        occurred_at: DateTime<Utc>,
    },
    FailCompensation {
        error: String,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityEvent {
    Created {
        activity_id: ActivityId,
        workflow_id: WorkflowId,
        saga_id: Option<SagaId>,
        activity_type: String,
        input: JsonValue,
        max_retries: Option<u32>,
        occurred_at: DateTime<Utc>,
    },
    Started {
        occurred_at: DateTime<Utc>,
    },
    AttemptFailed {
        error: String,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        result: String,
        occurred_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        occurred_at: DateTime<Utc>,
    },
    CompensationStarted {
        occurred_at: DateTime<Utc>,
    },
    Compensated {
        occurred_at: DateTime<Utc>,
    },
    CompensationFailed {
        error: String,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for ActivityEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ActivityEvent::Created { .. } => "workflow.activity.created",
            ActivityEvent::Started { .. } => "workflow.activity.started",
            ActivityEvent::AttemptFailed { .. } => "workflow.activity.attempt_failed",
            ActivityEvent::Completed { .. } => "workflow.activity.completed",
            ActivityEvent::Failed { .. } => "workflow.activity.failed",
            ActivityEvent::CompensationStarted { .. } => "workflow.activity.compensation_started",
            ActivityEvent::Compensated { .. } => "workflow.activity.compensated",
            ActivityEvent::CompensationFailed { .. } => "workflow.activity.compensation_failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ActivityEvent::Created { occurred_at, .. }
            | ActivityEvent::Started { occurred_at }
            | ActivityEvent::AttemptFailed { occurred_at, .. }
            | ActivityEvent::Completed { occurred_at, .. }
            | ActivityEvent::Failed { occurred_at, .. }
            | ActivityEvent::CompensationStarted { occurred_at }
            | ActivityEvent::Compensated { occurred_at }
            | ActivityEvent::CompensationFailed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Activity {
    type Id = ActivityId;
    type Command = ActivityCommand;
    type Event = ActivityEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "workflow.activity";

    fn empty(id: Self::Id) -> Self {
        Self {
            id,
            workflow_id: None,
            saga_id: None,
            activity_type: String::new(),
            input: JsonValue::Null,
            max_retries: None,
            status: ActivityStatus::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            created: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ActivityEvent::Created {
                activity_id,
                workflow_id,
                saga_id,
                activity_type,
                input,
                max_retries,
                ..
            } => {
                self.id = *activity_id;
                self.workflow_id = Some(*workflow_id);
                self.saga_id = *saga_id;
                self.activity_type = activity_type.clone();
                self.input = input.clone();
                self.max_retries = *max_retries;
                self.status = ActivityStatus::Pending;
                self.created = true;
            }
            ActivityEvent::Started { .. } => {
                self.status = ActivityStatus::Running;
                self.attempt_count += 1;
            }
            ActivityEvent::AttemptFailed { error, .. } => {
                self.error = Some(error.clone());
                self.attempt_count += 1;
            }
            ActivityEvent::Completed { result, .. } => {
                self.status = ActivityStatus::Completed;
                self.result = Some(result.clone());
                self.error = None;
            }
            ActivityEvent::Failed { error, .. } => {
                self.status = ActivityStatus::Failed;
                self.error = Some(error.clone());
            }
            ActivityEvent::CompensationStarted { .. } => {
                self.status = ActivityStatus::Compensating;
            }
            ActivityEvent::Compensated { .. } => {
                self.status = ActivityStatus::Compensated;
            }
            ActivityEvent::CompensationFailed { error, .. } => {
                self.status = ActivityStatus::Failed;
                self.error = Some(error.clone());
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ActivityCommand::Create {
                activity_id,
                workflow_id,
                saga_id,
                activity_type,
                input,
                max_retries,
                occurred_at,
            } => {
                if self.created {
                    return Err(DomainError::conflict("activity already exists"));
                }
                if *activity_id != self.id {
                    return Err(DomainError::invariant("activity_id mismatch"));
                }
                if activity_type.trim().is_empty() {
                    return Err(DomainError::validation("activity_type cannot be empty"));
                }
                Ok(vec![ActivityEvent::Created {
                    activity_id: *activity_id,
                    workflow_id: *workflow_id,
                    saga_id: *saga_id,
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    max_retries: *max_retries,
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::Start { occurred_at } => {
                self.require(ActivityStatus::Pending, "start")?;
                Ok(vec![ActivityEvent::Started {
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::RecordFailedAttempt { error, occurred_at } => {
                self.require(ActivityStatus::Running, "record a failed attempt on")?;
                Ok(vec![ActivityEvent::AttemptFailed {
                    error: error.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::Complete {
                result,
                occurred_at,
            } => {
                self.require(ActivityStatus::Running, "complete")?;
                Ok(vec![ActivityEvent::Completed {
                    result: result.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::Fail { error, occurred_at } => {
                self.require(ActivityStatus::Running, "fail")?;
                Ok(vec![ActivityEvent::Failed {
                    error: error.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::BeginCompensation { occurred_at } => {
                self.require(ActivityStatus::Completed, "compensate")?;
                Ok(vec![ActivityEvent::CompensationStarted {
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::CompleteCompensation { occurred_at } => {
                self.require(ActivityStatus::Compensating, "finish compensating")?;
                Ok(vec![ActivityEvent::Compensated {
                    occurred_at: *occurred_at,
                }])
            }
            ActivityCommand::FailCompensation { error, occurred_at } => {
                self.require(ActivityStatus::Compensating, "fail compensation of")?;
                Ok(vec![ActivityEvent::CompensationFailed {
                    error: error.clone(),
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl Activity {
    fn require(&self, expected: ActivityStatus, action: &str) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.status != expected {
            return Err(DomainError::invalid_transition("activity", self.status, action));
        }
        Ok(())
    }
}
