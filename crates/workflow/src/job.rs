use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sagaflow_core::{Aggregate, DomainError, TenantId};
use sagaflow_events::Event;

use crate::ids::{ActivityId, JobId};

/// Lifecycle of a background job.
///
/// ```text
/// Pending --dispatch--> Running --success--> Completed
///                          |
///                        error
///                          v
///                       Failed --retries left--> Retrying --dispatch--> Running
/// ```
///
/// `Failed` with no retries left is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    /// Only `Pending` and `Retrying` jobs may be picked up by a scheduler.
    pub fn accepts_dispatch(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

/// Aggregate root: BackgroundJob.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJob {
    id: JobId,
    name: String,
    job_type: String,
    payload: JsonValue,
    tenant_id: Option<TenantId>,
    activity_id: Option<ActivityId>,
    status: JobStatus,
    retry_count: u32,
    max_retries: u32,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    result: Option<String>,
    error: Option<String>,
    created: bool,
}

impl BackgroundJob {
    pub fn id_typed(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler registry key.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// The activity this job executes one attempt of, if any.
    pub fn activity_id(&self) -> Option<ActivityId> {
        self.activity_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// When the latest attempt started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
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

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Dispatchable and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.created && self.status.accepts_dispatch() && self.scheduled_at <= now
    }

    /// Failed with every retry spent.
    pub fn is_exhausted(&self) -> bool {
        self.status == JobStatus::Failed && !self.has_retries_left()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobCommand {
    Schedule {
        job_id: JobId,
        name: String,
        job_type: String,
        payload: JsonValue,
        tenant_id: TenantId,
        activity_id: Option<ActivityId>,
        max_retries: u32,
        scheduled_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Start {
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
    /// Move a failed job back into the dispatch queue after `delay_secs`.
    ScheduleRetry {
        delay_secs: u64,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Scheduled {
        job_id: JobId,
        name: String,
        job_type: String,
        payload: JsonValue,
        tenant_id: TenantId,
        activity_id: Option<ActivityId>,
        max_retries: u32,
        scheduled_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Started {
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
    RetryScheduled {
        retry_count: u32,
        delay_secs: u64,
        scheduled_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for JobEvent {
    fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Scheduled { .. } => "workflow.job.scheduled",
            JobEvent::Started { .. } => "workflow.job.started",
            JobEvent::Completed { .. } => "workflow.job.completed",
            JobEvent::Failed { .. } => "workflow.job.failed",
            JobEvent::RetryScheduled { .. } => "workflow.job.retry_scheduled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Scheduled { occurred_at, .. }
            | JobEvent::Started { occurred_at }
            | JobEvent::Completed { occurred_at, .. }
            | JobEvent::Failed { occurred_at, .. }
            | JobEvent::RetryScheduled { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for BackgroundJob {
    type Id = JobId;
    type Command = JobCommand;
    type Event = JobEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "workflow.job";

    fn empty(id: Self::Id) -> Self {
        Self {
            id,
            name: String::new(),
            job_type: String::new(),
            payload: JsonValue::Null,
            tenant_id: None,
            activity_id: None,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 0,
            scheduled_at: DateTime::<Utc>::UNIX_EPOCH,
            started_at: None,
            result: None,
            error: None,
            created: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            JobEvent::Scheduled {
                job_id,
                name,
                job_type,
                payload,
                tenant_id,
                activity_id,
                max_retries,
                scheduled_at,
                ..
            } => {
                self.id = *job_id;
                self.name = name.clone();
                self.job_type = job_type.clone();
                self.payload = payload.clone();
                self.tenant_id = Some(*tenant_id);
                self.activity_id = *activity_id;
                self.max_retries = *max_retries;
                self.scheduled_at = *scheduled_at;
                self.status = JobStatus::Pending;
                self.created = true;
            }
            JobEvent::Started { occurred_at } => {
                self.status = JobStatus::Running;
                self.started_at = Some(*occurred_at);
            }
            JobEvent::Completed { result, .. } => {
                self.status = JobStatus::Completed;
                self.result = Some(result.clone());
                self.error = None;
            }
            JobEvent::Failed { error, .. } => {
                self.status = JobStatus::Failed;
                self.error = Some(error.clone());
            }
            JobEvent::RetryScheduled {
                retry_count,
                scheduled_at,
                ..
            } => {
                self.status = JobStatus::Retrying;
                self.retry_count = *retry_count;
                self.scheduled_at = *scheduled_at;
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            JobCommand::Schedule {
                job_id,
                name,
                job_type,
                payload,
                tenant_id,
                activity_id,
                max_retries,
                scheduled_at,
                occurred_at,
            } => {
                if self.created {
                    return Err(DomainError::conflict("job already scheduled"));
                }
                if *job_id != self.id {
                    return Err(DomainError::invariant("job_id mismatch"));
                }
                if name.trim().is_empty() {
                    return Err(DomainError::validation("job name cannot be empty"));
                }
                if job_type.trim().is_empty() {
                    return Err(DomainError::validation("job_type cannot be empty"));
                }
                Ok(vec![JobEvent::Scheduled {
                    job_id: *job_id,
                    name: name.clone(),
                    job_type: job_type.clone(),
                    payload: payload.clone(),
                    tenant_id: *tenant_id,
                    activity_id: *activity_id,
                    max_retries: *max_retries,
                    scheduled_at: *scheduled_at,
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::Start { occurred_at } => {
                self.ensure_created()?;
                if !self.status.accepts_dispatch() {
                    return Err(DomainError::invalid_transition("job", self.status, "start"));
                }
                Ok(vec![JobEvent::Started {
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::Complete {
                result,
                occurred_at,
            } => {
                self.require(JobStatus::Running, "complete")?;
                Ok(vec![JobEvent::Completed {
                    result: result.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::Fail { error, occurred_at } => {
                self.require(JobStatus::Running, "fail")?;
                Ok(vec![JobEvent::Failed {
                    error: error.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            JobCommand::ScheduleRetry {
                delay_secs,
                occurred_at,
            } => {
                self.require(JobStatus::Failed, "retry")?;
                if !self.has_retries_left() {
                    return Err(DomainError::invariant(format!(
                        "job exhausted its {} retries",
                        self.max_retries
                    )));
                }
                let delay = chrono::Duration::seconds(i64::try_from(*delay_secs).map_err(
                    |_| DomainError::validation(format!("retry delay {delay_secs}s is too large")),
                )?);
                Ok(vec![JobEvent::RetryScheduled {
                    retry_count: self.retry_count + 1,
                    delay_secs: *delay_secs,
                    scheduled_at: *occurred_at + delay,
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl BackgroundJob {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if self.created {
            Ok(())
        } else {
            Err(DomainError::not_found())
        }
    }

    fn require(&self, expected: JobStatus, action: &str) -> Result<(), DomainError> {
        self.ensure_created()?;
        if self.status != expected {
            return Err(DomainError::invalid_transition("job", self.status, action));
        }
        Ok(())
    }
}
