use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sagaflow_core::{Aggregate, DomainError, TenantId};
use sagaflow_events::Event;

use crate::ids::{ActivityId, SagaId, WorkflowId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Started,
    Running,
    Completed,
    /// Terminal: compensation itself failed and needs an operator.
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated
        )
    }
}

/// Aggregate root: Saga.
///
/// Records the activities that completed, in completion order. That list is
/// the compensation plan: undo runs over it in strict reverse, once per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saga {
    id: SagaId,
    tenant_id: Option<TenantId>,
    workflow_id: Option<WorkflowId>,
    name: String,
    status: SagaStatus,
    completed_activity_ids: Vec<ActivityId>,
    compensated_activity_ids: Vec<ActivityId>,
    failed_activity_id: Option<ActivityId>,
    failure: Option<String>,
    created: bool,
}

impl Saga {
    pub fn id_typed(&self) -> SagaId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn workflow_id(&self) -> Option<WorkflowId> {
        self.workflow_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn completed_activity_ids(&self) -> &[ActivityId] {
        &self.completed_activity_ids
    }

    pub fn compensated_activity_ids(&self) -> &[ActivityId] {
        &self.compensated_activity_ids
    }

    pub fn failed_activity_id(&self) -> Option<ActivityId> {
        self.failed_activity_id
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Completed activities not yet compensated, most recent first.
    pub fn compensation_plan(&self) -> Vec<ActivityId> {
        let remaining = self
            .completed_activity_ids
            .len()
            .saturating_sub(self.compensated_activity_ids.len());
        self.completed_activity_ids[..remaining]
            .iter()
            .rev()
            .copied()
            .collect()
    }

    /// The only activity that may be compensated next.
    pub fn next_to_compensate(&self) -> Option<ActivityId> {
        if self.status != SagaStatus::Compensating {
            return None;
        }
        self.compensation_plan().first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaCommand {
    Start {
        saga_id: SagaId,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        name: String,
        occurred_at: DateTime<Utc>,
    },
    Run {
        occurred_at: DateTime<Utc>,
    },
    RecordActivityCompleted {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    Complete {
        occurred_at: DateTime<Utc>,
    },
    BeginCompensation {
        failed_activity_id: ActivityId,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    RecordActivityCompensated {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    FinishCompensation {
        occurred_at: DateTime<Utc>,
    },
    Fail {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaEvent {
    Started {
        saga_id: SagaId,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        name: String,
        occurred_at: DateTime<Utc>,
    },
    Running {
        occurred_at: DateTime<Utc>,
    },
    ActivityCompleted {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        occurred_at: DateTime<Utc>,
    },
    CompensationStarted {
        failed_activity_id: ActivityId,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    ActivityCompensated {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    Compensated {
        occurred_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::Started { .. } => "workflow.saga.started",
            SagaEvent::Running { .. } => "workflow.saga.running",
            SagaEvent::ActivityCompleted { .. } => "workflow.saga.activity_completed",
            SagaEvent::Completed { .. } => "workflow.saga.completed",
            SagaEvent::CompensationStarted { .. } => "workflow.saga.compensation_started",
            SagaEvent::ActivityCompensated { .. } => "workflow.saga.activity_compensated",
            SagaEvent::Compensated { .. } => "workflow.saga.compensated",
            SagaEvent::Failed { .. } => "workflow.saga.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SagaEvent::Started { occurred_at, .. }
            | SagaEvent::Running { occurred_at }
            | SagaEvent::ActivityCompleted { occurred_at, .. }
            | SagaEvent::Completed { occurred_at }
            | SagaEvent::CompensationStarted { occurred_at, .. }
            | SagaEvent::ActivityCompensated { occurred_at, .. }
            | SagaEvent::Compensated { occurred_at }
            | SagaEvent::Failed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Saga {
    type Id = SagaId;
    type Command = SagaCommand;
    type Event = SagaEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "workflow.saga";

    fn empty(id: Self::Id) -> Self {
        Self {
            id,
            tenant_id: None,
            workflow_id: None,
            name: String::new(),
            status: SagaStatus::Started,
            completed_activity_ids: Vec::new(),
            compensated_activity_ids: Vec::new(),
            failed_activity_id: None,
            failure: None,
            created: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SagaEvent::Started {
                saga_id,
                tenant_id,
                workflow_id,
                name,
                ..
            } => {
                self.id = *saga_id;
                self.tenant_id = Some(*tenant_id);
                self.workflow_id = Some(*workflow_id);
                self.name = name.clone();
                self.status = SagaStatus::Started;
                self.created = true;
            }
            SagaEvent::Running { .. } => self.status = SagaStatus::Running,
            SagaEvent::ActivityCompleted { activity_id, .. } => {
                self.completed_activity_ids.push(*activity_id);
            }
            SagaEvent::Completed { .. } => self.status = SagaStatus::Completed,
            SagaEvent::CompensationStarted {
                failed_activity_id,
                reason,
                ..
            } => {
                self.status = SagaStatus::Compensating;
                self.failed_activity_id = Some(*failed_activity_id);
                self.failure = Some(reason.clone());
            }
            SagaEvent::ActivityCompensated { activity_id, .. } => {
                self.compensated_activity_ids.push(*activity_id);
            }
            SagaEvent::Compensated { .. } => self.status = SagaStatus::Compensated,
            SagaEvent::Failed { reason, .. } => {
                self.status = SagaStatus::Failed;
                self.failure = Some(reason.clone());
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SagaCommand::Start {
                saga_id,
                tenant_id,
                workflow_id,
                name,
                occurred_at,
            } => {
                if self.created {
                    return Err(DomainError::conflict("saga already exists"));
                }
                if *saga_id != self.id {
                    return Err(DomainError::invariant("saga_id mismatch"));
                }
                if name.trim().is_empty() {
                    return Err(DomainError::validation("saga name cannot be empty"));
                }
                Ok(vec![SagaEvent::Started {
                    saga_id: *saga_id,
                    tenant_id: *tenant_id,
                    workflow_id: *workflow_id,
                    name: name.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::Run { occurred_at } => {
                self.require(&[SagaStatus::Started], "run")?;
                Ok(vec![SagaEvent::Running {
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::RecordActivityCompleted {
                activity_id,
                occurred_at,
            } => {
                self.require(&[SagaStatus::Running], "record a completed activity on")?;
                if self.completed_activity_ids.contains(activity_id) {
                    return Err(DomainError::conflict(format!(
                        "activity {activity_id} already recorded as completed"
                    )));
                }
                Ok(vec![SagaEvent::ActivityCompleted {
                    activity_id: *activity_id,
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::Complete { occurred_at } => {
                self.require(&[SagaStatus::Running], "complete")?;
                Ok(vec![SagaEvent::Completed {
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::BeginCompensation {
                failed_activity_id,
                reason,
                occurred_at,
            } => {
                self.require(&[SagaStatus::Running], "compensate")?;
                Ok(vec![SagaEvent::CompensationStarted {
                    failed_activity_id: *failed_activity_id,
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::RecordActivityCompensated {
                activity_id,
                occurred_at,
            } => self.handle_activity_compensated(*activity_id, *occurred_at),
            SagaCommand::FinishCompensation { occurred_at } => {
                self.require(&[SagaStatus::Compensating], "finish compensating")?;
                if let Some(pending) = self.next_to_compensate() {
                    return Err(DomainError::invariant(format!(
                        "activity {pending} has not been compensated yet"
                    )));
                }
                Ok(vec![SagaEvent::Compensated {
                    occurred_at: *occurred_at,
                }])
            }
            SagaCommand::Fail {
                reason,
                occurred_at,
            } => {
                self.require(
                    &[
                        SagaStatus::Started,
                        SagaStatus::Running,
                        SagaStatus::Compensating,
                    ],
                    "fail",
                )?;
                Ok(vec![SagaEvent::Failed {
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl Saga {
    fn require(&self, allowed: &[SagaStatus], action: &str) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if !allowed.contains(&self.status) {
            return Err(DomainError::invalid_transition("saga", self.status, action));
        }
        Ok(())
    }

    fn handle_activity_compensated(
        &self,
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<SagaEvent>, DomainError> {
        self.require(&[SagaStatus::Compensating], "record a compensated activity on")?;
        match self.next_to_compensate() {
            Some(next) if next == activity_id => Ok(vec![SagaEvent::ActivityCompensated {
                activity_id,
                occurred_at,
            }]),
            Some(next) => Err(DomainError::invariant(format!(
                "compensation must run in reverse order: expected {next}, got {activity_id}"
            ))),
            None => Err(DomainError::invariant(format!(
                "activity {activity_id} has nothing left to compensate"
            ))),
        }
    }
}
