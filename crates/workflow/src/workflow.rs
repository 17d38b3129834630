use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sagaflow_core::{Aggregate, DomainError, TenantId};
use sagaflow_events::Event;

use crate::ids::{ActivityId, WorkflowId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Compensated
        )
    }
}

/// Aggregate root: Workflow.
///
/// Holds its activities by reference, in declared order. Activities complete
/// strictly in that order; the first failure halts forward progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    id: WorkflowId,
    tenant_id: Option<TenantId>,
    name: String,
    status: WorkflowStatus,
    activity_ids: Vec<ActivityId>,
    completed_activity_ids: Vec<ActivityId>,
    failed_activity_id: Option<ActivityId>,
    failure: Option<String>,
    created: bool,
}

impl Workflow {
    pub fn id_typed(&self) -> WorkflowId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn activity_ids(&self) -> &[ActivityId] {
        &self.activity_ids
    }

    pub fn completed_activity_ids(&self) -> &[ActivityId] {
        &self.completed_activity_ids
    }

    pub fn failed_activity_id(&self) -> Option<ActivityId> {
        self.failed_activity_id
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The activity that must complete next, if the workflow is still moving forward.
    pub fn next_activity(&self) -> Option<ActivityId> {
        if self.status != WorkflowStatus::Running {
            return None;
        }
        self.activity_ids
            .get(self.completed_activity_ids.len())
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowCommand {
    Create {
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        name: String,
        activity_ids: Vec<ActivityId>,
        occurred_at: DateTime<Utc>,
    },
    Start {
        occurred_at: DateTime<Utc>,
    },
    RecordActivityCompleted {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    RecordActivityFailed {
        activity_id: ActivityId,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    MarkCompensated {
        occurred_at: DateTime<Utc>,
    },
    MarkFailed {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    Created {
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        name: String,
        activity_ids: Vec<ActivityId>,
        occurred_at: DateTime<Utc>,
    },
    Started {
        occurred_at: DateTime<Utc>,
    },
    ActivityCompleted {
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        occurred_at: DateTime<Utc>,
    },
    ActivityFailed {
        activity_id: ActivityId,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    CompensationStarted {
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

impl Event for WorkflowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::Created { .. } => "workflow.workflow.created",
            WorkflowEvent::Started { .. } => "workflow.workflow.started",
            WorkflowEvent::ActivityCompleted { .. } => "workflow.workflow.activity_completed",
            WorkflowEvent::Completed { .. } => "workflow.workflow.completed",
            WorkflowEvent::ActivityFailed { .. } => "workflow.workflow.activity_failed",
            WorkflowEvent::CompensationStarted { .. } => "workflow.workflow.compensation_started",
            WorkflowEvent::Compensated { .. } => "workflow.workflow.compensated",
            WorkflowEvent::Failed { .. } => "workflow.workflow.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkflowEvent::Created { occurred_at, .. }
            | WorkflowEvent::Started { occurred_at }
            | WorkflowEvent::ActivityCompleted { occurred_at, .. }
            | WorkflowEvent::Completed { occurred_at }
            | WorkflowEvent::ActivityFailed { occurred_at, .. }
            | WorkflowEvent::CompensationStarted { occurred_at }
            | WorkflowEvent::Compensated { occurred_at }
            | WorkflowEvent::Failed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Workflow {
    type Id = WorkflowId;
    type Command = WorkflowCommand;
    type Event = WorkflowEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "workflow.workflow";

    fn empty(id: Self::Id) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            status: WorkflowStatus::Created,
            activity_ids: Vec::new(),
            completed_activity_ids: Vec::new(),
            failed_activity_id: None,
            failure: None,
            created: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WorkflowEvent::Created {
                workflow_id,
                tenant_id,
                name,
                activity_ids,
                ..
            } => {
                self.id = *workflow_id;
                self.tenant_id = Some(*tenant_id);
                self.name = name.clone();
                self.activity_ids = activity_ids.clone();
                self.status = WorkflowStatus::Created;
                self.created = true;
            }
            WorkflowEvent::Started { .. } => {
                self.status = WorkflowStatus::Running;
            }
            WorkflowEvent::ActivityCompleted { activity_id, .. } => {
                self.completed_activity_ids.push(*activity_id);
            }
            WorkflowEvent::Completed { .. } => {
                self.status = WorkflowStatus::Completed;
            }
            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                self.failed_activity_id = Some(*activity_id);
                self.failure = Some(error.clone());
            }
            WorkflowEvent::CompensationStarted { .. } => {
                self.status = WorkflowStatus::Compensating;
            }
            WorkflowEvent::Compensated { .. } => {
                self.status = WorkflowStatus::Compensated;
            }
            WorkflowEvent::Failed { reason, .. } => {
                self.status = WorkflowStatus::Failed;
                self.failure = Some(reason.clone());
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WorkflowCommand::Create {
                workflow_id,
                tenant_id,
                name,
                activity_ids,
                occurred_at,
            } => self.handle_create(*workflow_id, *tenant_id, name, activity_ids, *occurred_at),
            WorkflowCommand::Start { occurred_at } => {
                self.require(WorkflowStatus::Created, "start")?;
                Ok(vec![WorkflowEvent::Started {
                    occurred_at: *occurred_at,
                }])
            }
            WorkflowCommand::RecordActivityCompleted {
                activity_id,
                occurred_at,
            } => self.handle_activity_completed(*activity_id, *occurred_at),
            WorkflowCommand::RecordActivityFailed {
                activity_id,
                error,
                occurred_at,
            } => {
                self.require(WorkflowStatus::Running, "record a failed activity on")?;
                self.ensure_next(*activity_id)?;
                Ok(vec![
                    WorkflowEvent::ActivityFailed {
                        activity_id: *activity_id,
                        error: error.clone(),
                        occurred_at: *occurred_at,
                    },
                    WorkflowEvent::CompensationStarted {
                        occurred_at: *occurred_at,
                    },
                ])
            }
            WorkflowCommand::MarkCompensated { occurred_at } => {
                self.require(WorkflowStatus::Compensating, "mark compensated")?;
                Ok(vec![WorkflowEvent::Compensated {
                    occurred_at: *occurred_at,
                }])
            }
            WorkflowCommand::MarkFailed {
                reason,
                occurred_at,
            } => {
                self.require(WorkflowStatus::Compensating, "mark failed")?;
                Ok(vec![WorkflowEvent::Failed {
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl Workflow {
    fn require(&self, expected: WorkflowStatus, action: &str) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.status != expected {
            return Err(DomainError::invalid_transition("workflow", self.status, action));
        }
        Ok(())
    }

    fn ensure_next(&self, activity_id: ActivityId) -> Result<(), DomainError> {
        match self.next_activity() {
            Some(next) if next == activity_id => Ok(()),
            Some(next) => Err(DomainError::invariant(format!(
                "activity {activity_id} is out of order (next is {next})"
            ))),
            None => Err(DomainError::invariant(format!(
                "activity {activity_id} is not pending in this workflow"
            ))),
        }
    }

    fn handle_create(
        &self,
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        name: &str,
        activity_ids: &[ActivityId],
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("workflow already exists"));
        }
        if workflow_id != self.id {
            return Err(DomainError::invariant("workflow_id mismatch"));
        }
        if activity_ids.is_empty() {
            return Err(DomainError::validation("workflow needs at least one activity"));
        }
        let unique: HashSet<_> = activity_ids.iter().collect();
        if unique.len() != activity_ids.len() {
            return Err(DomainError::validation("activity ids must be unique"));
        }
        Ok(vec![WorkflowEvent::Created {
            workflow_id,
            tenant_id,
            name: name.to_string(),
            activity_ids: activity_ids.to_vec(),
            occurred_at,
        }])
    }

    fn handle_activity_completed(
        &self,
        activity_id: ActivityId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEvent>, DomainError> {
        self.require(WorkflowStatus::Running, "record a completed activity on")?;
        self.ensure_next(activity_id)?;

        let mut events = vec![WorkflowEvent::ActivityCompleted {
            activity_id,
            occurred_at,
        }];
        if self.completed_activity_ids.len() + 1 == self.activity_ids.len() {
            events.push(WorkflowEvent::Completed { occurred_at });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::EventSourced;

    fn running(activities: &[ActivityId]) -> EventSourced<Workflow> {
        let id = WorkflowId::new();
        let now = Utc::now();
        let mut workflow = EventSourced::<Workflow>::new(id);
        workflow
            .execute(&WorkflowCommand::Create {
                workflow_id: id,
                tenant_id: TenantId::new(),
                name: "order-fulfilment".to_string(),
                activity_ids: activities.to_vec(),
                occurred_at: now,
            })
            .unwrap();
        workflow
            .execute(&WorkflowCommand::Start { occurred_at: now })
            .unwrap();
        workflow
    }

    #[test]
    fn completes_only_after_all_activities_in_order() {
        let a = [ActivityId::new(), ActivityId::new()];
        let mut workflow = running(&a);
        let now = Utc::now();

        assert_eq!(workflow.state().next_activity(), Some(a[0]));

        let err = workflow
            .execute(&WorkflowCommand::RecordActivityCompleted {
                activity_id: a[1],
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        workflow
            .execute(&WorkflowCommand::RecordActivityCompleted {
                activity_id: a[0],
                occurred_at: now,
            })
            .unwrap();
        assert_eq!(workflow.state().status(), WorkflowStatus::Running);

        workflow
            .execute(&WorkflowCommand::RecordActivityCompleted {
                activity_id: a[1],
                occurred_at: now,
            })
            .unwrap();
        assert_eq!(workflow.state().status(), WorkflowStatus::Completed);
        assert_eq!(workflow.state().next_activity(), None);
    }

    #[test]
    fn first_failure_flips_to_compensating() {
        let a = [ActivityId::new(), ActivityId::new()];
        let mut workflow = running(&a);
        let now = Utc::now();

        workflow
            .execute(&WorkflowCommand::RecordActivityFailed {
                activity_id: a[0],
                error: "boom".to_string(),
                occurred_at: now,
            })
            .unwrap();

        assert_eq!(workflow.state().status(), WorkflowStatus::Compensating);
        assert_eq!(workflow.state().failed_activity_id(), Some(a[0]));
        assert_eq!(workflow.state().next_activity(), None);

        let err = workflow
            .execute(&WorkflowCommand::RecordActivityCompleted {
                activity_id: a[0],
                occurred_at: now,
            })
            .unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn create_rejects_duplicate_activities() {
        let id = WorkflowId::new();
        let dup = ActivityId::new();
        let mut workflow = EventSourced::<Workflow>::new(id);
        let err = workflow
            .execute(&WorkflowCommand::Create {
                workflow_id: id,
                tenant_id: TenantId::new(),
                name: "dup".to_string(),
                activity_ids: vec![dup, dup],
                occurred_at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
