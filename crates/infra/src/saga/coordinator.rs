use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use sagaflow_core::{DomainError, EventSourced, TenantId};
use sagaflow_workflow::{
    Activity, ActivityCommand, ActivityId, ActivityStatus, BackgroundJob, JobId, JobStatus, Saga,
    SagaCommand, SagaId, SagaStatus, Workflow, WorkflowCommand, WorkflowId, WorkflowStatus,
};

use crate::config::SchedulerConfig;
use crate::event_store::EventStore;
use crate::jobs::{
    compensation_key, execute_with_timeout, ExecutionOutcome, HandlerRegistry, JobObserver,
    JobRequest, SchedulerError,
};
use crate::repository::{Repository, RepositoryError};

/// One step of a saga: the handler type key and its input.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityStep {
    pub activity_type: String,
    pub input: JsonValue,
    /// Retry budget for this step; the scheduler default when `None`.
    pub max_retries: Option<u32>,
}

impl ActivityStep {
    pub fn new(activity_type: impl Into<String>, input: JsonValue) -> Self {
        Self {
            activity_type: activity_type.into(),
            input,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartSaga {
    pub name: String,
    pub tenant_id: TenantId,
    pub steps: Vec<ActivityStep>,
}

/// Ids created by [`SagaCoordinator::start_saga`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaStarted {
    pub saga_id: SagaId,
    pub workflow_id: WorkflowId,
    pub activity_ids: Vec<ActivityId>,
    /// Job executing the first activity.
    pub first_job_id: JobId,
}

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("saga {0} not found")]
    NotFound(SagaId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Sequences a workflow's activities and compensates on irrecoverable failure.
///
/// Forward progress is driven by job outcomes: register the coordinator as a
/// [`JobObserver`] on the scheduler executing its jobs. Each activity attempt
/// runs as a `BackgroundJob` whose `job_type` is the activity type.
///
/// Compensation walks the saga's completed activities in strict reverse order
/// and calls each undo handler (`<activity_type>.compensate`) at most once.
/// The first failed undo ends the saga in `Failed` for an operator to resolve.
///
/// An outcome that could not be applied when its job settled is picked up by
/// [`SagaCoordinator::reconcile`], which a spawned scheduler runs every poll.
pub struct SagaCoordinator<S> {
    sagas: Repository<Saga, S>,
    workflows: Repository<Workflow, S>,
    activities: Repository<Activity, S>,
    jobs: Repository<BackgroundJob, S>,
    registry: HandlerRegistry,
    compensation_timeout: Duration,
    quiet_period: chrono::Duration,
    default_max_retries: u32,
}

impl<S: EventStore + Clone> SagaCoordinator<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: &SchedulerConfig) -> Self {
        Self {
            sagas: Repository::new(store.clone()),
            workflows: Repository::new(store.clone()),
            activities: Repository::new(store.clone()),
            jobs: Repository::new(store),
            registry,
            compensation_timeout: config.execution_timeout,
            quiet_period: chrono::Duration::from_std(config.execution_timeout * 2)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
            default_max_retries: config.default_max_retries,
        }
    }
}

impl<S: EventStore> SagaCoordinator<S> {
    /// Create the activities, workflow and saga, then dispatch the first activity.
    pub fn start_saga(&self, request: StartSaga) -> Result<SagaStarted, SagaError> {
        if request.name.trim().is_empty() {
            return Err(DomainError::validation("saga name cannot be empty").into());
        }

        let saga_id = SagaId::new();
        let workflow_id = WorkflowId::new();
        let activity_ids: Vec<ActivityId> =
            request.steps.iter().map(|_| ActivityId::new()).collect();
        let Some(first) = activity_ids.first().copied() else {
            return Err(DomainError::validation("a saga needs at least one step").into());
        };
        let now = Utc::now();

        for (activity_id, step) in activity_ids.iter().zip(&request.steps) {
            let mut activity = EventSourced::<Activity>::new(*activity_id);
            activity.execute(&ActivityCommand::Create {
                activity_id: *activity_id,
                workflow_id,
                saga_id: Some(saga_id),
                activity_type: step.activity_type.clone(),
                input: step.input.clone(),
                max_retries: step.max_retries,
                occurred_at: now,
            })?;
            self.activities.save(&mut activity)?;
        }

        let mut workflow = EventSourced::<Workflow>::new(workflow_id);
        workflow.execute(&WorkflowCommand::Create {
            workflow_id,
            tenant_id: request.tenant_id,
            name: request.name.clone(),
            activity_ids: activity_ids.clone(),
            occurred_at: now,
        })?;
        workflow.execute(&WorkflowCommand::Start { occurred_at: now })?;
        self.workflows.save(&mut workflow)?;

        let mut saga = EventSourced::<Saga>::new(saga_id);
        saga.execute(&SagaCommand::Start {
            saga_id,
            tenant_id: request.tenant_id,
            workflow_id,
            name: request.name.clone(),
            occurred_at: now,
        })?;
        saga.execute(&SagaCommand::Run { occurred_at: now })?;
        self.sagas.save(&mut saga)?;

        info!(
            saga_id = %saga_id,
            workflow_id = %workflow_id,
            steps = activity_ids.len(),
            "saga started"
        );

        let first_job_id = self.dispatch_activity(first, request.tenant_id, &request.name)?;
        Ok(SagaStarted {
            saga_id,
            workflow_id,
            activity_ids,
            first_job_id,
        })
    }

    /// Undo every completed activity of a `Compensating` saga, newest first.
    ///
    /// Returns the saga's final status: `Compensated`, or `Failed` when an
    /// undo handler failed (later activities stay compensated, earlier ones
    /// stay `Completed`).
    pub fn compensate(&self, saga_id: SagaId) -> Result<SagaStatus, SagaError> {
        let mut saga = self
            .sagas
            .get_by_id(saga_id)?
            .ok_or(SagaError::NotFound(saga_id))?;

        let status = saga.state().status();
        if status != SagaStatus::Compensating {
            return Err(DomainError::invalid_transition("saga", status, "compensate").into());
        }
        let workflow_id = saga
            .state()
            .workflow_id()
            .ok_or_else(|| DomainError::invariant("saga has no workflow"))?;

        for activity_id in saga.state().compensation_plan() {
            if let Some(error) = self.compensate_activity(activity_id)? {
                let reason = format!("compensation of activity {activity_id} failed: {error}");
                saga.execute(&SagaCommand::Fail {
                    reason: reason.clone(),
                    occurred_at: Utc::now(),
                })?;
                self.sagas.save(&mut saga)?;
                self.close_workflow(workflow_id, Some(reason))?;

                error!(
                    saga_id = %saga_id,
                    activity_id = %activity_id,
                    error = %error,
                    "compensation failed; saga requires operator intervention"
                );
                return Ok(SagaStatus::Failed);
            }

            saga.execute(&SagaCommand::RecordActivityCompensated {
                activity_id,
                occurred_at: Utc::now(),
            })?;
            self.sagas.save(&mut saga)?;
            info!(saga_id = %saga_id, activity_id = %activity_id, "activity compensated");
        }

        saga.execute(&SagaCommand::FinishCompensation {
            occurred_at: Utc::now(),
        })?;
        self.sagas.save(&mut saga)?;
        self.close_workflow(workflow_id, None)?;

        info!(saga_id = %saga_id, "saga compensated");
        Ok(SagaStatus::Compensated)
    }

    /// Bring a saga in line with what its activities and jobs already
    /// recorded, then carry it forward.
    ///
    /// Every step checks the log before writing, so a saga that is up to date
    /// is left untouched. Returns the saga's status afterwards.
    pub fn resume(&self, saga_id: SagaId) -> Result<SagaStatus, SagaError> {
        let saga = self
            .sagas
            .get_by_id(saga_id)?
            .ok_or(SagaError::NotFound(saga_id))?;
        let workflow_id = saga
            .state()
            .workflow_id()
            .ok_or_else(|| DomainError::invariant("saga has no workflow"))?;
        let mut workflow = self.workflows.load_required(workflow_id)?;

        let status = saga.state().status();
        match status {
            SagaStatus::Running => self.advance(saga, workflow),
            SagaStatus::Compensating => {
                if workflow.state().status() == WorkflowStatus::Running {
                    let failed = saga.state().failed_activity_id().ok_or_else(|| {
                        DomainError::invariant("compensating saga has no failed activity")
                    })?;
                    workflow.execute(&WorkflowCommand::RecordActivityFailed {
                        activity_id: failed,
                        error: saga.state().failure().unwrap_or_default().to_string(),
                        occurred_at: Utc::now(),
                    })?;
                    self.workflows.save(&mut workflow)?;
                }
                self.compensate(saga_id)
            }
            SagaStatus::Compensated => {
                self.close_workflow(workflow_id, None)?;
                Ok(SagaStatus::Compensated)
            }
            SagaStatus::Failed => {
                let reason = saga.state().failure().unwrap_or("saga failed").to_string();
                self.close_workflow(workflow_id, Some(reason))?;
                Ok(SagaStatus::Failed)
            }
            SagaStatus::Started | SagaStatus::Completed => Ok(status),
        }
    }

    /// Resume every saga whose log went quiet short of a terminal state.
    ///
    /// Sagas written to within twice the execution timeout of `now` are left
    /// to the job that is driving them. A saga that cannot be resumed is
    /// logged and skipped. Returns the sagas visited with their new status.
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<Vec<(SagaId, SagaStatus)>, SagaError> {
        let mut visited = Vec::new();
        for saga_id in self.sagas.ids()? {
            let Some(saga) = self.sagas.get_by_id(saga_id)? else {
                continue;
            };
            let Some(workflow_id) = saga.state().workflow_id() else {
                continue;
            };
            let Some(workflow) = self.workflows.get_by_id(workflow_id)? else {
                continue;
            };
            if saga.state().status().is_terminal() && workflow.state().status().is_terminal() {
                continue;
            }
            if !self.is_quiet(saga_id, workflow.state(), now)? {
                continue;
            }

            match self.resume(saga_id) {
                Ok(status) => {
                    debug!(saga_id = %saga_id, status = ?status, "saga reconciled");
                    visited.push((saga_id, status));
                }
                Err(err) => warn!(saga_id = %saga_id, error = %err, "saga could not be resumed"),
            }
        }
        Ok(visited)
    }

    pub fn saga(&self, saga_id: SagaId) -> Result<Option<Saga>, SagaError> {
        Ok(self.sagas.get_by_id(saga_id)?.map(EventSourced::into_state))
    }

    pub fn workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, SagaError> {
        Ok(self
            .workflows
            .get_by_id(workflow_id)?
            .map(EventSourced::into_state))
    }

    pub fn activity(&self, activity_id: ActivityId) -> Result<Option<Activity>, SagaError> {
        Ok(self
            .activities
            .get_by_id(activity_id)?
            .map(EventSourced::into_state))
    }

    fn handle_outcome(
        &self,
        job: &BackgroundJob,
        outcome: &ExecutionOutcome,
    ) -> Result<(), SagaError> {
        let Some(activity_id) = job.activity_id() else {
            return Ok(());
        };

        match outcome {
            ExecutionOutcome::Skipped { .. } => Ok(()),
            ExecutionOutcome::Completed { result } => self.activity_completed(activity_id, result),
            ExecutionOutcome::Retrying { error, .. } => {
                self.activity_attempt_failed(activity_id, error)
            }
            ExecutionOutcome::Exhausted { error } => self.activity_failed(activity_id, error),
        }
    }

    /// Walk a running saga's activities in order: record completions the saga
    /// missed, start the next activity, or begin compensation.
    fn advance(
        &self,
        mut saga: EventSourced<Saga>,
        mut workflow: EventSourced<Workflow>,
    ) -> Result<SagaStatus, SagaError> {
        let saga_id = saga.state().id_typed();
        let tenant_id = saga
            .state()
            .tenant_id()
            .ok_or_else(|| DomainError::invariant("saga has no tenant"))?;
        let activity_ids = workflow.state().activity_ids().to_vec();

        for activity_id in activity_ids {
            if saga.state().completed_activity_ids().contains(&activity_id) {
                continue;
            }
            let (activity, has_job) = self.sync_with_jobs(activity_id)?;
            let now = Utc::now();

            match activity.status() {
                ActivityStatus::Completed => {
                    if !workflow.state().completed_activity_ids().contains(&activity_id) {
                        workflow.execute(&WorkflowCommand::RecordActivityCompleted {
                            activity_id,
                            occurred_at: now,
                        })?;
                        self.workflows.save(&mut workflow)?;
                    }
                    saga.execute(&SagaCommand::RecordActivityCompleted {
                        activity_id,
                        occurred_at: now,
                    })?;
                }
                ActivityStatus::Failed => {
                    let error = activity.error().unwrap_or("activity failed").to_string();
                    if workflow.state().status() == WorkflowStatus::Running {
                        workflow.execute(&WorkflowCommand::RecordActivityFailed {
                            activity_id,
                            error: error.clone(),
                            occurred_at: now,
                        })?;
                        self.workflows.save(&mut workflow)?;
                    }
                    saga.execute(&SagaCommand::BeginCompensation {
                        failed_activity_id: activity_id,
                        reason: error.clone(),
                        occurred_at: now,
                    })?;
                    self.sagas.save(&mut saga)?;

                    warn!(
                        saga_id = %saga_id,
                        activity_id = %activity_id,
                        error = %error,
                        "activity failed irrecoverably; compensating"
                    );
                    return self.compensate(saga_id);
                }
                ActivityStatus::Pending => {
                    self.sagas.save(&mut saga)?;
                    self.dispatch_activity(activity_id, tenant_id, saga.state().name())?;
                    return Ok(SagaStatus::Running);
                }
                ActivityStatus::Running => {
                    self.sagas.save(&mut saga)?;
                    if !has_job {
                        // Started, but the job was never scheduled.
                        self.schedule_activity_job(&activity, tenant_id, saga.state().name())?;
                    }
                    return Ok(SagaStatus::Running);
                }
                status @ (ActivityStatus::Compensating | ActivityStatus::Compensated) => {
                    return Err(DomainError::invariant(format!(
                        "activity {activity_id} is {status:?} while its saga runs forward"
                    ))
                    .into());
                }
            }
        }

        saga.execute(&SagaCommand::Complete {
            occurred_at: Utc::now(),
        })?;
        self.sagas.save(&mut saga)?;
        info!(saga_id = %saga_id, "saga completed");
        Ok(SagaStatus::Completed)
    }

    /// Apply a settled job outcome a running activity missed.
    ///
    /// Returns the activity and whether any job was scheduled for it.
    fn sync_with_jobs(&self, activity_id: ActivityId) -> Result<(Activity, bool), SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;
        if activity.state().status() != ActivityStatus::Running {
            return Ok((activity.into_state(), false));
        }

        let jobs = self.activity_jobs(activity_id)?;
        if let Some(job) = jobs.iter().find(|job| job.status() == JobStatus::Completed) {
            activity.execute(&ActivityCommand::Complete {
                result: job.result().unwrap_or_default().to_string(),
                occurred_at: Utc::now(),
            })?;
            self.activities.save(&mut activity)?;
            info!(
                activity_id = %activity_id,
                job_id = %job.id_typed(),
                "applied missed job completion"
            );
        } else if let Some(job) = jobs
            .last()
            .filter(|_| jobs.iter().all(BackgroundJob::is_exhausted))
        {
            activity.execute(&ActivityCommand::Fail {
                error: job.error().unwrap_or("job failed").to_string(),
                occurred_at: Utc::now(),
            })?;
            self.activities.save(&mut activity)?;
            info!(
                activity_id = %activity_id,
                job_id = %job.id_typed(),
                "applied missed job failure"
            );
        }
        Ok((activity.into_state(), !jobs.is_empty()))
    }

    fn activity_jobs(&self, activity_id: ActivityId) -> Result<Vec<BackgroundJob>, SagaError> {
        let mut jobs = Vec::new();
        for job_id in self.jobs.ids()? {
            let Some(job) = self.jobs.get_by_id(job_id)? else {
                continue;
            };
            if job.state().activity_id() == Some(activity_id) {
                jobs.push(job.into_state());
            }
        }
        Ok(jobs)
    }

    fn dispatch_activity(
        &self,
        activity_id: ActivityId,
        tenant_id: TenantId,
        saga_name: &str,
    ) -> Result<JobId, SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;
        activity.execute(&ActivityCommand::Start {
            occurred_at: Utc::now(),
        })?;
        self.activities.save(&mut activity)?;
        self.schedule_activity_job(activity.state(), tenant_id, saga_name)
    }

    fn schedule_activity_job(
        &self,
        activity: &Activity,
        tenant_id: TenantId,
        saga_name: &str,
    ) -> Result<JobId, SagaError> {
        let activity_id = activity.id_typed();
        let mut request = JobRequest::new(
            format!("{saga_name}/{}", activity.activity_type()),
            activity.activity_type(),
            activity.input().clone(),
            tenant_id,
        )
        .for_activity(activity_id);
        if let Some(max_retries) = activity.max_retries() {
            request = request.max_retries(max_retries);
        }

        let job_id = request.schedule_into(&self.jobs, self.default_max_retries)?;
        debug!(activity_id = %activity_id, job_id = %job_id, "activity dispatched");
        Ok(job_id)
    }

    fn activity_completed(&self, activity_id: ActivityId, result: &str) -> Result<(), SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;
        activity.execute(&ActivityCommand::Complete {
            result: result.to_string(),
            occurred_at: Utc::now(),
        })?;
        self.activities.save(&mut activity)?;
        let (_, saga_id) = owners(activity.state())?;
        self.resume(saga_id).map(|_| ())
    }

    fn activity_attempt_failed(
        &self,
        activity_id: ActivityId,
        error: &str,
    ) -> Result<(), SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;
        activity.execute(&ActivityCommand::RecordFailedAttempt {
            error: error.to_string(),
            occurred_at: Utc::now(),
        })?;
        self.activities.save(&mut activity)?;
        debug!(
            activity_id = %activity_id,
            attempts = activity.state().attempt_count(),
            "activity attempt failed; retry pending"
        );
        Ok(())
    }

    fn activity_failed(&self, activity_id: ActivityId, error: &str) -> Result<(), SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;
        activity.execute(&ActivityCommand::Fail {
            error: error.to_string(),
            occurred_at: Utc::now(),
        })?;
        self.activities.save(&mut activity)?;
        let (_, saga_id) = owners(activity.state())?;
        self.resume(saga_id).map(|_| ())
    }

    /// Move a compensating workflow to its final state. No-op otherwise.
    fn close_workflow(
        &self,
        workflow_id: WorkflowId,
        failure: Option<String>,
    ) -> Result<(), SagaError> {
        let mut workflow = self.workflows.load_required(workflow_id)?;
        if workflow.state().status() != WorkflowStatus::Compensating {
            return Ok(());
        }
        let occurred_at = Utc::now();
        workflow.execute(&match failure {
            Some(reason) => WorkflowCommand::MarkFailed { reason, occurred_at },
            None => WorkflowCommand::MarkCompensated { occurred_at },
        })?;
        self.workflows.save(&mut workflow)?;
        Ok(())
    }

    /// Nothing in the saga's log changed within the quiet period before `now`.
    fn is_quiet(
        &self,
        saga_id: SagaId,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<bool, SagaError> {
        let cutoff = now - self.quiet_period;
        let mut changes = vec![
            self.sagas.last_change(saga_id)?,
            self.workflows.last_change(workflow.id_typed())?,
        ];
        for activity_id in workflow.activity_ids() {
            changes.push(self.activities.last_change(*activity_id)?);
        }
        Ok(changes.into_iter().flatten().all(|at| at <= cutoff))
    }

    /// Run the undo handler of one activity. `Some(error)` if it failed.
    fn compensate_activity(&self, activity_id: ActivityId) -> Result<Option<String>, SagaError> {
        let mut activity = self.activities.load_required(activity_id)?;

        match activity.state().status() {
            // Undone before; only the saga's record of it is missing.
            ActivityStatus::Compensated => return Ok(None),
            ActivityStatus::Failed => {
                let error = activity.state().error().unwrap_or("compensation failed");
                return Ok(Some(error.to_string()));
            }
            _ => {}
        }

        if activity.state().status() == ActivityStatus::Compensating {
            // A previous run started this undo but never recorded its result.
            // Running it again could undo twice.
            let error = "compensation interrupted; outcome unknown".to_string();
            activity.execute(&ActivityCommand::FailCompensation {
                error: error.clone(),
                occurred_at: Utc::now(),
            })?;
            self.activities.save(&mut activity)?;
            return Ok(Some(error));
        }

        activity.execute(&ActivityCommand::BeginCompensation {
            occurred_at: Utc::now(),
        })?;
        self.activities.save(&mut activity)?;

        let state = activity.state();
        let key = compensation_key(state.activity_type());
        let payload = json!({
            "activity_id": activity_id,
            "input": state.input(),
            "result": state.result(),
        });
        let outcome = self
            .registry
            .resolve(&key)
            .and_then(|handler| execute_with_timeout(handler, payload, self.compensation_timeout));

        match outcome {
            Ok(_) => {
                activity.execute(&ActivityCommand::CompleteCompensation {
                    occurred_at: Utc::now(),
                })?;
                self.activities.save(&mut activity)?;
                Ok(None)
            }
            Err(err) => {
                let error = err.to_string();
                activity.execute(&ActivityCommand::FailCompensation {
                    error: error.clone(),
                    occurred_at: Utc::now(),
                })?;
                self.activities.save(&mut activity)?;
                Ok(Some(error))
            }
        }
    }
}

impl<S: EventStore> JobObserver for SagaCoordinator<S> {
    fn on_job_settled(&self, job: &BackgroundJob, outcome: &ExecutionOutcome) {
        if let Err(err) = self.handle_outcome(job, outcome) {
            error!(
                job_id = %job.id_typed(),
                activity_id = ?job.activity_id(),
                error = %err,
                "failed to advance saga after job outcome; left for reconciliation"
            );
        }
    }

    fn on_poll(&self) {
        if let Err(err) = self.reconcile(Utc::now()) {
            error!(error = %err, "saga reconciliation failed");
        }
    }
}

fn owners(activity: &Activity) -> Result<(WorkflowId, SagaId), DomainError> {
    match (activity.workflow_id(), activity.saga_id()) {
        (Some(workflow_id), Some(saga_id)) => Ok((workflow_id, saga_id)),
        _ => Err(DomainError::invariant(format!(
            "activity {} is not part of a saga",
            activity.id_typed()
        ))),
    }
}
