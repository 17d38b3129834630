//! Job scheduler: explicit schedule/execute API plus a polling loop with a
//! worker pool.
//!
//! All job state lives in the event log. A restarted scheduler, or a second
//! instance against the same store, rediscovers the same candidates by
//! replaying job streams. The only serialization point between instances is
//! the store's optimistic concurrency check on the `Pending -> Running` save.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use sagaflow_core::{DomainError, EventSourced, TenantId};
use sagaflow_workflow::{ActivityId, BackgroundJob, JobCommand, JobId, JobStatus};

use crate::config::SchedulerConfig;
use crate::event_store::EventStore;
use crate::jobs::registry::{execute_with_timeout, HandlerError, HandlerRegistry};
use crate::repository::{Repository, RepositoryError};

/// Parameters for [`JobScheduler::schedule_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub name: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub tenant_id: TenantId,
    pub max_retries: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub activity_id: Option<ActivityId>,
}

impl JobRequest {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        payload: JsonValue,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            payload,
            tenant_id,
            max_retries: None,
            scheduled_at: None,
            activity_id: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Not due before `at`. Defaults to now.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn for_activity(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    /// Persist a new `Pending` job built from this request.
    pub(crate) fn schedule_into<S: EventStore>(
        self,
        jobs: &Repository<BackgroundJob, S>,
        default_max_retries: u32,
    ) -> Result<JobId, SchedulerError> {
        let job_id = JobId::new();
        let now = Utc::now();
        let mut job = EventSourced::<BackgroundJob>::new(job_id);
        job.execute(&JobCommand::Schedule {
            job_id,
            name: self.name,
            job_type: self.job_type,
            payload: self.payload,
            tenant_id: self.tenant_id,
            activity_id: self.activity_id,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            scheduled_at: self.scheduled_at.unwrap_or(now),
            occurred_at: now,
        })?;
        jobs.save(&mut job)?;

        let state = job.state();
        info!(
            job_id = %job_id,
            job_type = state.job_type(),
            max_retries = state.max_retries(),
            scheduled_at = %state.scheduled_at(),
            "job scheduled"
        );
        Ok(job_id)
    }
}

/// Persisted result of one `execute_job` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The job was not in a dispatchable status; nothing was written.
    Skipped { status: JobStatus },
    Completed { result: String },
    /// The attempt failed and a retry is queued for `scheduled_at`.
    Retrying {
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    /// The attempt failed with no retries left. The job stays `Failed` for good.
    Exhausted { error: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl SchedulerError {
    /// This process lost the optimistic race for the job and must abandon the attempt.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Repository(e) if e.is_conflict())
    }
}

/// Hook invoked after every persisted execution outcome.
///
/// Runs on the thread that executed the job. Implementations log their own
/// failures; nothing propagates back into the scheduler.
pub trait JobObserver: Send + Sync {
    fn on_job_settled(&self, job: &BackgroundJob, outcome: &ExecutionOutcome);

    /// Called once per poll cycle of a spawned scheduler, before due jobs are
    /// discovered.
    fn on_poll(&self) {}
}

/// Scheduler runtime statistics (this process only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub polls: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub skipped: u64,
    pub recovered: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

/// Per-tenant job counts, derived from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    stopping: Arc<AtomicBool>,
    poller: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
    started: Instant,
}

impl SchedulerHandle {
    /// Stop discovery, drop queued-but-unstarted jobs, and wait for in-flight
    /// executions to reach their natural Completed/Failed transition.
    pub fn shutdown(mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        if let Some(j) = self.poller.take() {
            let _ = j.join();
        }
        for j in self.workers.drain(..) {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct JobScheduler<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    jobs: Repository<BackgroundJob, S>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    in_flight: Mutex<HashSet<JobId>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl<S> Clone for JobScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EventStore + 'static> JobScheduler<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Repository::new(store),
                registry,
                config,
                observers: RwLock::new(Vec::new()),
                in_flight: Mutex::new(HashSet::new()),
                stats: Arc::new(Mutex::new(SchedulerStats::default())),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Create a `Pending` job, persisted immediately.
    pub fn schedule_job(&self, request: JobRequest) -> Result<JobId, SchedulerError> {
        request.schedule_into(&self.inner.jobs, self.inner.config.default_max_retries)
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<BackgroundJob>, SchedulerError> {
        Ok(self
            .inner
            .jobs
            .get_by_id(job_id)?
            .map(EventSourced::into_state))
    }

    /// Run one attempt of `job_id` to a persisted outcome.
    ///
    /// A job outside `Pending`/`Retrying` is left untouched and reported as
    /// [`ExecutionOutcome::Skipped`]. Losing the race for `Running` to another
    /// writer returns a conflict error; the caller abandons the attempt.
    pub fn execute_job(&self, job_id: JobId) -> Result<ExecutionOutcome, SchedulerError> {
        let name = &self.inner.config.name;
        let mut job = self
            .inner
            .jobs
            .get_by_id(job_id)?
            .ok_or(SchedulerError::NotFound(job_id))?;

        let status = job.state().status();
        if !status.accepts_dispatch() {
            warn!(
                scheduler = %name,
                job_id = %job_id,
                status = ?status,
                "job is not dispatchable; skipping"
            );
            self.record(|s| s.skipped += 1);
            return Ok(ExecutionOutcome::Skipped { status });
        }

        job.execute(&JobCommand::Start {
            occurred_at: Utc::now(),
        })?;
        if let Err(err) = self.inner.jobs.save(&mut job) {
            if err.is_conflict() {
                info!(
                    scheduler = %name,
                    job_id = %job_id,
                    "job claimed by another writer; abandoning attempt"
                );
                self.record(|s| s.conflicts += 1);
            }
            return Err(err.into());
        }
        self.record(|s| s.dispatched += 1);
        debug!(
            scheduler = %name,
            job_id = %job_id,
            job_type = job.state().job_type(),
            retry_count = job.state().retry_count(),
            "job started"
        );

        let outcome = match self.invoke(job.state()) {
            Ok(result) => self.complete(&mut job, result)?,
            Err(err) => self.fail(&mut job, err.to_string())?,
        };

        self.notify(job.state(), &outcome);
        Ok(outcome)
    }

    /// Settle attempts that started but never recorded an outcome.
    ///
    /// A job still `Running` once twice the execution timeout has passed since
    /// its start lost its outcome: the process died, or the outcome append
    /// failed. It is failed here and retried like any other failure. Jobs in
    /// flight in this process are left alone, and losing the race to a late
    /// writer skips the job.
    pub fn recover_abandoned(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, ExecutionOutcome)>, SchedulerError> {
        let grace = chrono::Duration::from_std(self.inner.config.execution_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let abandoned: Vec<JobId> = self
            .all_jobs()?
            .into_iter()
            .filter(|job| job.status() == JobStatus::Running)
            .filter(|job| job.started_at().is_some_and(|at| at + grace <= now))
            .map(|job| job.id_typed())
            .collect();

        let mut outcomes = Vec::new();
        for job_id in abandoned {
            if !self.claim_local(job_id) {
                continue;
            }
            let result = self.recover(job_id);
            self.release_local(job_id);
            match result {
                Ok(Some(outcome)) => outcomes.push((job_id, outcome)),
                Ok(None) => {}
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    /// Dispatchable jobs with `scheduled_at <= now`, oldest first.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<BackgroundJob>, SchedulerError> {
        let mut due: Vec<BackgroundJob> = self
            .all_jobs()?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect();
        due.sort_by_key(|job| job.scheduled_at());
        Ok(due)
    }

    /// Jobs of `tenant_id` that exhausted their retries.
    pub fn failed_jobs(&self, tenant_id: TenantId) -> Result<Vec<BackgroundJob>, SchedulerError> {
        Ok(self
            .all_jobs()?
            .into_iter()
            .filter(|job| job.tenant_id() == Some(tenant_id) && job.is_exhausted())
            .collect())
    }

    pub fn job_stats(&self, tenant_id: TenantId) -> Result<JobStats, SchedulerError> {
        let mut stats = JobStats::default();
        for job in self.all_jobs()? {
            if job.tenant_id() != Some(tenant_id) {
                continue;
            }
            match job.status() {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Retrying => stats.retrying += 1,
            }
        }
        Ok(stats)
    }

    /// One discovery pass: hand every due job to the worker queue.
    ///
    /// Never blocks: a full queue leaves the remaining jobs for the next pass,
    /// and jobs already in flight in this process are skipped.
    pub fn poll_once(&self, dispatch: &SyncSender<JobId>) -> Result<usize, SchedulerError> {
        self.record(|s| s.polls += 1);

        let mut queued = 0;
        for job in self.due_jobs(Utc::now())? {
            let job_id = job.id_typed();
            if !self.claim_local(job_id) {
                continue;
            }
            match dispatch.try_send(job_id) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    self.release_local(job_id);
                    debug!(
                        scheduler = %self.inner.config.name,
                        "worker queue full; deferring to next poll"
                    );
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.release_local(job_id);
                    break;
                }
            }
        }
        Ok(queued)
    }

    /// Recover abandoned attempts, then execute every job due at `now` on the
    /// calling thread.
    ///
    /// Jobs lost to another writer are skipped.
    pub fn run_due_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, ExecutionOutcome)>, SchedulerError> {
        let mut outcomes = self.recover_abandoned(now)?;
        for job in self.due_jobs(now)? {
            let job_id = job.id_typed();
            if !self.claim_local(job_id) {
                continue;
            }
            let result = self.execute_job(job_id);
            self.release_local(job_id);
            match result {
                Ok(outcome) => outcomes.push((job_id, outcome)),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    /// Start the poll loop and the worker pool on background threads.
    pub fn spawn(&self) -> io::Result<SchedulerHandle> {
        let config = &self.inner.config;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (dispatch_tx, dispatch_rx) = mpsc::sync_channel::<JobId>(config.workers * 2);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        let stopping = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let scheduler = self.clone();
            let rx = dispatch_rx.clone();
            let stopping = stopping.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{}-worker-{idx}", config.name))
                    .spawn(move || worker_loop(scheduler, rx, stopping))?,
            );
        }

        let scheduler = self.clone();
        let poller = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || poll_loop(scheduler, dispatch_tx, shutdown_rx))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            stopping,
            poller: Some(poller),
            workers,
            stats: self.inner.stats.clone(),
            started: Instant::now(),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.inner.stats).clone()
    }

    fn invoke(&self, job: &BackgroundJob) -> Result<String, HandlerError> {
        let handler = self.inner.registry.resolve(job.job_type())?;
        execute_with_timeout(
            handler,
            job.payload().clone(),
            self.inner.config.execution_timeout,
        )
    }

    fn complete(
        &self,
        job: &mut EventSourced<BackgroundJob>,
        result: String,
    ) -> Result<ExecutionOutcome, SchedulerError> {
        job.execute(&JobCommand::Complete {
            result: result.clone(),
            occurred_at: Utc::now(),
        })?;
        self.inner.jobs.save(job)?;
        self.record(|s| s.completed += 1);

        let state = job.state();
        info!(
            scheduler = %self.inner.config.name,
            job_id = %state.id_typed(),
            job_type = state.job_type(),
            retry_count = state.retry_count(),
            "job completed"
        );
        Ok(ExecutionOutcome::Completed { result })
    }

    fn recover(&self, job_id: JobId) -> Result<Option<ExecutionOutcome>, SchedulerError> {
        let mut job = self
            .inner
            .jobs
            .get_by_id(job_id)?
            .ok_or(SchedulerError::NotFound(job_id))?;
        if job.state().status() != JobStatus::Running {
            return Ok(None);
        }

        warn!(
            scheduler = %self.inner.config.name,
            job_id = %job_id,
            started_at = ?job.state().started_at(),
            "attempt never recorded an outcome; failing it"
        );
        let outcome = self.fail(&mut job, ABANDONED_ATTEMPT.to_string())?;
        self.record(|s| s.recovered += 1);
        self.notify(job.state(), &outcome);
        Ok(Some(outcome))
    }

    /// Record a failed attempt and, with retries left, its retry in the same
    /// append. `Failed` is never persisted alone while a retry is owed.
    fn fail(
        &self,
        job: &mut EventSourced<BackgroundJob>,
        error: String,
    ) -> Result<ExecutionOutcome, SchedulerError> {
        let now = Utc::now();

        job.execute(&JobCommand::Fail {
            error: error.clone(),
            occurred_at: now,
        })?;
        let (job_id, retry_count, retries_left) = {
            let state = job.state();
            (state.id_typed(), state.retry_count(), state.has_retries_left())
        };
        if retries_left {
            let delay = self.inner.config.retry.delay_for(retry_count);
            job.execute(&JobCommand::ScheduleRetry {
                delay_secs: delay.as_secs(),
                occurred_at: now,
            })?;
        }
        self.inner.jobs.save(job)?;

        let state = job.state();
        if !retries_left {
            self.record(|s| s.exhausted += 1);
            error!(
                scheduler = %self.inner.config.name,
                job_id = %job_id,
                job_type = state.job_type(),
                retry_count,
                error = %error,
                "job exhausted its retries"
            );
            return Ok(ExecutionOutcome::Exhausted { error });
        }

        self.record(|s| s.retried += 1);
        warn!(
            scheduler = %self.inner.config.name,
            job_id = %job_id,
            job_type = state.job_type(),
            retry_count = state.retry_count(),
            scheduled_at = %state.scheduled_at(),
            error = %error,
            "job failed; retry scheduled"
        );
        Ok(ExecutionOutcome::Retrying {
            retry_count: state.retry_count(),
            scheduled_at: state.scheduled_at(),
            error,
        })
    }

    fn notify(&self, job: &BackgroundJob, outcome: &ExecutionOutcome) {
        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_job_settled(job, outcome);
        }
    }

    fn poll_observers(&self) {
        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_poll();
        }
    }

    fn all_jobs(&self) -> Result<Vec<BackgroundJob>, SchedulerError> {
        let mut jobs = Vec::new();
        for job_id in self.inner.jobs.ids()? {
            match self.inner.jobs.get_by_id(job_id) {
                Ok(Some(job)) => jobs.push(job.into_state()),
                Ok(None) => {}
                Err(
                    err @ (RepositoryError::Decode { .. } | RepositoryError::CorruptStream { .. }),
                ) => {
                    warn!(job_id = %job_id, error = %err, "skipping unreadable job stream");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(jobs)
    }

    fn claim_local(&self, job_id: JobId) -> bool {
        let claimed = lock(&self.inner.in_flight).insert(job_id);
        if claimed {
            self.record(|s| s.in_flight += 1);
        }
        claimed
    }

    fn release_local(&self, job_id: JobId) {
        if lock(&self.inner.in_flight).remove(&job_id) {
            self.record(|s| s.in_flight = s.in_flight.saturating_sub(1));
        }
    }

    fn record(&self, update: impl FnOnce(&mut SchedulerStats)) {
        update(&mut lock(&self.inner.stats));
    }
}

const ABANDONED_ATTEMPT: &str = "attempt abandoned: no outcome recorded";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn poll_loop<S: EventStore + 'static>(
    scheduler: JobScheduler<S>,
    dispatch: SyncSender<JobId>,
    shutdown_rx: Receiver<()>,
) {
    let name = scheduler.inner.config.name.clone();
    let interval = scheduler.inner.config.poll_interval;
    info!(
        scheduler = %name,
        poll_interval_ms = interval.as_millis() as u64,
        "job scheduler started"
    );

    loop {
        if let Err(err) = scheduler.recover_abandoned(Utc::now()) {
            scheduler.record(|s| s.errors += 1);
            error!(scheduler = %name, error = %err, "abandoned attempt recovery failed");
        }
        scheduler.poll_observers();

        match scheduler.poll_once(&dispatch) {
            Ok(0) => {}
            Ok(queued) => debug!(scheduler = %name, queued, "dispatched due jobs"),
            Err(err) => {
                scheduler.record(|s| s.errors += 1);
                error!(scheduler = %name, error = %err, "poll failed; retrying next cycle");
            }
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(scheduler = %name, "job scheduler stopped");
}

fn worker_loop<S: EventStore + 'static>(
    scheduler: JobScheduler<S>,
    queue: Arc<Mutex<Receiver<JobId>>>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        let next = lock(&queue).recv();
        let Ok(job_id) = next else {
            break;
        };

        if stopping.load(Ordering::SeqCst) {
            // Still Pending/Retrying in the log; the next scheduler picks it up.
            scheduler.release_local(job_id);
            continue;
        }

        match scheduler.execute_job(job_id) {
            Ok(outcome) => debug!(job_id = %job_id, outcome = ?outcome, "job settled"),
            Err(err) if err.is_conflict() => {}
            Err(err) => {
                scheduler.record(|s| s.errors += 1);
                error!(job_id = %job_id, error = %err, "job execution failed");
            }
        }
        scheduler.release_local(job_id);
    }
}
