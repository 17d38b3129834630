//! Integration tests for the full pipeline.
//!
//! Tests: Command → Repository → EventStore → JobScheduler → SagaCoordinator
//!
//! Verifies:
//! - Aggregates survive a round trip through the log
//! - Stale writers are rejected and nothing is appended
//! - Retry backoff, exhaustion and idempotent dispatch
//! - Sagas compensate completed activities newest first
//! - Outcomes lost to a failing store are recovered from the log

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::anyhow;
    use chrono::Utc;
    use serde_json::{json, Value as JsonValue};

    use sagaflow_core::{AggregateId, AggregateRoot, EventSourced, ExpectedVersion, TenantId};
    use sagaflow_workflow::{
        ActivityId, ActivityStatus, JobEvent, JobId, JobStatus, SagaStatus, Workflow,
        WorkflowCommand, WorkflowId, WorkflowStatus,
    };

    use crate::config::SchedulerConfig;
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
    };
    use crate::jobs::{
        compensation_key, ExecutionOutcome, HandlerRegistry, JobRequest, JobScheduler,
    };
    use crate::repository::{Repository, RepositoryError};
    use crate::saga::{ActivityStep, SagaCoordinator, StartSaga};

    type Store = Arc<InMemoryEventStore>;

    const CHECKOUT: [&str; 4] =
        ["reserve-stock", "charge-card", "create-shipment", "notify-carrier"];

    struct Engine<S = Store> {
        store: S,
        scheduler: JobScheduler<S>,
        coordinator: Arc<SagaCoordinator<S>>,
    }

    fn engine(registry: HandlerRegistry) -> Engine {
        engine_with(
            registry,
            SchedulerConfig::default().with_execution_timeout(Duration::from_secs(2)),
        )
    }

    fn engine_with(registry: HandlerRegistry, config: SchedulerConfig) -> Engine {
        engine_on(Arc::new(InMemoryEventStore::new()), registry, config)
    }

    fn engine_on<S: EventStore + Clone + 'static>(
        store: S,
        registry: HandlerRegistry,
        config: SchedulerConfig,
    ) -> Engine<S> {
        sagaflow_observability::init_for_tests();

        let scheduler = JobScheduler::new(store.clone(), registry.clone(), config.clone());
        let coordinator = Arc::new(SagaCoordinator::new(store.clone(), registry, &config));
        scheduler.add_observer(coordinator.clone());

        Engine {
            store,
            scheduler,
            coordinator,
        }
    }

    /// Run due work until nothing is left, pretending a day has passed so
    /// retry delays never hold anything back.
    fn drain<S: EventStore + 'static>(
        scheduler: &JobScheduler<S>,
    ) -> Vec<(JobId, ExecutionOutcome)> {
        let mut all = Vec::new();
        for _ in 0..32 {
            let outcomes = scheduler
                .run_due_jobs(Utc::now() + chrono::Duration::days(1))
                .unwrap();
            if outcomes.is_empty() {
                break;
            }
            all.extend(outcomes);
        }
        all
    }

    fn job_events(store: &impl EventStore, job_id: JobId) -> Vec<JobEvent> {
        store
            .load_stream(job_id.into())
            .unwrap()
            .iter()
            .map(|stored| stored.envelope.open::<JobEvent>().unwrap())
            .collect()
    }

    fn retry_delays(store: &impl EventStore, job_id: JobId) -> Vec<u64> {
        job_events(store, job_id)
            .into_iter()
            .filter_map(|event| match event {
                JobEvent::RetryScheduled { delay_secs, .. } => Some(delay_secs),
                _ => None,
            })
            .collect()
    }

    fn always_failing(
        message: &'static str,
    ) -> impl Fn(&JsonValue) -> anyhow::Result<String> + Send + Sync {
        move |_: &JsonValue| -> anyhow::Result<String> { Err(anyhow!(message)) }
    }

    /// In-memory store that refuses the first append carrying one event type,
    /// and records the event types of every append it accepts.
    struct FlakyStore {
        inner: InMemoryEventStore,
        refuse: Mutex<Option<&'static str>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl FlakyStore {
        fn refusing_once(event_type: &'static str) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryEventStore::new(),
                refuse: Mutex::new(Some(event_type)),
                batches: Mutex::new(Vec::new()),
            })
        }

        /// Accepted appends that contain `event_type`.
        fn batches_with(&self, event_type: &str) -> Vec<Vec<String>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .filter(|batch| batch.iter().any(|t| t == event_type))
                .cloned()
                .collect()
        }
    }

    impl EventStore for FlakyStore {
        fn append(
            &self,
            stream_id: AggregateId,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            let types: Vec<String> = events
                .iter()
                .map(|event| event.envelope.event_type().to_string())
                .collect();
            {
                let mut refuse = self.refuse.lock().unwrap();
                if refuse.is_some_and(|refused| types.iter().any(|t| t == refused)) {
                    *refuse = None;
                    return Err(EventStoreError::Unavailable("connection reset".to_string()));
                }
            }
            let stored = self.inner.append(stream_id, events, expected_version)?;
            self.batches.lock().unwrap().push(types);
            Ok(stored)
        }

        fn load_stream(&self, stream_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(stream_id)
        }

        fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
            self.inner.stream_ids(aggregate_type)
        }
    }

    /// Forward handlers answer `done-<type>`; undo handlers log the result they
    /// were asked to revert.
    fn checkout_registry(
        undo_log: &Arc<Mutex<Vec<String>>>,
        failing_step: Option<&str>,
        failing_undo: Option<&str>,
    ) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for step in CHECKOUT {
            let fails = failing_step == Some(step);
            registry.register(step, move |_: &JsonValue| -> anyhow::Result<String> {
                if fails {
                    Err(anyhow!("{step} rejected"))
                } else {
                    Ok(format!("done-{step}"))
                }
            });

            let undo_fails = failing_undo == Some(step);
            let log = undo_log.clone();
            registry.register(
                compensation_key(step),
                move |payload: &JsonValue| -> anyhow::Result<String> {
                    let reverted = payload["result"].as_str().unwrap_or_default().to_string();
                    log.lock().unwrap().push(reverted);
                    if undo_fails {
                        Err(anyhow!("refund gateway unavailable"))
                    } else {
                        Ok("undone".to_string())
                    }
                },
            );
        }
        registry
    }

    fn checkout(tenant_id: TenantId) -> StartSaga {
        StartSaga {
            name: "checkout".to_string(),
            tenant_id,
            steps: CHECKOUT
                .iter()
                .map(|step| {
                    ActivityStep::new(*step, json!({ "step": step })).with_max_retries(0)
                })
                .collect(),
        }
    }

    fn activity_status<S: EventStore>(
        engine: &Engine<S>,
        activity_id: ActivityId,
    ) -> ActivityStatus {
        engine.coordinator.activity(activity_id).unwrap().unwrap().status()
    }

    #[test]
    fn aggregate_round_trips_through_the_store() {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let workflows: Repository<Workflow, Store> = Repository::new(store.clone());
        let workflow_id = WorkflowId::new();

        let mut workflow = EventSourced::<Workflow>::new(workflow_id);
        workflow
            .execute(&WorkflowCommand::Create {
                workflow_id,
                tenant_id: TenantId::new(),
                name: "onboarding".to_string(),
                activity_ids: vec![ActivityId::new(), ActivityId::new()],
                occurred_at: Utc::now(),
            })
            .unwrap();
        workflow
            .execute(&WorkflowCommand::Start { occurred_at: Utc::now() })
            .unwrap();
        let stored = workflows.save(&mut workflow).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].sequence_number, 2);

        let loaded = workflows.load_required(workflow_id).unwrap();
        assert_eq!(loaded.version(), 2);
        assert!(!loaded.has_uncommitted());
        assert_eq!(loaded.state(), workflow.state());
        assert_eq!(loaded.state().status(), WorkflowStatus::Running);
    }

    #[test]
    fn stale_writer_is_rejected_without_appending() {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let workflows: Repository<Workflow, Store> = Repository::new(store.clone());
        let workflow_id = WorkflowId::new();
        let first = ActivityId::new();

        let mut workflow = EventSourced::<Workflow>::new(workflow_id);
        workflow
            .execute(&WorkflowCommand::Create {
                workflow_id,
                tenant_id: TenantId::new(),
                name: "onboarding".to_string(),
                activity_ids: vec![first, ActivityId::new()],
                occurred_at: Utc::now(),
            })
            .unwrap();
        workflow
            .execute(&WorkflowCommand::Start { occurred_at: Utc::now() })
            .unwrap();
        workflows.save(&mut workflow).unwrap();

        let mut a = workflows.load_required(workflow_id).unwrap();
        let mut b = workflows.load_required(workflow_id).unwrap();
        let record = WorkflowCommand::RecordActivityCompleted {
            activity_id: first,
            occurred_at: Utc::now(),
        };
        a.execute(&record).unwrap();
        b.execute(&record).unwrap();

        workflows.save(&mut a).unwrap();
        let err = workflows.save(&mut b).unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(
            err,
            RepositoryError::Concurrency {
                expected: 2,
                actual: 3,
                ..
            }
        ));
        assert_eq!(b.uncommitted_events().len(), 1);
        assert_eq!(store.load_stream(workflow_id.into()).unwrap().len(), 3);
    }

    #[test]
    fn retries_back_off_exponentially_then_exhaust() {
        let mut registry = HandlerRegistry::new();
        registry.register("sync-ledger", always_failing("ledger offline"));
        let engine = engine(registry);
        let tenant_id = TenantId::new();
        let job_id = engine
            .scheduler
            .schedule_job(
                JobRequest::new("nightly ledger sync", "sync-ledger", json!({}), tenant_id)
                    .max_retries(3),
            )
            .unwrap();

        for attempt in 1..=3 {
            let outcome = engine.scheduler.execute_job(job_id).unwrap();
            assert!(
                matches!(
                    outcome,
                    ExecutionOutcome::Retrying { retry_count, .. } if retry_count == attempt
                ),
                "attempt {attempt}: {outcome:?}"
            );
        }
        assert_eq!(retry_delays(&engine.store, job_id), vec![60, 120, 240]);

        let before = engine.scheduler.job(job_id).unwrap().unwrap();
        assert_eq!(before.status(), JobStatus::Retrying);
        assert!(before.scheduled_at() > Utc::now() + chrono::Duration::minutes(3));

        let outcome = engine.scheduler.execute_job(job_id).unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Exhausted { ref error } if error.contains("ledger offline")
        ));

        let exhausted = engine.scheduler.job(job_id).unwrap().unwrap();
        assert_eq!(exhausted.status(), JobStatus::Failed);
        assert_eq!(exhausted.retry_count(), 3);
        assert_eq!(exhausted.scheduled_at(), before.scheduled_at());
        assert!(exhausted.is_exhausted());

        let failed = engine.scheduler.failed_jobs(tenant_id).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id_typed(), job_id);
        assert!(engine.scheduler.failed_jobs(TenantId::new()).unwrap().is_empty());

        // Nothing dispatchable remains, so a repeated dispatch writes nothing.
        let events_before = engine.store.load_stream(job_id.into()).unwrap().len();
        let outcome = engine.scheduler.execute_job(job_id).unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Skipped {
                status: JobStatus::Failed
            }
        );
        assert_eq!(engine.store.load_stream(job_id.into()).unwrap().len(), events_before);
    }

    #[test]
    fn flaky_handler_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register("send-email", move |payload: &JsonValue| -> anyhow::Result<String> {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(anyhow!("smtp 421: try again later"));
            }
            Ok(format!("sent to {}", payload["to"].as_str().unwrap_or("?")))
        });
        let engine = engine(registry);
        let tenant_id = TenantId::new();
        let job_id = engine
            .scheduler
            .schedule_job(JobRequest::new(
                "welcome email",
                "send-email",
                json!({ "to": "ops@example.com" }),
                tenant_id,
            ))
            .unwrap();

        let outcomes = drain(&engine.scheduler);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let job = engine.scheduler.job(job_id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.retry_count(), 2);
        assert_eq!(job.result(), Some("sent to ops@example.com"));
        assert_eq!(retry_delays(&engine.store, job_id).iter().sum::<u64>(), 180);

        let stats = engine.scheduler.job_stats(tenant_id).unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed + stats.retrying + stats.pending + stats.running, 0);
    }

    #[test]
    fn saga_runs_every_activity_in_order() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(checkout_registry(&undo_log, None, None));

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        let outcomes = drain(&engine.scheduler);
        assert_eq!(outcomes.len(), CHECKOUT.len());

        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.completed_activity_ids(), started.activity_ids.as_slice());

        let workflow = engine.coordinator.workflow(started.workflow_id).unwrap().unwrap();
        assert_eq!(workflow.status(), WorkflowStatus::Completed);

        for (activity_id, step) in started.activity_ids.iter().zip(CHECKOUT) {
            let activity = engine.coordinator.activity(*activity_id).unwrap().unwrap();
            assert_eq!(activity.status(), ActivityStatus::Completed);
            assert_eq!(activity.result(), Some(format!("done-{step}").as_str()));
        }
        assert!(undo_log.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_activity_compensates_completed_ones_newest_first() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(checkout_registry(&undo_log, Some("notify-carrier"), None));

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        assert_eq!(
            *undo_log.lock().unwrap(),
            vec!["done-create-shipment", "done-charge-card", "done-reserve-stock"]
        );

        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.failed_activity_id(), Some(started.activity_ids[3]));
        assert_eq!(
            saga.compensated_activity_ids(),
            &[started.activity_ids[2], started.activity_ids[1], started.activity_ids[0]]
        );

        let workflow = engine.coordinator.workflow(started.workflow_id).unwrap().unwrap();
        assert_eq!(workflow.status(), WorkflowStatus::Compensated);

        for activity_id in &started.activity_ids[..3] {
            assert_eq!(activity_status(&engine, *activity_id), ActivityStatus::Compensated);
        }
        assert_eq!(activity_status(&engine, started.activity_ids[3]), ActivityStatus::Failed);
    }

    #[test]
    fn failed_undo_stops_compensation_and_fails_the_saga() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(checkout_registry(
            &undo_log,
            Some("notify-carrier"),
            Some("charge-card"),
        ));

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        // Each undo handler is invoked at most once; reserve-stock is never reached.
        assert_eq!(
            *undo_log.lock().unwrap(),
            vec!["done-create-shipment", "done-charge-card"]
        );

        let ids = &started.activity_ids;
        assert_eq!(activity_status(&engine, ids[2]), ActivityStatus::Compensated);
        assert_eq!(activity_status(&engine, ids[1]), ActivityStatus::Failed);
        assert_eq!(activity_status(&engine, ids[0]), ActivityStatus::Completed);

        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(saga.failure().unwrap().contains("refund gateway unavailable"));

        let workflow = engine.coordinator.workflow(started.workflow_id).unwrap().unwrap();
        assert_eq!(workflow.status(), WorkflowStatus::Failed);
    }

    #[test]
    fn first_activity_failure_compensates_nothing() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(checkout_registry(&undo_log, Some("reserve-stock"), None));

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        assert!(undo_log.lock().unwrap().is_empty());
        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(activity_status(&engine, started.activity_ids[1]), ActivityStatus::Pending);
    }

    #[test]
    fn retried_activity_records_failed_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register("charge-card", move |_: &JsonValue| -> anyhow::Result<String> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow!("card network timeout"));
            }
            Ok("charged".to_string())
        });
        let engine = engine(registry);

        let started = engine
            .coordinator
            .start_saga(StartSaga {
                name: "payment".to_string(),
                tenant_id: TenantId::new(),
                steps: vec![
                    ActivityStep::new("charge-card", json!({ "amount": 1999 })).with_max_retries(2),
                ],
            })
            .unwrap();
        drain(&engine.scheduler);

        let activity = engine.coordinator.activity(started.activity_ids[0]).unwrap().unwrap();
        assert_eq!(activity.status(), ActivityStatus::Completed);
        assert_eq!(activity.attempt_count(), 2);
        assert_eq!(
            engine.coordinator.saga(started.saga_id).unwrap().unwrap().status(),
            SagaStatus::Completed
        );
    }

    #[test]
    fn handler_timeout_fails_the_attempt() {
        let mut registry = HandlerRegistry::new();
        registry.register("slow-report", |_: &JsonValue| -> anyhow::Result<String> {
            thread::sleep(Duration::from_millis(500));
            Ok("late".to_string())
        });
        let engine = engine_with(
            registry,
            SchedulerConfig::default().with_execution_timeout(Duration::from_millis(50)),
        );
        let job_id = engine
            .scheduler
            .schedule_job(
                JobRequest::new("quarterly report", "slow-report", json!({}), TenantId::new())
                    .max_retries(0),
            )
            .unwrap();

        let outcome = engine.scheduler.execute_job(job_id).unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Exhausted { ref error } if error.contains("timed out")
        ));
        assert_eq!(
            engine.scheduler.job(job_id).unwrap().unwrap().status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn spawned_scheduler_executes_due_jobs_and_shuts_down() {
        let mut registry = HandlerRegistry::new();
        registry.register("thumbnail", |payload: &JsonValue| -> anyhow::Result<String> {
            Ok(format!("resized {}", payload["image"]))
        });
        let engine = engine_with(
            registry,
            SchedulerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_workers(2),
        );
        let tenant_id = TenantId::new();
        let ids: Vec<JobId> = (0..3)
            .map(|n| {
                engine
                    .scheduler
                    .schedule_job(JobRequest::new(
                        "thumbnail",
                        "thumbnail",
                        json!({ "image": n }),
                        tenant_id,
                    ))
                    .unwrap()
            })
            .collect();

        let handle = engine.scheduler.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().completed < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.completed, 3);
        assert!(stats.polls >= 1);
        for job_id in ids {
            assert_eq!(
                engine.scheduler.job(job_id).unwrap().unwrap().status(),
                JobStatus::Completed
            );
        }
    }

    #[test]
    fn restarted_scheduler_rediscovers_jobs_from_the_log() {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let tenant_id = TenantId::new();
        let job_id = {
            let before_restart = JobScheduler::new(
                store.clone(),
                HandlerRegistry::new(),
                SchedulerConfig::default(),
            );
            before_restart
                .schedule_job(JobRequest::new("invoice", "render-invoice", json!({}), tenant_id))
                .unwrap()
        };

        let mut registry = HandlerRegistry::new();
        registry.register("render-invoice", |_: &JsonValue| -> anyhow::Result<String> {
            Ok("rendered".to_string())
        });
        let after_restart = JobScheduler::new(store, registry, SchedulerConfig::default());

        let due = after_restart.due_jobs(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id_typed(), job_id);
        assert_eq!(after_restart.job_stats(tenant_id).unwrap().pending, 1);

        let outcomes = after_restart.run_due_jobs(Utc::now()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            after_restart.job(job_id).unwrap().unwrap().status(),
            JobStatus::Completed
        );
    }

    #[test]
    fn failed_attempt_and_its_retry_are_appended_together() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register("sync-crm", move |_: &JsonValue| -> anyhow::Result<String> {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(anyhow!("crm 503"));
            }
            Ok("synced".to_string())
        });
        let store = FlakyStore::refusing_once("workflow.job.retry_scheduled");
        let engine = engine_on(
            store.clone(),
            registry,
            SchedulerConfig::default().with_execution_timeout(Duration::from_secs(2)),
        );
        let job_id = engine
            .scheduler
            .schedule_job(
                JobRequest::new("crm sync", "sync-crm", json!({}), TenantId::new()).max_retries(3),
            )
            .unwrap();

        // The outcome append is refused as a whole: no lone Failed event.
        let err = engine.scheduler.execute_job(job_id).unwrap_err();
        assert!(!err.is_conflict());
        assert!(
            !job_events(&store, job_id)
                .iter()
                .any(|event| matches!(event, JobEvent::Failed { .. }))
        );
        assert_eq!(
            engine.scheduler.job(job_id).unwrap().unwrap().status(),
            JobStatus::Running
        );

        // Still inside the grace period of the attempt.
        assert!(engine.scheduler.recover_abandoned(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(5);
        let recovered = engine.scheduler.recover_abandoned(later).unwrap();
        assert!(matches!(
            recovered.as_slice(),
            [(id, ExecutionOutcome::Retrying { retry_count: 1, error, .. })]
                if *id == job_id && error.contains("abandoned")
        ));
        assert_eq!(engine.scheduler.stats().recovered, 1);

        drain(&engine.scheduler);
        let job = engine.scheduler.job(job_id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.retry_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let failures = store.batches_with("workflow.job.failed");
        assert_eq!(failures.len(), 2);
        for batch in failures {
            assert_eq!(batch, vec!["workflow.job.failed", "workflow.job.retry_scheduled"]);
        }
    }

    #[test]
    fn reconcile_resumes_a_saga_that_missed_an_activity_completion() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let store = FlakyStore::refusing_once("workflow.saga.activity_completed");
        let engine = engine_on(
            store,
            checkout_registry(&undo_log, None, None),
            SchedulerConfig::default().with_execution_timeout(Duration::from_secs(2)),
        );

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        // The first activity finished, but the saga never recorded it.
        let ids = &started.activity_ids;
        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Running);
        assert!(saga.completed_activity_ids().is_empty());
        assert_eq!(activity_status(&engine, ids[0]), ActivityStatus::Completed);
        assert_eq!(activity_status(&engine, ids[1]), ActivityStatus::Pending);
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        assert!(engine.scheduler.due_jobs(tomorrow).unwrap().is_empty());

        // Too recent: the job that wrote it may still be advancing the saga.
        assert!(engine.coordinator.reconcile(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::minutes(1);
        let resumed = engine.coordinator.reconcile(later).unwrap();
        assert_eq!(resumed, vec![(started.saga_id, SagaStatus::Running)]);
        drain(&engine.scheduler);

        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.completed_activity_ids(), ids.as_slice());
        let workflow = engine.coordinator.workflow(started.workflow_id).unwrap().unwrap();
        assert_eq!(workflow.status(), WorkflowStatus::Completed);
        assert!(undo_log.lock().unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::minutes(1);
        assert!(engine.coordinator.reconcile(later).unwrap().is_empty());
    }

    #[test]
    fn resume_applies_a_job_outcome_the_activity_missed() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let store = FlakyStore::refusing_once("workflow.activity.completed");
        let engine = engine_on(
            store,
            checkout_registry(&undo_log, None, None),
            SchedulerConfig::default().with_execution_timeout(Duration::from_secs(2)),
        );

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        let first = started.activity_ids[0];
        assert_eq!(
            engine.scheduler.job(started.first_job_id).unwrap().unwrap().status(),
            JobStatus::Completed
        );
        assert_eq!(activity_status(&engine, first), ActivityStatus::Running);

        assert_eq!(
            engine.coordinator.resume(started.saga_id).unwrap(),
            SagaStatus::Running
        );
        // A second resume finds the next activity in flight and writes nothing.
        assert_eq!(
            engine.coordinator.resume(started.saga_id).unwrap(),
            SagaStatus::Running
        );
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        assert_eq!(engine.scheduler.due_jobs(tomorrow).unwrap().len(), 1);

        drain(&engine.scheduler);
        let activity = engine.coordinator.activity(first).unwrap().unwrap();
        assert_eq!(activity.result(), Some("done-reserve-stock"));
        assert_eq!(
            engine.coordinator.saga(started.saga_id).unwrap().unwrap().status(),
            SagaStatus::Completed
        );
    }

    #[test]
    fn resumed_compensation_never_undoes_an_activity_twice() {
        let undo_log = Arc::new(Mutex::new(Vec::new()));
        let store = FlakyStore::refusing_once("workflow.saga.activity_compensated");
        let engine = engine_on(
            store,
            checkout_registry(&undo_log, Some("create-shipment"), None),
            SchedulerConfig::default().with_execution_timeout(Duration::from_secs(2)),
        );

        let started = engine.coordinator.start_saga(checkout(TenantId::new())).unwrap();
        drain(&engine.scheduler);

        // charge-card was undone, but the saga lost the record of it.
        let ids = &started.activity_ids;
        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert!(saga.compensated_activity_ids().is_empty());
        assert_eq!(activity_status(&engine, ids[1]), ActivityStatus::Compensated);
        assert_eq!(activity_status(&engine, ids[0]), ActivityStatus::Completed);

        let later = Utc::now() + chrono::Duration::minutes(1);
        let resumed = engine.coordinator.reconcile(later).unwrap();
        assert_eq!(resumed, vec![(started.saga_id, SagaStatus::Compensated)]);

        assert_eq!(
            *undo_log.lock().unwrap(),
            vec!["done-charge-card", "done-reserve-stock"]
        );
        let saga = engine.coordinator.saga(started.saga_id).unwrap().unwrap();
        assert_eq!(saga.compensated_activity_ids(), &[ids[1], ids[0]]);
        let workflow = engine.coordinator.workflow(started.workflow_id).unwrap().unwrap();
        assert_eq!(workflow.status(), WorkflowStatus::Compensated);
    }

    #[test]
    fn racing_schedulers_run_each_job_exactly_once() {
        sagaflow_observability::init_for_tests();
        let store: Store = Arc::new(InMemoryEventStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let instance = |name: &str| {
            let counter = calls.clone();
            let mut registry = HandlerRegistry::new();
            registry.register("export", move |_: &JsonValue| -> anyhow::Result<String> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("exported".to_string())
            });
            JobScheduler::new(store.clone(), registry, SchedulerConfig::default().with_name(name))
        };
        let schedulers = [instance("scheduler-a"), instance("scheduler-b")];

        let tenant_id = TenantId::new();
        let ids: Vec<JobId> = (0..20)
            .map(|n| {
                schedulers[0]
                    .schedule_job(JobRequest::new(
                        format!("export {n}"),
                        "export",
                        json!({ "n": n }),
                        tenant_id,
                    ))
                    .unwrap()
            })
            .collect();

        // Conflicts are reported as `Err(true)`.
        let barrier = Barrier::new(schedulers.len());
        let results: Vec<Vec<Result<ExecutionOutcome, bool>>> = thread::scope(|scope| {
            let workers: Vec<_> = schedulers
                .iter()
                .map(|scheduler| {
                    let (barrier, ids) = (&barrier, &ids);
                    scope.spawn(move || {
                        barrier.wait();
                        ids.iter()
                            .map(|id| scheduler.execute_job(*id).map_err(|e| e.is_conflict()))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), ids.len() as u32);
        for (idx, job_id) in ids.iter().enumerate() {
            let (a, b) = (&results[0][idx], &results[1][idx]);
            let completed = [a, b]
                .iter()
                .filter(|r| matches!(r, Ok(ExecutionOutcome::Completed { .. })))
                .count();
            assert_eq!(completed, 1, "job {job_id}: {a:?} / {b:?}");
            for result in [a, b] {
                assert!(
                    matches!(
                        result,
                        Ok(ExecutionOutcome::Completed { .. })
                            | Ok(ExecutionOutcome::Skipped { .. })
                            | Err(true)
                    ),
                    "job {job_id}: {result:?}"
                );
            }
            assert_eq!(
                schedulers[1].job(*job_id).unwrap().unwrap().status(),
                JobStatus::Completed
            );
        }
    }

    #[test]
    fn shutdown_waits_for_the_attempt_in_flight() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let mut registry = HandlerRegistry::new();
        registry.register("render-report", move |_: &JsonValue| -> anyhow::Result<String> {
            flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok("rendered".to_string())
        });
        let engine = engine_with(
            registry,
            SchedulerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_workers(1),
        );
        let job_id = engine
            .scheduler
            .schedule_job(JobRequest::new("report", "render-report", json!({}), TenantId::new()))
            .unwrap();

        let handle = engine.scheduler.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(
            engine.scheduler.job(job_id).unwrap().unwrap().status(),
            JobStatus::Running
        );

        handle.shutdown();

        let job = engine.scheduler.job(job_id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result(), Some("rendered"));
    }
}
