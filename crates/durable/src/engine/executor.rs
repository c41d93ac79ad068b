//! The engine and its client and worker API

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cache::ExecutionCache;
use super::dispatch::{ActivityRuntime, AttemptPhase, RunInfo, RunRequest};
use super::notify::{LifecycleEvent, LifecycleNotifier};
use super::registry::WorkflowRegistry;
use super::replay::{self, ReplayError};
use super::step::{ExecutionOutcome, StartOptions, StepDecision, TaskOutcome, WorkflowStep};
use super::EngineError;
use crate::activity::ActivityOutcome;
use crate::clock::{self, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::matcher::{Task, TaskMatcher};
use crate::persistence::{EventLogStore, ExecutionRecord, ExecutionStatus, NewExecution, StoreError};
use crate::timer::TimerService;
use crate::workflow::{
    error_codes, HistoryEvent, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
};

/// How long `get_result` waits on notifications before re-reading the store
const RESULT_RECHECK: Duration = Duration::from_secs(1);

/// Durable workflow engine
///
/// Owns the event log and everything derived from it: task queues, timers,
/// in-flight activity attempts and loaded instances for queries. Only the
/// event log is durable; [`Engine::recover`] rebuilds the rest.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryEventLogStore::new());
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<OrderWorkflow>();
///
/// let engine = Engine::new(store, registry, EngineConfig::default());
/// let run_id = engine.start("order", json!({"id": 7}), "order-7").await?;
///
/// if let Some(task) = engine.poll_workflow_task("default", Duration::from_secs(1)).await {
///     engine.run_workflow_task(&task).await?;
/// }
/// ```
pub struct Engine<S: EventLogStore> {
    pub(super) store: Arc<S>,
    pub(super) registry: Arc<WorkflowRegistry>,
    pub(super) workflow_tasks: TaskMatcher,
    pub(super) activity_tasks: TaskMatcher,
    pub(super) timers: TimerService,
    pub(super) cache: ExecutionCache,
    pub(super) notifier: LifecycleNotifier,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
    pub(super) open_runs: DashMap<Uuid, RunInfo>,
    pub(super) activities: DashMap<(Uuid, String), ActivityRuntime>,
    pub(super) inflight: DashMap<Uuid, Task>,
    pub(super) scheduled_wf: DashMap<Uuid, Uuid>,
}

impl<S: EventLogStore> Engine<S> {
    /// Create an engine on the system clock
    pub fn new(store: Arc<S>, registry: WorkflowRegistry, config: EngineConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    /// Create an engine with a custom clock
    pub fn with_clock(
        store: Arc<S>,
        registry: WorkflowRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            workflow_tasks: TaskMatcher::with_clock(clock.clone()),
            activity_tasks: TaskMatcher::with_clock(clock.clone()),
            timers: TimerService::new(),
            cache: ExecutionCache::new(config.max_cached_executions),
            notifier: LifecycleNotifier::new(config.notification_capacity),
            clock,
            config,
            open_runs: DashMap::new(),
            activities: DashMap::new(),
            inflight: DashMap::new(),
            scheduled_wf: DashMap::new(),
        }
    }

    /// Get the event log store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the workflow registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Get the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive lifecycle notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.notifier.subscribe()
    }

    /// Number of runs the engine is tracking as open
    pub fn open_run_count(&self) -> usize {
        self.open_runs.len()
    }

    /// Number of armed timers, including retry and timeout timers
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // =========================================================================
    // Client API
    // =========================================================================

    /// Start an execution on the default queue
    pub async fn start(
        &self,
        workflow_type: &str,
        input: Value,
        execution_id: &str,
    ) -> Result<Uuid, EngineError> {
        self.start_with_options(workflow_type, input, execution_id, StartOptions::default())
            .await
    }

    /// Start an execution, returning the ID of its first run
    ///
    /// Fails with [`EngineError::AlreadyStarted`] while the execution has an
    /// open run. A closed execution ID can be started again.
    #[instrument(skip(self, input))]
    pub async fn start_with_options(
        &self,
        workflow_type: &str,
        input: Value,
        execution_id: &str,
        options: StartOptions,
    ) -> Result<Uuid, EngineError> {
        // surfaces unknown types and bad input before anything is recorded
        self.registry.create(workflow_type, input.clone())?;

        let run_id = Uuid::now_v7();
        let request = RunRequest {
            execution_id: execution_id.to_string(),
            run_id,
            workflow_type: workflow_type.to_string(),
            input,
            task_queue: options
                .task_queue
                .unwrap_or_else(|| self.config.default_task_queue.clone()),
            execution_timeout_ms: options.execution_timeout.map(|t| t.as_millis() as u64),
            continued_from: None,
        };

        let events = self.create_run(request).await?;
        self.after_append(execution_id, run_id, &events).await?;
        Ok(run_id)
    }

    /// Deliver a signal to the execution's current run
    ///
    /// Returns `false` when the execution is already closed.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        execution_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<bool, EngineError> {
        let record = self.store.current_run(execution_id).await?;
        if record.status.is_closed() {
            debug!(%execution_id, signal = %name, "execution closed, dropping signal");
            return Ok(false);
        }

        let signal = WorkflowSignal::at(name, payload, self.clock.now());
        let appended = self
            .append_external(record.run_id, vec![WorkflowEvent::SignalReceived { signal }])
            .await?;
        Ok(appended.is_some())
    }

    /// Ask the execution's current run to cancel
    ///
    /// The workflow decides how to react; by default it closes as cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str, reason: &str) -> Result<bool, EngineError> {
        let record = self.store.current_run(execution_id).await?;
        if record.status.is_closed() {
            return Ok(false);
        }

        let appended = self
            .append_external(
                record.run_id,
                vec![WorkflowEvent::CancellationRequested {
                    reason: reason.to_string(),
                }],
            )
            .await?;
        Ok(appended.is_some())
    }

    /// Run a read-only query against the loaded instance
    ///
    /// Fails with [`EngineError::Unavailable`] when no instance is loaded;
    /// the caller retries once a workflow task has run.
    pub fn query(&self, execution_id: &str, name: &str, args: Value) -> Result<Value, EngineError> {
        self.cache
            .query(execution_id, |instance| instance.query(name, &args))
            .ok_or_else(|| EngineError::Unavailable(execution_id.to_string()))?
            .map_err(EngineError::Query)
    }

    /// Wait for the execution to finish, following continue-as-new
    pub async fn get_result(&self, execution_id: &str) -> Result<ExecutionOutcome, EngineError> {
        loop {
            let mut rx = self.notifier.subscribe();
            let record = self.store.current_run(execution_id).await?;

            if record.status.is_closed() && record.status != ExecutionStatus::Continued {
                let events = self.store.read(record.run_id, record.last_sequence).await?;
                return events
                    .last()
                    .and_then(|event| outcome_of(&event.event))
                    .ok_or_else(|| {
                        EngineError::Store(StoreError::InvalidSequence(format!(
                            "run {} closed without a terminal event",
                            record.run_id
                        )))
                    });
            }

            let _ = tokio::time::timeout(RESULT_RECHECK, async {
                loop {
                    match rx.recv().await {
                        Ok(LifecycleEvent::ExecutionClosed {
                            execution_id: closed,
                            ..
                        }) if closed == execution_id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => break,
                    }
                }
            })
            .await;
        }
    }

    /// Describe the execution's current run
    pub async fn describe(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        Ok(self.store.current_run(execution_id).await?)
    }

    /// History of the execution's current run
    pub async fn history(&self, execution_id: &str) -> Result<Vec<HistoryEvent>, EngineError> {
        let record = self.store.current_run(execution_id).await?;
        Ok(self.store.read(record.run_id, 1).await?)
    }

    /// History of one run
    pub async fn run_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, EngineError> {
        Ok(self.store.read(run_id, 1).await?)
    }

    /// Replay a run against the registered code without recording anything
    ///
    /// Surfaces divergence as [`EngineError::NonDeterminism`]; use it to
    /// check new workflow code against recorded histories.
    pub async fn verify_replay(&self, run_id: Uuid) -> Result<usize, EngineError> {
        let record = self.store.get_run(run_id).await?;
        let history = self.store.read(run_id, 1).await?;

        let outcome = replay::replay(&self.registry, &record.execution_id, run_id, &history)
            .map_err(|err| match err {
                ReplayError::NonDeterminism { sequence, detail } => EngineError::NonDeterminism {
                    run_id,
                    sequence,
                    detail,
                },
                ReplayError::Registry(err) => EngineError::Registry(err),
                other => EngineError::ReplayFailed(other.to_string()),
            })?;

        if record.status.is_closed() {
            if let Some(command) = outcome.commands.first() {
                return Err(EngineError::NonDeterminism {
                    run_id,
                    sequence: record.last_sequence + 1,
                    detail: format!("closed run produced new command {}", command.describe()),
                });
            }
        }

        Ok(history.len())
    }

    // =========================================================================
    // Worker API
    // =========================================================================

    /// Wait up to `timeout` for a workflow task on `queue`
    #[instrument(skip(self))]
    pub async fn poll_workflow_task(&self, queue: &str, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let task = self.workflow_tasks.poll(queue, remaining).await?;
            self.scheduled_wf
                .remove_if(&task.run_id, |_, pending| *pending == task.id);

            if !self.open_runs.contains_key(&task.run_id) {
                debug!(task_id = %task.id, run_id = %task.run_id, "dropping task of closed run");
                self.workflow_tasks.ack(task.id);
                continue;
            }

            self.inflight.insert(task.id, task.clone());
            return Some(task);
        }
    }

    /// Wait up to `timeout` for an activity task on `queue`
    pub async fn poll_activity_task(&self, queue: &str, timeout: Duration) -> Option<Task> {
        self.poll_activity_task_for(queue, timeout, &self.config.identity)
            .await
    }

    /// Like [`Engine::poll_activity_task`], recording `worker_id` as the claimant
    #[instrument(skip(self))]
    pub async fn poll_activity_task_for(
        &self,
        queue: &str,
        timeout: Duration,
        worker_id: &str,
    ) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let task = self.activity_tasks.poll(queue, remaining).await?;

            if !self.claim_attempt(&task, worker_id) {
                debug!(task_id = %task.id, "dropping superseded activity task");
                self.activity_tasks.ack(task.id);
                continue;
            }

            self.inflight.insert(task.id, task.clone());
            return Some(task);
        }
    }

    /// Replay a run and decide what its next workflow task records
    ///
    /// Nothing is written; pass the step to [`Engine::complete_task`].
    #[instrument(skip(self))]
    pub async fn advance(&self, run_id: Uuid) -> Result<WorkflowStep, EngineError> {
        let record = self.store.get_run(run_id).await?;
        let mut step = WorkflowStep {
            execution_id: record.execution_id.clone(),
            run_id,
            tail: record.last_sequence,
            task_attempt: 1,
            decision: StepDecision::AlreadyClosed,
            instance: None,
        };
        if record.status.is_closed() {
            return Ok(step);
        }

        let history = self.store.read(run_id, 1).await?;
        step.tail = history.last().map(|e| e.sequence).unwrap_or(record.last_sequence);
        step.task_attempt = replay::task_attempt(&history);

        if history.len() > self.config.max_events_per_run {
            warn!(%run_id, events = history.len(), limit = self.config.max_events_per_run, "history limit exceeded");
            step.decision = StepDecision::FailExecution {
                error: WorkflowError::new(format!(
                    "history has {} events, limit is {}",
                    history.len(),
                    self.config.max_events_per_run
                ))
                .with_code(error_codes::HISTORY_LIMIT_EXCEEDED),
            };
            return Ok(step);
        }

        step.decision = match replay::replay(&self.registry, &record.execution_id, run_id, &history) {
            Ok(outcome) => {
                step.instance = Some(outcome.instance);
                StepDecision::Commands {
                    commands: outcome.commands,
                    markers: outcome.markers,
                }
            }
            Err(ReplayError::NonDeterminism { sequence, detail }) => {
                error!(%run_id, sequence, %detail, "workflow code diverged from history");
                StepDecision::FailExecution {
                    error: WorkflowError::new(format!("sequence {sequence}: {detail}"))
                        .with_code(error_codes::NON_DETERMINISM),
                }
            }
            Err(ReplayError::MissingStart) => StepDecision::FailExecution {
                error: WorkflowError::new(ReplayError::MissingStart.to_string()),
            },
            Err(err) => {
                warn!(%run_id, attempt = step.task_attempt, error = %err, "workflow task failed");
                StepDecision::TaskFailed {
                    cause: err.to_string(),
                }
            }
        };

        Ok(step)
    }

    /// Record a task's outcome and acknowledge it
    ///
    /// A workflow step is appended at the tail it was computed against; on
    /// [`EngineError::Conflict`] the task stays leased and the caller
    /// advances again. A stale activity outcome is acknowledged and dropped.
    #[instrument(skip(self, outcome))]
    pub async fn complete_task(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<(), EngineError> {
        match outcome {
            TaskOutcome::Workflow(step) => self.complete_workflow_task(task_id, step).await,
            TaskOutcome::Activity(outcome) => self.complete_activity_task(task_id, outcome).await,
        }
    }

    /// Advance and complete a polled workflow task, re-replaying on conflict
    #[instrument(skip(self, task), fields(task_id = %task.id, run_id = %task.run_id))]
    pub async fn run_workflow_task(&self, task: &Task) -> Result<(), EngineError> {
        let mut conflicts = 0;
        loop {
            let result = match self.advance(task.run_id).await {
                Ok(step) => self.complete_workflow_task(task.id, step).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(EngineError::Conflict { .. }) if conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(conflicts, "lost append race, replaying again");
                }
                Err(err) => {
                    self.inflight.remove(&task.id);
                    self.workflow_tasks.release(task.id);
                    return Err(err);
                }
            }
        }
    }

    async fn complete_workflow_task(&self, task_id: Uuid, step: WorkflowStep) -> Result<(), EngineError> {
        let execution_id = step.execution_id.clone();
        match self.commit_step(step).await {
            Ok(()) | Err(EngineError::RunClosed(_)) => {
                self.inflight.remove(&task_id);
                self.workflow_tasks.ack(task_id);
                self.notifier.publish(LifecycleEvent::TaskCompleted {
                    task_id,
                    execution_id,
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn commit_step(&self, step: WorkflowStep) -> Result<(), EngineError> {
        let WorkflowStep {
            execution_id,
            run_id,
            tail,
            task_attempt,
            decision,
            instance,
        } = step;
        let now = self.clock.now();

        let events = match decision {
            StepDecision::AlreadyClosed => return Ok(()),
            StepDecision::Commands { commands, markers } => {
                let mut events = Vec::with_capacity(commands.len() + markers.len() + 1);
                if task_attempt > 1 {
                    events.push(WorkflowEvent::WorkflowTaskCompleted {
                        attempt: task_attempt,
                    });
                }
                events.extend(
                    markers
                        .into_iter()
                        .map(|(change_id, version)| WorkflowEvent::VersionMarkerRecorded { change_id, version }),
                );
                events.extend(commands.into_iter().map(|command| command_event(command, now)));
                events
            }
            StepDecision::TaskFailed { cause } => {
                let mut events = vec![WorkflowEvent::WorkflowTaskFailed {
                    attempt: task_attempt,
                    cause: cause.clone(),
                }];
                if self
                    .config
                    .workflow_task_retry
                    .next_delay(task_attempt + 1, None)
                    .is_give_up()
                {
                    warn!(%run_id, attempts = task_attempt, "workflow task retries exhausted");
                    events.push(WorkflowEvent::ExecutionFailed {
                        error: WorkflowError::new(cause).with_code(error_codes::WORKFLOW_TASK_FAILED),
                    });
                }
                events
            }
            StepDecision::FailExecution { error } => vec![
                WorkflowEvent::WorkflowTaskFailed {
                    attempt: task_attempt,
                    cause: error.message.clone(),
                },
                WorkflowEvent::ExecutionFailed { error },
            ],
        };

        if events.is_empty() {
            if let Some(instance) = instance {
                self.cache.insert(&execution_id, run_id, tail, instance);
            }
            return Ok(());
        }

        let batch = HistoryEvent::batch(tail, now, events);
        let new_tail = self.store.append(run_id, tail, batch.clone()).await?;
        debug!(%run_id, tail = new_tail, appended = batch.len(), "workflow task recorded");

        if let Some(instance) = instance {
            self.cache.insert(&execution_id, run_id, new_tail, instance);
        }
        self.after_append(&execution_id, run_id, &batch).await
    }

    async fn complete_activity_task(&self, task_id: Uuid, outcome: ActivityOutcome) -> Result<(), EngineError> {
        let task = self
            .inflight
            .remove(&task_id)
            .map(|(_, task)| task)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let Some(activity) = task.as_activity() else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        let run_id = task.run_id;
        let activity_id = activity.activity_id.clone();

        let claimed = self
            .activities
            .get_mut(&(run_id, activity_id.clone()))
            .and_then(|mut runtime| {
                if runtime.task_id != Some(task_id)
                    || !matches!(runtime.phase, AttemptPhase::Queued | AttemptPhase::Running { .. })
                {
                    return None;
                }
                let was = std::mem::replace(&mut runtime.phase, AttemptPhase::Resolving);
                Some((was, runtime.options.retry_policy.clone()))
            });

        let Some((was, policy)) = claimed else {
            debug!(%task_id, %activity_id, "late outcome of a superseded attempt, dropping");
            self.activity_tasks.ack(task_id);
            return Ok(());
        };

        let events = match outcome {
            ActivityOutcome::Completed(result) => vec![WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.clone(),
                attempt: activity.attempt,
                result,
            }],
            ActivityOutcome::Failed(failure) => {
                let worker_id = match &was {
                    AttemptPhase::Running { worker_id } => worker_id.as_str(),
                    _ => self.config.identity.as_str(),
                };
                self.attempt_failure_events(
                    run_id,
                    &activity_id,
                    activity.attempt,
                    Some(worker_id),
                    failure,
                    &policy,
                )
            }
        };

        match self.append_external(run_id, events).await {
            Ok(_) => {
                self.activity_tasks.ack(task_id);
                self.notifier.publish(LifecycleEvent::TaskCompleted {
                    task_id,
                    execution_id: task.execution_id.clone(),
                });
                Ok(())
            }
            Err(err) => {
                self.restore_phase(run_id, &activity_id, was);
                self.inflight.insert(task_id, task);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Create a run from a start request or continue-as-new
    async fn create_run(&self, request: RunRequest) -> Result<Vec<HistoryEvent>, EngineError> {
        let now = self.clock.now();
        let events = HistoryEvent::batch(
            0,
            now,
            vec![
                WorkflowEvent::ExecutionStarted {
                    workflow_type: request.workflow_type.clone(),
                    input: request.input,
                    task_queue: request.task_queue.clone(),
                    execution_timeout_ms: request.execution_timeout_ms,
                    continued_from: request.continued_from,
                },
                WorkflowEvent::WorkflowTaskScheduled {
                    task_queue: request.task_queue.clone(),
                    attempt: 1,
                },
            ],
        );

        self.store
            .create_execution(NewExecution {
                execution_id: request.execution_id.clone(),
                run_id: request.run_id,
                workflow_type: request.workflow_type.clone(),
                task_queue: request.task_queue,
                created_at: now,
                events: events.clone(),
            })
            .await?;

        info!(
            execution_id = %request.execution_id,
            run_id = %request.run_id,
            workflow_type = %request.workflow_type,
            continued_from = ?request.continued_from,
            "run started"
        );
        self.notifier.publish(LifecycleEvent::ExecutionStarted {
            execution_id: request.execution_id,
            run_id: request.run_id,
            workflow_type: request.workflow_type,
        });
        Ok(events)
    }

    /// React to an appended batch, creating the continued run if there is one
    pub(super) async fn after_append(
        &self,
        execution_id: &str,
        run_id: Uuid,
        events: &[HistoryEvent],
    ) -> Result<(), EngineError> {
        let mut follow = self.on_appended(execution_id, run_id, events);
        while let Some(request) = follow.take() {
            let next_run = request.run_id;
            match self.create_run(request).await {
                Ok(events) => follow = self.on_appended(execution_id, next_run, &events),
                Err(EngineError::AlreadyStarted(_)) => {
                    debug!(%execution_id, run_id = %next_run, "continued run already exists");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Append events that originate outside workflow code
    ///
    /// Re-reads the tail on every conflict. Returns `None` without appending
    /// when the run is closed.
    pub(super) async fn append_external(
        &self,
        run_id: Uuid,
        events: Vec<WorkflowEvent>,
    ) -> Result<Option<u64>, EngineError> {
        self.append_external_when(run_id, events, None).await
    }

    /// Like [`append_external`](Self::append_external), but only while
    /// `still_wanted` holds for the history the append is conditioned on
    pub(super) async fn append_external_when(
        &self,
        run_id: Uuid,
        events: Vec<WorkflowEvent>,
        still_wanted: Option<&(dyn Fn(&[HistoryEvent]) -> bool + Sync)>,
    ) -> Result<Option<u64>, EngineError> {
        let mut last_conflict = (0, 0);
        for _ in 0..=self.config.max_conflict_retries {
            let record = self.store.get_run(run_id).await?;
            if record.status.is_closed() {
                return Ok(None);
            }

            let mut tail = record.last_sequence;
            if let Some(still_wanted) = still_wanted {
                let history = self.store.read(run_id, 1).await?;
                if !still_wanted(&history) {
                    return Ok(None);
                }
                tail = history.last().map_or(0, |e| e.sequence);
            }

            let batch = HistoryEvent::batch(tail, self.clock.now(), events.clone());
            match self.store.append(run_id, tail, batch.clone()).await {
                Ok(tail) => {
                    self.after_append(&record.execution_id, run_id, &batch).await?;
                    return Ok(Some(tail));
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    last_conflict = (expected, actual);
                }
                Err(StoreError::ExecutionClosed(_)) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::Conflict {
            expected: last_conflict.0,
            actual: last_conflict.1,
        })
    }
}

impl<S: EventLogStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open_runs", &self.open_runs.len())
            .field("activities", &self.activities.len())
            .field("timers", &self.timers.len())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Event recording a new command
fn command_event(command: WorkflowAction, now: DateTime<Utc>) -> WorkflowEvent {
    match command {
        WorkflowAction::ScheduleActivity {
            activity_id,
            activity_type,
            input,
            options,
        } => WorkflowEvent::ActivityScheduled {
            activity_id,
            activity_type,
            input,
            options,
        },
        WorkflowAction::StartTimer { timer_id, duration } => WorkflowEvent::TimerStarted {
            timer_id,
            fire_at: clock::add(now, duration),
        },
        WorkflowAction::CancelTimer { timer_id } => WorkflowEvent::TimerCancelled { timer_id },
        WorkflowAction::CancelActivity { activity_id } => {
            WorkflowEvent::ActivityCancelled { activity_id }
        }
        WorkflowAction::CompleteWorkflow { result } => WorkflowEvent::ExecutionCompleted { result },
        WorkflowAction::FailWorkflow { error } => WorkflowEvent::ExecutionFailed { error },
        WorkflowAction::CancelWorkflow { reason } => WorkflowEvent::ExecutionCancelled { reason },
        WorkflowAction::ContinueAsNew { input } => WorkflowEvent::ExecutionContinuedAsNew {
            new_run_id: Uuid::now_v7(),
            input,
        },
    }
}

/// Outcome recorded by a terminal event
fn outcome_of(event: &WorkflowEvent) -> Option<ExecutionOutcome> {
    match event {
        WorkflowEvent::ExecutionCompleted { result } => Some(ExecutionOutcome::Completed(result.clone())),
        WorkflowEvent::ExecutionFailed { error } => Some(ExecutionOutcome::Failed(error.clone())),
        WorkflowEvent::ExecutionCancelled { reason } => Some(ExecutionOutcome::Cancelled {
            reason: reason.clone(),
        }),
        WorkflowEvent::ExecutionTimedOut => Some(ExecutionOutcome::TimedOut),
        _ => None,
    }
}
