//! Deriving dispatchable work from history
//!
//! Nothing in this module is durable. Every task, timer and in-flight
//! activity attempt is a consequence of some appended event, so the same
//! code runs for freshly appended batches and, on recovery, for a run's
//! entire history.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::Engine;
use super::notify::LifecycleEvent;
use super::EngineError;
use crate::activity::{ActivityFailure, HeartbeatError, HeartbeatSink};
use crate::clock;
use crate::matcher::{ActivityTask, Task, TaskKind};
use crate::persistence::{EventLogStore, ExecutionStatus};
use crate::reliability::{AttemptTiming, RetryDecision, RetryPolicy, TimeoutType};
use crate::timer::{TimerEntry, TimerKind};
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowEvent};

/// What the engine remembers about an open run
#[derive(Debug, Clone)]
pub(super) struct RunInfo {
    pub workflow_type: String,
    pub task_queue: String,
    pub execution_timeout_ms: Option<u64>,
}

/// Where an activity's current attempt stands
#[derive(Debug, Clone, PartialEq)]
pub(super) enum AttemptPhase {
    /// Waiting for the first dispatch or for a retry timer
    Backoff,
    /// In the queue
    Queued,
    /// Claimed by a worker
    Running { worker_id: String },
    /// An outcome is being recorded
    Resolving,
}

/// An activity that has been scheduled and not yet resolved
#[derive(Debug)]
pub(super) struct ActivityRuntime {
    pub execution_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
    pub queue: String,
    pub attempt: u32,
    pub task_id: Option<Uuid>,
    pub phase: AttemptPhase,
    pub timing: AttemptTiming,
    pub cancel: CancellationToken,
}

/// A run to create, from a start request or continue-as-new
#[derive(Debug, Clone)]
pub(super) struct RunRequest {
    pub execution_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub input: Value,
    pub task_queue: String,
    pub execution_timeout_ms: Option<u64>,
    pub continued_from: Option<Uuid>,
}

impl<S: EventLogStore> Engine<S> {
    /// React to events just appended to (or recovered from) a run
    ///
    /// Returns the run to create when the batch continued the execution
    /// as new.
    pub(super) fn on_appended(
        &self,
        execution_id: &str,
        run_id: Uuid,
        events: &[HistoryEvent],
    ) -> Option<RunRequest> {
        let resolved: HashSet<&str> = events
            .iter()
            .filter(|e| e.event.is_activity_resolution())
            .filter_map(|e| e.event.activity_id())
            .collect();
        let retried: HashSet<&str> = events
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::ActivityAttemptFailed { .. }))
            .filter_map(|e| e.event.activity_id())
            .collect();
        let finished_timers: HashSet<&str> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.event,
                    WorkflowEvent::TimerFired { .. } | WorkflowEvent::TimerCancelled { .. }
                )
            })
            .filter_map(|e| e.event.timer_id())
            .collect();
        let closes = events.iter().any(|e| e.event.is_terminal());

        let mut needs_task = false;
        let mut task_attempt = 1;
        let mut follow = None;

        for event in events {
            match &event.event {
                WorkflowEvent::ExecutionStarted {
                    workflow_type,
                    task_queue,
                    execution_timeout_ms,
                    ..
                } => {
                    self.open_runs.insert(
                        run_id,
                        RunInfo {
                            workflow_type: workflow_type.clone(),
                            task_queue: task_queue.clone(),
                            execution_timeout_ms: *execution_timeout_ms,
                        },
                    );
                    if let (Some(ms), false) = (execution_timeout_ms, closes) {
                        let fire_at = clock::add(event.recorded_at, Duration::from_millis(*ms));
                        self.timers.start_timer(TimerEntry::new(
                            execution_id,
                            run_id,
                            TimerKind::ExecutionTimeout,
                            fire_at,
                            event.sequence,
                        ));
                    }
                }
                WorkflowEvent::WorkflowTaskScheduled { attempt, .. } => {
                    self.timers.cancel_where(|t| {
                        t.run_id == run_id && matches!(t.kind, TimerKind::WorkflowTaskRetry { .. })
                    });
                    needs_task = true;
                    task_attempt = *attempt;
                }
                WorkflowEvent::WorkflowTaskFailed { attempt, .. } if !closes => {
                    needs_task = false;
                    let next = attempt + 1;
                    if let RetryDecision::Retry(delay) =
                        self.config.workflow_task_retry.next_delay(next, None)
                    {
                        self.timers.start_timer(TimerEntry::new(
                            execution_id,
                            run_id,
                            TimerKind::WorkflowTaskRetry { attempt: next },
                            clock::add(event.recorded_at, delay),
                            event.sequence,
                        ));
                    }
                }
                WorkflowEvent::ActivityScheduled {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } if !closes && !resolved.contains(activity_id.as_str()) => {
                    self.schedule_activity(
                        execution_id,
                        run_id,
                        activity_id,
                        activity_type,
                        input.clone(),
                        options.clone(),
                        event.recorded_at,
                    );
                    if !retried.contains(activity_id.as_str()) {
                        self.dispatch_attempt(run_id, activity_id, 1);
                    }
                }
                WorkflowEvent::ActivityAttemptFailed {
                    activity_id,
                    attempt,
                    retry_delay_ms,
                    ..
                } => {
                    self.end_attempt(run_id, activity_id);
                    if let (Some(ms), false) = (retry_delay_ms, closes) {
                        self.timers.cancel_where(|t| is_retry_of(t, run_id, activity_id));
                        self.timers.start_timer(TimerEntry::new(
                            execution_id,
                            run_id,
                            TimerKind::ActivityRetry {
                                activity_id: activity_id.clone(),
                                attempt: attempt + 1,
                            },
                            clock::add(event.recorded_at, Duration::from_millis(*ms)),
                            event.sequence,
                        ));
                    }
                }
                WorkflowEvent::ActivityCompleted { activity_id, .. }
                | WorkflowEvent::ActivityFailed { activity_id, .. }
                | WorkflowEvent::ActivityTimedOut { activity_id, .. }
                | WorkflowEvent::ActivityCancelled { activity_id } => {
                    self.drop_activity(run_id, activity_id);
                }
                WorkflowEvent::TimerStarted { timer_id, fire_at }
                    if !closes && !finished_timers.contains(timer_id.as_str()) =>
                {
                    self.timers.start_timer(TimerEntry::new(
                        execution_id,
                        run_id,
                        TimerKind::Workflow {
                            timer_id: timer_id.clone(),
                        },
                        *fire_at,
                        event.sequence,
                    ));
                }
                WorkflowEvent::TimerFired { timer_id } | WorkflowEvent::TimerCancelled { timer_id } => {
                    self.timers.cancel_where(|t| {
                        t.run_id == run_id
                            && matches!(&t.kind, TimerKind::Workflow { timer_id: id } if id == timer_id)
                    });
                }
                _ => {}
            }

            if event.event.is_workflow_input()
                && !matches!(event.event, WorkflowEvent::ExecutionStarted { .. })
            {
                needs_task = true;
            }

            if let Some(status) = ExecutionStatus::closed_by(&event.event) {
                let info = self.close_run(execution_id, run_id, status);
                if let (WorkflowEvent::ExecutionContinuedAsNew { new_run_id, input }, Some(info)) =
                    (&event.event, info)
                {
                    follow = Some(RunRequest {
                        execution_id: execution_id.to_string(),
                        run_id: *new_run_id,
                        workflow_type: info.workflow_type,
                        input: input.clone(),
                        task_queue: info.task_queue,
                        execution_timeout_ms: info.execution_timeout_ms,
                        continued_from: Some(run_id),
                    });
                }
            }
        }

        if needs_task && !closes {
            self.schedule_workflow_task(execution_id, run_id, task_attempt);
        }

        follow
    }

    /// Put a workflow task for the run on its queue, unless one is pending
    fn schedule_workflow_task(&self, execution_id: &str, run_id: Uuid, attempt: u32) {
        let Some(queue) = self.open_runs.get(&run_id).map(|run| run.task_queue.clone()) else {
            return;
        };
        if self.timers.contains(|t| {
            t.run_id == run_id && matches!(t.kind, TimerKind::WorkflowTaskRetry { .. })
        }) {
            debug!(%run_id, "workflow task in backoff, not scheduling");
            return;
        }

        let task = Task::new(
            queue.clone(),
            execution_id,
            run_id,
            TaskKind::Workflow { attempt },
            self.clock.now(),
            self.config.workflow_task_timeout,
        );
        match self.scheduled_wf.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(task.id);
            }
        }

        self.notifier.publish(LifecycleEvent::TaskScheduled {
            task_id: task.id,
            queue,
            execution_id: execution_id.to_string(),
            kind: "workflow",
        });
        self.workflow_tasks.enqueue(task);
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_activity(
        &self,
        execution_id: &str,
        run_id: Uuid,
        activity_id: &str,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
        scheduled_at: DateTime<Utc>,
    ) {
        let queue = options
            .task_queue
            .clone()
            .or_else(|| self.open_runs.get(&run_id).map(|run| run.task_queue.clone()))
            .unwrap_or_else(|| self.config.default_task_queue.clone());

        self.activities.insert(
            (run_id, activity_id.to_string()),
            ActivityRuntime {
                execution_id: execution_id.to_string(),
                activity_type: activity_type.to_string(),
                input,
                options,
                queue,
                attempt: 0,
                task_id: None,
                phase: AttemptPhase::Backoff,
                timing: AttemptTiming::queued(scheduled_at, scheduled_at),
                cancel: CancellationToken::new(),
            },
        );
    }

    /// Queue attempt `attempt` of an activity waiting in backoff
    pub(super) fn dispatch_attempt(&self, run_id: Uuid, activity_id: &str, attempt: u32) -> bool {
        let now = self.clock.now();
        let task = {
            let Some(mut runtime) = self.activities.get_mut(&(run_id, activity_id.to_string()))
            else {
                return false;
            };
            if runtime.phase != AttemptPhase::Backoff {
                return false;
            }

            let task = Task::new(
                runtime.queue.clone(),
                runtime.execution_id.clone(),
                run_id,
                TaskKind::Activity(ActivityTask {
                    activity_id: activity_id.to_string(),
                    activity_type: runtime.activity_type.clone(),
                    input: runtime.input.clone(),
                    attempt,
                    options: runtime.options.clone(),
                    scheduled_at: runtime.timing.scheduled_at,
                }),
                now,
                runtime.options.timeouts.start_to_close + self.config.activity_lease_grace,
            );

            runtime.attempt = attempt;
            runtime.task_id = Some(task.id);
            runtime.phase = AttemptPhase::Queued;
            runtime.timing = AttemptTiming::queued(runtime.timing.scheduled_at, now);
            runtime.cancel = CancellationToken::new();
            task
        };

        debug!(%run_id, %activity_id, attempt, task_id = %task.id, "dispatching activity attempt");
        self.notifier.publish(LifecycleEvent::TaskScheduled {
            task_id: task.id,
            queue: task.queue.clone(),
            execution_id: task.execution_id.clone(),
            kind: "activity",
        });
        self.activity_tasks.enqueue(task);
        true
    }

    /// Retire the current attempt's task and token
    fn end_attempt(&self, run_id: Uuid, activity_id: &str) {
        if let Some(mut runtime) = self.activities.get_mut(&(run_id, activity_id.to_string())) {
            runtime.cancel.cancel();
            if let Some(task_id) = runtime.task_id.take() {
                self.activity_tasks.cancel(&runtime.queue, task_id);
                self.inflight.remove(&task_id);
            }
            runtime.phase = AttemptPhase::Backoff;
        }
    }

    fn drop_activity(&self, run_id: Uuid, activity_id: &str) {
        if let Some((_, runtime)) = self.activities.remove(&(run_id, activity_id.to_string())) {
            runtime.cancel.cancel();
            if let Some(task_id) = runtime.task_id {
                self.activity_tasks.cancel(&runtime.queue, task_id);
                self.inflight.remove(&task_id);
            }
        }
        self.timers.cancel_where(|t| is_retry_of(t, run_id, activity_id));
    }

    /// Forget a closed run's transient state
    fn close_run(&self, execution_id: &str, run_id: Uuid, status: ExecutionStatus) -> Option<RunInfo> {
        let info = self.open_runs.remove(&run_id).map(|(_, info)| info);

        self.timers.cancel_where(|t| t.run_id == run_id);
        if let (Some((_, task_id)), Some(info)) = (self.scheduled_wf.remove(&run_id), &info) {
            self.workflow_tasks.cancel(&info.task_queue, task_id);
        }
        self.activities.retain(|(owner, _), runtime| {
            if *owner != run_id {
                return true;
            }
            runtime.cancel.cancel();
            if let Some(task_id) = runtime.task_id {
                self.activity_tasks.cancel(&runtime.queue, task_id);
                self.inflight.remove(&task_id);
            }
            false
        });

        info!(%execution_id, %run_id, %status, "run closed");
        self.notifier.publish(LifecycleEvent::ExecutionClosed {
            execution_id: execution_id.to_string(),
            run_id,
            status,
        });
        info
    }

    /// Mark a polled activity task as running on `worker_id`
    pub(super) fn claim_attempt(&self, task: &Task, worker_id: &str) -> bool {
        let Some(activity) = task.as_activity() else {
            return false;
        };
        let Some(mut runtime) = self
            .activities
            .get_mut(&(task.run_id, activity.activity_id.clone()))
        else {
            return false;
        };
        if runtime.task_id != Some(task.id)
            || !matches!(runtime.phase, AttemptPhase::Queued | AttemptPhase::Running { .. })
        {
            return false;
        }

        runtime.phase = AttemptPhase::Running {
            worker_id: worker_id.to_string(),
        };
        runtime.timing.started_at = Some(self.clock.now());
        runtime.timing.last_heartbeat_at = None;
        true
    }

    /// Cancellation token of the attempt carried by `task`
    ///
    /// Already cancelled when the attempt is no longer current.
    pub fn cancellation_token(&self, task: &Task) -> CancellationToken {
        task.as_activity()
            .and_then(|activity| {
                self.activities
                    .get(&(task.run_id, activity.activity_id.clone()))
                    .filter(|runtime| runtime.task_id == Some(task.id))
                    .map(|runtime| runtime.cancel.clone())
            })
            .unwrap_or_else(|| {
                let token = CancellationToken::new();
                token.cancel();
                token
            })
    }

    /// Record liveness for a running activity attempt
    pub fn heartbeat(&self, task_id: Uuid, details: Option<Value>) -> Result<(), HeartbeatError> {
        let task = self
            .inflight
            .get(&task_id)
            .map(|task| task.clone())
            .ok_or(HeartbeatError::NotActive)?;
        let activity = task.as_activity().ok_or(HeartbeatError::NotActive)?;

        let lease = {
            let mut runtime = self
                .activities
                .get_mut(&(task.run_id, activity.activity_id.clone()))
                .ok_or(HeartbeatError::NotActive)?;
            if runtime.task_id != Some(task_id)
                || !matches!(runtime.phase, AttemptPhase::Running { .. })
            {
                return Err(HeartbeatError::NotActive);
            }
            if runtime.cancel.is_cancelled() {
                return Err(HeartbeatError::Cancelled);
            }
            runtime.timing.last_heartbeat_at = Some(self.clock.now());
            runtime.options.timeouts.start_to_close + self.config.activity_lease_grace
        };

        if details.is_some() {
            debug!(%task_id, ?details, "heartbeat");
        }
        self.activity_tasks.extend(task_id, lease);
        Ok(())
    }

    /// Events recording one failed attempt, and the activity's end if retries are over
    pub(super) fn attempt_failure_events(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        worker_id: Option<&str>,
        failure: ActivityFailure,
        policy: &RetryPolicy,
    ) -> Vec<WorkflowEvent> {
        let mut events = Vec::with_capacity(3);
        if let Some(worker_id) = worker_id {
            events.push(WorkflowEvent::ActivityStarted {
                activity_id: activity_id.to_string(),
                attempt,
                worker_id: worker_id.to_string(),
            });
        }

        let decision = if failure.is_retryable() {
            policy.next_delay(attempt + 1, failure.error_type())
        } else {
            RetryDecision::GiveUp
        };

        match decision {
            RetryDecision::Retry(delay) => {
                let delay = policy.jittered(delay, jitter_seed(run_id, activity_id, attempt));
                events.push(WorkflowEvent::ActivityAttemptFailed {
                    activity_id: activity_id.to_string(),
                    attempt,
                    failure,
                    retry_delay_ms: Some(delay.as_millis() as u64),
                });
            }
            RetryDecision::GiveUp => {
                events.push(WorkflowEvent::ActivityAttemptFailed {
                    activity_id: activity_id.to_string(),
                    attempt,
                    failure: failure.clone(),
                    retry_delay_ms: None,
                });
                events.push(match failure.timeout_type() {
                    Some(timeout_type) => WorkflowEvent::ActivityTimedOut {
                        activity_id: activity_id.to_string(),
                        timeout_type,
                    },
                    None => WorkflowEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        attempts: attempt,
                        failure,
                    },
                });
            }
        }

        events
    }

    /// Fire every timer that is due, returning how many fired
    pub async fn fire_due_timers(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;

        for mut entry in self.timers.pop_due(now) {
            let result = match &entry.kind {
                TimerKind::Workflow { timer_id } => {
                    let pending = |history: &[HistoryEvent]| timer_is_pending(history, timer_id);
                    self.append_external_when(
                        entry.run_id,
                        vec![WorkflowEvent::TimerFired {
                            timer_id: timer_id.clone(),
                        }],
                        Some(&pending),
                    )
                    .await
                    .map(|tail| {
                        if tail.is_none() {
                            debug!(run_id = %entry.run_id, %timer_id, "timer no longer pending, not firing");
                        }
                        tail.is_some()
                    })
                }
                TimerKind::ActivityRetry {
                    activity_id,
                    attempt,
                } => {
                    self.dispatch_attempt(entry.run_id, activity_id, *attempt);
                    Ok(true)
                }
                TimerKind::WorkflowTaskRetry { attempt } => {
                    let task_queue = self
                        .open_runs
                        .get(&entry.run_id)
                        .map(|run| run.task_queue.clone())
                        .unwrap_or_else(|| self.config.default_task_queue.clone());
                    self.append_external(
                        entry.run_id,
                        vec![WorkflowEvent::WorkflowTaskScheduled {
                            task_queue,
                            attempt: *attempt,
                        }],
                    )
                    .await
                    .map(|_| true)
                }
                TimerKind::ExecutionTimeout => {
                    info!(execution_id = %entry.execution_id, run_id = %entry.run_id, "execution timed out");
                    self.append_external(entry.run_id, vec![WorkflowEvent::ExecutionTimedOut])
                        .await
                        .map(|_| true)
                }
            };

            match result {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(timer_id = %entry.id, error = %err, "timer action failed, re-arming");
                    entry.fire_at = clock::add(now, self.config.timer_tick);
                    self.timers.start_timer(entry);
                }
            }
        }

        fired
    }

    /// Time out activity attempts past a deadline, returning how many were resolved
    pub async fn check_timeouts(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<((Uuid, String), TimeoutType)> = self
            .activities
            .iter()
            .filter_map(|entry| {
                let runtime = entry.value();
                let timeout_type = match runtime.phase {
                    AttemptPhase::Resolving => None,
                    AttemptPhase::Backoff => runtime
                        .timing
                        .schedule_to_close_deadline(&runtime.options.timeouts)
                        .filter(|deadline| *deadline <= now)
                        .map(|_| TimeoutType::ScheduleToClose),
                    _ => runtime.timing.check(&runtime.options.timeouts, now),
                }?;
                Some((entry.key().clone(), timeout_type))
            })
            .collect();

        let mut resolved = 0;
        for ((run_id, activity_id), timeout_type) in expired {
            let claimed = self.activities.get_mut(&(run_id, activity_id.clone())).and_then(|mut runtime| {
                if runtime.phase == AttemptPhase::Resolving {
                    return None;
                }
                let was = std::mem::replace(&mut runtime.phase, AttemptPhase::Resolving);
                Some((was, runtime.attempt, runtime.options.retry_policy.clone()))
            });
            let Some((was, attempt, policy)) = claimed else {
                continue;
            };

            warn!(%run_id, %activity_id, attempt, %timeout_type, "activity timed out");
            let events = match &was {
                AttemptPhase::Backoff => vec![WorkflowEvent::ActivityTimedOut {
                    activity_id: activity_id.clone(),
                    timeout_type,
                }],
                AttemptPhase::Running { worker_id } => self.attempt_failure_events(
                    run_id,
                    &activity_id,
                    attempt,
                    Some(worker_id),
                    ActivityFailure::timeout(timeout_type),
                    &policy,
                ),
                _ => self.attempt_failure_events(
                    run_id,
                    &activity_id,
                    attempt,
                    None,
                    ActivityFailure::timeout(timeout_type),
                    &policy,
                ),
            };

            match self.append_external(run_id, events).await {
                Ok(_) => resolved += 1,
                Err(err) => {
                    warn!(%run_id, %activity_id, error = %err, "failed to record activity timeout");
                    self.restore_phase(run_id, &activity_id, was);
                }
            }
        }

        resolved
    }

    pub(super) fn restore_phase(&self, run_id: Uuid, activity_id: &str, phase: AttemptPhase) {
        if let Some(mut runtime) = self.activities.get_mut(&(run_id, activity_id.to_string())) {
            if runtime.phase == AttemptPhase::Resolving {
                runtime.phase = phase;
            }
        }
    }

    /// Make tasks whose lease ran out pollable again
    pub fn reclaim_expired_tasks(&self) -> usize {
        let now = self.clock.now();
        self.workflow_tasks.reclaim_expired(now) + self.activity_tasks.reclaim_expired(now)
    }

    /// Drive timers, timeouts and lease expiry until `shutdown` is cancelled
    pub async fn run_timer_loop(&self, shutdown: CancellationToken) {
        info!("timer loop started");
        let mut last_sweep = tokio::time::Instant::now();

        loop {
            self.fire_due_timers().await;

            if last_sweep.elapsed() >= self.config.timeout_sweep_interval {
                self.check_timeouts().await;
                self.reclaim_expired_tasks();
                last_sweep = tokio::time::Instant::now();
            }

            let tick = self.config.timer_tick;
            let wait = self
                .timers
                .next_fire_at()
                .map(|at| clock::until(self.clock.now(), at).min(tick))
                .unwrap_or(tick);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.timers.changed() => {}
            }
        }

        info!("timer loop stopped");
    }

    /// Rebuild tasks, timers and activity attempts of every open run from history
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let open = self.store.list_open_runs().await?;
        let mut recovered = 0;

        for record in open {
            if self.open_runs.contains_key(&record.run_id) {
                continue;
            }
            let history = self.store.read(record.run_id, 1).await?;
            self.after_append(&record.execution_id, record.run_id, &history)
                .await?;
            recovered += 1;
        }

        info!(recovered, "recovered open runs");
        Ok(recovered)
    }

    /// Delete runs closed longer ago than the retention window
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64, EngineError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let purged = self.store.purge_closed_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged closed runs");
        }
        Ok(purged)
    }
}

#[async_trait]
impl<S: EventLogStore> HeartbeatSink for Engine<S> {
    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        details: Option<Value>,
    ) -> Result<(), HeartbeatError> {
        self.heartbeat(task_id, details)
    }
}

fn is_retry_of(timer: &TimerEntry, run_id: Uuid, activity_id: &str) -> bool {
    timer.run_id == run_id
        && matches!(&timer.kind, TimerKind::ActivityRetry { activity_id: id, .. } if id == activity_id)
}

/// Started and neither cancelled nor fired yet
fn timer_is_pending(history: &[HistoryEvent], timer_id: &str) -> bool {
    history.iter().fold(false, |pending, e| match &e.event {
        WorkflowEvent::TimerStarted { timer_id: id, .. } if id == timer_id => true,
        WorkflowEvent::TimerCancelled { timer_id: id } | WorkflowEvent::TimerFired { timer_id: id }
            if id == timer_id =>
        {
            false
        }
        _ => pending,
    })
}

/// Seed for retry jitter, fixed per attempt so a recomputed delay matches
fn jitter_seed(run_id: Uuid, activity_id: &str, attempt: u32) -> u64 {
    let (hi, lo) = run_id.as_u64_pair();
    activity_id
        .bytes()
        .fold(hi ^ lo ^ u64::from(attempt), |seed, b| {
            seed.rotate_left(5) ^ u64::from(b)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_seed_is_stable() {
        let run_id = Uuid::now_v7();
        assert_eq!(jitter_seed(run_id, "a1", 2), jitter_seed(run_id, "a1", 2));
        assert_ne!(jitter_seed(run_id, "a1", 2), jitter_seed(run_id, "a1", 3));
    }

    #[test]
    fn test_timer_is_pending() {
        let now = Utc::now();
        let started = WorkflowEvent::TimerStarted {
            timer_id: "deadline".into(),
            fire_at: now,
        };
        let cancelled = WorkflowEvent::TimerCancelled {
            timer_id: "deadline".into(),
        };
        let other = WorkflowEvent::TimerFired {
            timer_id: "reminder".into(),
        };

        let open = HistoryEvent::batch(0, now, vec![started.clone(), other]);
        assert!(timer_is_pending(&open, "deadline"));
        assert!(!timer_is_pending(&open, "reminder"));

        let closed = HistoryEvent::batch(0, now, vec![started, cancelled]);
        assert!(!timer_is_pending(&closed, "deadline"));
        assert!(!timer_is_pending(&[], "deadline"));
    }

    #[test]
    fn test_is_retry_of() {
        let run_id = Uuid::now_v7();
        let entry = TimerEntry::new(
            "exec-1",
            run_id,
            TimerKind::ActivityRetry {
                activity_id: "a1".into(),
                attempt: 2,
            },
            Utc::now(),
            4,
        );

        assert!(is_retry_of(&entry, run_id, "a1"));
        assert!(!is_retry_of(&entry, run_id, "a2"));
        assert!(!is_retry_of(&entry, Uuid::now_v7(), "a1"));
    }
}
