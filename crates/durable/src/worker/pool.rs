//! Poll loops that run an engine's tasks in-process
//!
//! Runs poll loops for workflow and activity tasks against an [`Engine`],
//! bounds concurrent work with semaphores, and drains in-flight work on
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityInvoker, ActivityRegistry};
use crate::config::{env_millis, env_parse};
use crate::engine::{Engine, EngineError, TaskOutcome};
use crate::persistence::EventLogStore;
use crate::reliability::duration_millis;

/// How many tasks a pool runs, from which queues
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Worker ID recorded on claimed activity attempts
    pub worker_id: String,

    /// Queues polled for both workflow and activity tasks
    pub queues: Vec<String>,

    /// Maximum workflow tasks running at once
    pub max_concurrent_executions: usize,

    /// Maximum activity attempts running at once
    pub max_concurrent_activities: usize,

    /// Long-poll timeout of each poll request
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Drain budget for [`WorkerPool::shutdown`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Drive the engine's timer and timeout loop from this pool
    pub run_timers: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: vec!["default".to_string()],
            max_concurrent_executions: 10,
            max_concurrent_activities: 10,
            poll_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            run_timers: true,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration polling the given queues
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// - `KEEL_WORKER_ID`
    /// - `KEEL_WORKER_QUEUES` (comma separated)
    /// - `KEEL_WORKER_MAX_EXECUTIONS`
    /// - `KEEL_WORKER_MAX_ACTIVITIES`
    /// - `KEEL_WORKER_POLL_TIMEOUT_MS`
    /// - `KEEL_WORKER_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queues = std::env::var("KEEL_WORKER_QUEUES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|queues| !queues.is_empty())
            .unwrap_or(defaults.queues);

        Self {
            worker_id: std::env::var("KEEL_WORKER_ID").unwrap_or(defaults.worker_id),
            queues,
            max_concurrent_executions: env_parse("KEEL_WORKER_MAX_EXECUTIONS")
                .unwrap_or(defaults.max_concurrent_executions),
            max_concurrent_activities: env_parse("KEEL_WORKER_MAX_ACTIVITIES")
                .unwrap_or(defaults.max_concurrent_activities),
            poll_timeout: env_millis("KEEL_WORKER_POLL_TIMEOUT_MS").unwrap_or(defaults.poll_timeout),
            shutdown_timeout: env_millis("KEEL_WORKER_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
            run_timers: defaults.run_timers,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Clamped to at least one
    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max.max(1);
        self
    }

    /// Clamped to at least one
    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable the timer loop
    pub fn with_timers(mut self, run_timers: bool) -> Self {
        self.run_timers = run_timers;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    /// Polling stopped; in-flight tasks are finishing
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    /// In-flight tasks outlived `shutdown_timeout`
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Runs workflow tasks and activity attempts for one worker process
///
/// Each queue gets a workflow poll loop and an activity poll loop, bounded
/// by separate semaphores.
///
///
/// ```ignore
/// let mut activities = ActivityRegistry::new();
/// activities.register_fn("charge", |_ctx, input| async move { Ok(input) });
///
/// let pool = WorkerPool::new(engine.clone(), activities, WorkerPoolConfig::default());
/// pool.start().await?;
///
/// // stop polling, then wait for in-flight work
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: EventLogStore> {
    engine: Arc<Engine<S>>,
    invoker: ActivityInvoker,
    config: WorkerPoolConfig,
    status: RwLock<WorkerPoolStatus>,
    shutdown: Mutex<CancellationToken>,
    workflow_slots: Arc<Semaphore>,
    activity_slots: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: EventLogStore> WorkerPool<S> {
    pub fn new(engine: Arc<Engine<S>>, activities: ActivityRegistry, config: WorkerPoolConfig) -> Self {
        Self {
            engine,
            invoker: ActivityInvoker::new(Arc::new(activities)),
            workflow_slots: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            activity_slots: Arc::new(Semaphore::new(config.max_concurrent_activities)),
            config,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            shutdown: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Recover open runs and start polling
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            max_concurrent_executions = self.config.max_concurrent_executions,
            max_concurrent_activities = self.config.max_concurrent_activities,
            "worker pool starting"
        );

        if let Err(err) = self.engine.recover().await {
            *self.status.write() = WorkerPoolStatus::Stopped;
            return Err(err.into());
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();

        let mut handles = self.handles.lock();
        for queue in &self.config.queues {
            handles.push(tokio::spawn(workflow_loop(
                self.engine.clone(),
                queue.clone(),
                self.workflow_slots.clone(),
                self.config.poll_timeout,
                shutdown.clone(),
            )));
            handles.push(tokio::spawn(activity_loop(
                self.engine.clone(),
                self.invoker.clone(),
                queue.clone(),
                self.config.worker_id.clone(),
                self.activity_slots.clone(),
                self.config.poll_timeout,
                shutdown.clone(),
            )));
        }
        if self.config.run_timers {
            let engine = self.engine.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { engine.run_timer_loop(token).await }));
        }
        drop(handles);

        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Stop polling and drain
    ///
    /// Poll loops stop after their current poll; tasks already running are
    /// given until the shutdown timeout to finish.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "worker pool draining");
        self.shutdown.lock().cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        let loops = tokio::time::timeout_at(deadline, futures::future::join_all(handles)).await;
        let drained = tokio::time::timeout_at(deadline, async {
            let _executions = self
                .workflow_slots
                .acquire_many(self.config.max_concurrent_executions as u32)
                .await;
            let _activities = self
                .activity_slots
                .acquire_many(self.config.max_concurrent_activities as u32)
                .await;
        })
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;

        if loops.is_err() || drained.is_err() {
            warn!(remaining_tasks = self.active_tasks(), "drain timed out with tasks still running");
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Tasks currently executing
    pub fn active_tasks(&self) -> usize {
        (self.config.max_concurrent_executions - self.workflow_slots.available_permits())
            + (self.config.max_concurrent_activities - self.activity_slots.available_permits())
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn engine(&self) -> &Arc<Engine<S>> {
        &self.engine
    }
}

async fn workflow_loop<S: EventLogStore>(
    engine: Arc<Engine<S>>,
    queue: String,
    slots: Arc<Semaphore>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
) {
    debug!(%queue, "workflow poll loop started");
    while !shutdown.is_cancelled() {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // not raced against shutdown: a task handed to this poll must run
        let Some(task) = engine.poll_workflow_task(&queue, poll_timeout).await else {
            continue;
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.run_workflow_task(&task).await {
                warn!(task_id = %task.id, execution_id = %task.execution_id, error = %err, "workflow task failed");
            }
            drop(permit);
        });
    }
    debug!(%queue, "workflow poll loop exited");
}

#[allow(clippy::too_many_arguments)]
async fn activity_loop<S: EventLogStore>(
    engine: Arc<Engine<S>>,
    invoker: ActivityInvoker,
    queue: String,
    worker_id: String,
    slots: Arc<Semaphore>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
) {
    debug!(%queue, "activity poll loop started");
    while !shutdown.is_cancelled() {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(task) = engine
            .poll_activity_task_for(&queue, poll_timeout, &worker_id)
            .await
        else {
            continue;
        };

        let engine = engine.clone();
        let invoker = invoker.clone();
        tokio::spawn(async move {
            let cancel = engine.cancellation_token(&task);
            let outcome = invoker.invoke(&task, cancel, engine.as_ref()).await;
            match engine
                .complete_task(task.id, TaskOutcome::Activity(outcome))
                .await
            {
                Ok(()) => {}
                Err(EngineError::TaskNotFound(_)) => {
                    debug!(task_id = %task.id, "attempt was retired before its outcome arrived");
                }
                Err(err) => {
                    warn!(task_id = %task.id, execution_id = %task.execution_id, error = %err, "failed to record activity outcome");
                }
            }
            drop(permit);
        });
    }
    debug!(%queue, "activity poll loop exited");
}
