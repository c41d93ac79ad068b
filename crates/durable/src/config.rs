//! Engine configuration
//!
//! Every setting has a default and can be overridden from `KEEL_*`
//! environment variables. Values that fail to parse fall back to the
//! default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::{duration_millis, RetryPolicy};

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Queue used when a start request names none
    pub default_task_queue: String,

    /// Identity recorded in `ActivityStarted` when the poller gives none
    pub identity: String,

    /// Lease of a workflow task; an unacknowledged task is redelivered after this
    #[serde(with = "duration_millis")]
    pub workflow_task_timeout: Duration,

    /// Extra lease granted to activity tasks beyond their start-to-close timeout
    #[serde(with = "duration_millis")]
    pub activity_lease_grace: Duration,

    /// Replays attempted when a workflow task loses the append race
    pub max_conflict_retries: u32,

    /// A run whose history grows past this is failed
    pub max_events_per_run: usize,

    /// Executions kept loaded for queries
    pub max_cached_executions: usize,

    /// How long closed runs are kept before purging
    #[serde(with = "duration_millis")]
    pub retention: Duration,

    /// Upper bound on the wait between timer checks
    #[serde(with = "duration_millis")]
    pub timer_tick: Duration,

    /// Interval between activity timeout sweeps
    #[serde(with = "duration_millis")]
    pub timeout_sweep_interval: Duration,

    /// Retry policy for failed workflow tasks
    pub workflow_task_retry: RetryPolicy,

    /// Buffer of the lifecycle notification channel
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_queue: "default".to_string(),
            identity: "keel-engine".to_string(),
            workflow_task_timeout: Duration::from_secs(10),
            activity_lease_grace: Duration::from_secs(5),
            max_conflict_retries: 8,
            max_events_per_run: 10_000,
            max_cached_executions: 1_000,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            timer_tick: Duration::from_millis(100),
            timeout_sweep_interval: Duration::from_secs(1),
            workflow_task_retry: RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_max_interval(Duration::from_secs(10)),
            notification_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `KEEL_TASK_QUEUE` | `default_task_queue` |
    /// | `KEEL_IDENTITY` | `identity` |
    /// | `KEEL_WORKFLOW_TASK_TIMEOUT_MS` | `workflow_task_timeout` |
    /// | `KEEL_ACTIVITY_LEASE_GRACE_MS` | `activity_lease_grace` |
    /// | `KEEL_MAX_CONFLICT_RETRIES` | `max_conflict_retries` |
    /// | `KEEL_MAX_EVENTS_PER_RUN` | `max_events_per_run` |
    /// | `KEEL_MAX_CACHED_EXECUTIONS` | `max_cached_executions` |
    /// | `KEEL_RETENTION_SECS` | `retention` |
    /// | `KEEL_TIMER_TICK_MS` | `timer_tick` |
    /// | `KEEL_TIMEOUT_SWEEP_MS` | `timeout_sweep_interval` |
    /// | `KEEL_WORKFLOW_TASK_MAX_ATTEMPTS` | `workflow_task_retry.max_attempts` |
    /// | `KEEL_NOTIFICATION_CAPACITY` | `notification_capacity` |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_task_queue: std::env::var("KEEL_TASK_QUEUE")
                .unwrap_or(defaults.default_task_queue),
            identity: std::env::var("KEEL_IDENTITY").unwrap_or(defaults.identity),
            workflow_task_timeout: env_millis("KEEL_WORKFLOW_TASK_TIMEOUT_MS")
                .unwrap_or(defaults.workflow_task_timeout),
            activity_lease_grace: env_millis("KEEL_ACTIVITY_LEASE_GRACE_MS")
                .unwrap_or(defaults.activity_lease_grace),
            max_conflict_retries: env_parse("KEEL_MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
            max_events_per_run: env_parse("KEEL_MAX_EVENTS_PER_RUN")
                .unwrap_or(defaults.max_events_per_run),
            max_cached_executions: env_parse("KEEL_MAX_CACHED_EXECUTIONS")
                .unwrap_or(defaults.max_cached_executions),
            retention: env_parse("KEEL_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            timer_tick: env_millis("KEEL_TIMER_TICK_MS").unwrap_or(defaults.timer_tick),
            timeout_sweep_interval: env_millis("KEEL_TIMEOUT_SWEEP_MS")
                .unwrap_or(defaults.timeout_sweep_interval),
            workflow_task_retry: match env_parse("KEEL_WORKFLOW_TASK_MAX_ATTEMPTS") {
                Some(max) => defaults.workflow_task_retry.with_max_attempts(max),
                None => defaults.workflow_task_retry,
            },
            notification_capacity: env_parse("KEEL_NOTIFICATION_CAPACITY")
                .unwrap_or(defaults.notification_capacity),
        }
    }

    /// Set the default task queue
    pub fn with_default_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_task_queue = queue.into();
        self
    }

    /// Set the workflow task lease
    pub fn with_workflow_task_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_task_timeout = timeout;
        self
    }

    /// Set the conflict retry budget
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set the history size limit
    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }

    /// Set the loaded-execution cache size
    pub fn with_max_cached_executions(mut self, max: usize) -> Self {
        self.max_cached_executions = max;
        self
    }

    /// Set the retention window for closed runs
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the timer tick
    pub fn with_timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick;
        self
    }

    /// Set the workflow task retry policy
    pub fn with_workflow_task_retry(mut self, policy: RetryPolicy) -> Self {
        self.workflow_task_retry = policy;
        self
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

pub(crate) fn env_millis(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_millis)
}
