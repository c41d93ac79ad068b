//! Activity timeout tiers
//!
//! Four deadlines apply to an activity, each measured from a different
//! starting point:
//!
//! ```text
//!  scheduled ──────── started ─────── heartbeat ─ ─ ─ heartbeat ──── closed
//!     │ schedule_to_start │                 │  heartbeat   │
//!     │                   │◄────────── start_to_close ──────────────►│
//!     │◄───────────────────────── schedule_to_close ────────────────►│
//! ```
//!
//! `schedule_to_start`, `start_to_close` and `heartbeat` apply to a single
//! attempt; `schedule_to_close` covers the activity across all attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::retry::{duration_millis, option_duration_millis};
use crate::clock;

/// Which deadline was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Attempt waited too long in the queue
    ScheduleToStart,
    /// Attempt ran too long once claimed
    StartToClose,
    /// Activity as a whole ran past its overall deadline
    ScheduleToClose,
    /// No heartbeat received in time
    Heartbeat,
}

impl TimeoutType {
    /// Whether this timeout ends the activity regardless of retry policy
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ScheduleToClose)
    }
}

impl std::fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScheduleToStart => write!(f, "schedule_to_start"),
            Self::StartToClose => write!(f, "start_to_close"),
            Self::ScheduleToClose => write!(f, "schedule_to_close"),
            Self::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Timeout configuration for activities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum queue wait per attempt (None = unbounded)
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_start: Option<Duration>,

    /// Maximum run time per attempt
    #[serde(with = "duration_millis")]
    pub start_to_close: Duration,

    /// Overall deadline across all attempts (None = unbounded)
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_close: Option<Duration>,

    /// Maximum time between heartbeats (None = no heartbeat required)
    #[serde(default, with = "option_duration_millis")]
    pub heartbeat: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            schedule_to_start: None,
            start_to_close: Duration::from_secs(300), // 5 minutes to complete
            schedule_to_close: None,
            heartbeat: None,
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set schedule-to-start timeout
    pub fn with_schedule_to_start(mut self, timeout: Duration) -> Self {
        self.schedule_to_start = Some(timeout);
        self
    }

    /// Set start-to-close timeout
    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = timeout;
        self
    }

    /// Set schedule-to-close timeout
    pub fn with_schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close = Some(timeout);
        self
    }

    /// Set heartbeat timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat = Some(timeout);
        self
    }

    /// How long a claimed attempt may stay silent before the worker is presumed dead
    pub fn liveness_window(&self) -> Duration {
        match self.heartbeat {
            Some(heartbeat) => heartbeat.min(self.start_to_close),
            None => self.start_to_close,
        }
    }
}

/// Timing of one activity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTiming {
    /// When the activity was first scheduled
    pub scheduled_at: DateTime<Utc>,
    /// When this attempt was made visible in the queue
    pub attempt_queued_at: DateTime<Utc>,
    /// When this attempt was claimed by a worker
    pub started_at: Option<DateTime<Utc>>,
    /// Last heartbeat for this attempt
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl AttemptTiming {
    /// Timing for an attempt that was just queued
    pub fn queued(scheduled_at: DateTime<Utc>, attempt_queued_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            attempt_queued_at,
            started_at: None,
            last_heartbeat_at: None,
        }
    }

    /// Find the first deadline exceeded at `now`
    ///
    /// The overall deadline is checked first since it ends the activity
    /// outright.
    pub fn check(&self, config: &TimeoutConfig, now: DateTime<Utc>) -> Option<TimeoutType> {
        if let Some(limit) = config.schedule_to_close {
            if elapsed(self.scheduled_at, now) > limit {
                return Some(TimeoutType::ScheduleToClose);
            }
        }

        let Some(started_at) = self.started_at else {
            return match config.schedule_to_start {
                Some(limit) if elapsed(self.attempt_queued_at, now) > limit => {
                    Some(TimeoutType::ScheduleToStart)
                }
                _ => None,
            };
        };

        if elapsed(started_at, now) > config.start_to_close {
            return Some(TimeoutType::StartToClose);
        }

        if let Some(limit) = config.heartbeat {
            let last_seen = self.last_heartbeat_at.unwrap_or(started_at);
            if elapsed(last_seen, now) > limit {
                return Some(TimeoutType::Heartbeat);
            }
        }

        None
    }

    /// Overall deadline, if one is configured
    pub fn schedule_to_close_deadline(&self, config: &TimeoutConfig) -> Option<DateTime<Utc>> {
        config
            .schedule_to_close
            .map(|limit| clock::add(self.scheduled_at, limit))
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    clock::until(since, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_default_config() {
        let config = TimeoutConfig::default();
        assert_eq!(config.start_to_close, secs(300));
        assert!(config.heartbeat.is_none());
        assert_eq!(config.liveness_window(), secs(300));
    }

    #[test]
    fn test_schedule_to_start_only_before_claim() {
        let config = TimeoutConfig::new().with_schedule_to_start(secs(10));
        let t0 = Utc::now();
        let mut timing = AttemptTiming::queued(t0, t0);

        assert_eq!(timing.check(&config, clock::add(t0, secs(5))), None);
        assert_eq!(
            timing.check(&config, clock::add(t0, secs(11))),
            Some(TimeoutType::ScheduleToStart)
        );

        timing.started_at = Some(clock::add(t0, secs(9)));
        assert_eq!(timing.check(&config, clock::add(t0, secs(11))), None);
    }

    #[test]
    fn test_start_to_close_and_heartbeat() {
        let config = TimeoutConfig::new()
            .with_start_to_close(secs(60))
            .with_heartbeat(secs(5));
        let t0 = Utc::now();
        let mut timing = AttemptTiming::queued(t0, t0);
        timing.started_at = Some(t0);

        assert_eq!(
            timing.check(&config, clock::add(t0, secs(6))),
            Some(TimeoutType::Heartbeat)
        );

        timing.last_heartbeat_at = Some(clock::add(t0, secs(58)));
        assert_eq!(timing.check(&config, clock::add(t0, secs(59))), None);
        assert_eq!(
            timing.check(&config, clock::add(t0, secs(61))),
            Some(TimeoutType::StartToClose)
        );
    }

    #[test]
    fn test_schedule_to_close_takes_precedence() {
        let config = TimeoutConfig::new()
            .with_start_to_close(secs(60))
            .with_schedule_to_close(secs(30));
        let t0 = Utc::now();
        let mut timing = AttemptTiming::queued(t0, clock::add(t0, secs(20)));
        timing.started_at = Some(clock::add(t0, secs(20)));

        assert_eq!(
            timing.check(&config, clock::add(t0, secs(31))),
            Some(TimeoutType::ScheduleToClose)
        );
        assert_eq!(
            timing.schedule_to_close_deadline(&config),
            Some(clock::add(t0, secs(30)))
        );
    }

    #[test]
    fn test_config_stores_millis() {
        let config = TimeoutConfig::new()
            .with_schedule_to_start(Duration::from_millis(1500))
            .with_start_to_close(secs(60));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["schedule_to_start"], 1500);
        assert_eq!(value["start_to_close"], 60_000);
        assert!(value["heartbeat"].is_null());

        let parsed: TimeoutConfig =
            serde_json::from_value(serde_json::json!({ "start_to_close": 2000 })).unwrap();
        assert_eq!(parsed.start_to_close, secs(2));
        assert_eq!(parsed.schedule_to_close, None);
    }

    #[test]
    fn test_timeout_type_serialization() {
        let json = serde_json::to_string(&TimeoutType::ScheduleToClose).unwrap();
        assert_eq!(json, "\"schedule_to_close\"");
        assert!(TimeoutType::ScheduleToClose.is_terminal());
        assert!(!TimeoutType::Heartbeat.is_terminal());
    }
}
