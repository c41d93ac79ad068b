//! Backoff between attempts
//!
//! The policy is the single authority on whether a failed attempt is
//! retried and how long to wait first. [`RetryPolicy::next_delay`] is pure;
//! jitter is only ever applied through [`RetryPolicy::jittered`] with a seed
//! derived from the execution, so the same history always yields the same
//! delay.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How often, and how far apart, a failing activity or workflow task is retried
///
/// # Example
///
/// ```
/// use keel_durable::{RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// assert_eq!(policy.next_delay(2, None), RetryDecision::Retry(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(4, None), RetryDecision::GiveUp);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first one (0 = unlimited)
    pub max_attempts: u32,

    /// Base delay
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between attempts
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per attempt; 1.0 keeps the interval flat
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0), applied only with a recorded seed
    ///
    /// A value of 0.1 means ±10% around the computed delay.
    #[serde(default)]
    pub jitter: f64,

    /// Error types that are never retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

/// Outcome of a retry evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the attempt after waiting this long
    Retry(Duration),

    /// Stop retrying; the last failure is final
    GiveUp,
}

impl RetryDecision {
    /// Whether the policy gave up
    pub fn is_give_up(&self) -> bool {
        matches!(self, Self::GiveUp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Doubling backoff: 5 attempts, 1s first delay, capped at 60s, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Same delay before every retry
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// 0 means retry forever
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Values below 1.0 are raised to 1.0
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Clamped to `0.0..=1.0`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Never retry failures classified as `error_type`
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Decide whether attempt number `attempt` (1-based) may be made
    ///
    /// `delay = min(initial * coefficient^(attempt - 1), max_interval)`.
    /// Gives up when `attempt > max_attempts` (bounded policies) or when
    /// `error_type` is listed as non-retryable.
    pub fn next_delay(&self, attempt: u32, error_type: Option<&str>) -> RetryDecision {
        if !self.should_retry(error_type) {
            return RetryDecision::GiveUp;
        }
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        RetryDecision::Retry(Duration::try_from_secs_f64(capped).unwrap_or(self.max_interval))
    }

    /// Apply seeded jitter to a delay
    ///
    /// The same `(delay, seed)` always produces the same result. The result
    /// never exceeds `max_interval`.
    pub fn jittered(&self, delay: Duration, seed: u64) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let range = delay.as_secs_f64() * self.jitter;
        let offset = rng.gen_range(-range..=range);
        let jittered = (delay.as_secs_f64() + offset)
            .max(0.0)
            .min(self.max_interval.as_secs_f64());

        Duration::try_from_secs_f64(jittered).unwrap_or(delay)
    }

    /// False for error types listed as non-retryable
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|t| t == error_type),
            None => true,
        }
    }

    /// Whether another attempt may follow `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.max_attempts == 0 || current_attempt < self.max_attempts
    }
}

/// `Duration` as integer milliseconds on the wire
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `Option<Duration>` as nullable milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> RetryDecision {
        RetryDecision::Retry(Duration::from_secs(n))
    }

    #[test]
    fn test_doubling_schedule() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);
        let delays: Vec<_> = (1..=4).map(|n| policy.next_delay(n, None)).collect();
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(8)]);
    }

    #[test]
    fn test_exhausted_attempts_give_up() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        assert_eq!(policy.next_delay(3, None), secs(4));
        assert!(policy.next_delay(4, None).is_give_up());
        assert!(!policy.has_attempts_remaining(3));

        let once = RetryPolicy::no_retry();
        assert!(!once.has_attempts_remaining(1));
        assert!(once.next_delay(2, None).is_give_up());
    }

    #[test]
    fn test_flat_interval() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 2);
        assert_eq!(
            policy.next_delay(2, None),
            RetryDecision::Retry(Duration::from_millis(250))
        );
        assert!(policy.next_delay(3, None).is_give_up());
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(0)
            .with_max_interval(Duration::from_secs(10));

        assert_eq!(policy.next_delay(5, None), secs(10));
        assert_eq!(policy.next_delay(u32::MAX, None), secs(10));
        assert!(policy.has_attempts_remaining(1_000_000));
    }

    #[test]
    fn test_listed_error_types_are_final() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("CardDeclined")
            .with_backoff_coefficient(0.5);

        assert_eq!(policy.backoff_coefficient, 1.0);
        assert!(policy.next_delay(2, Some("CardDeclined")).is_give_up());
        assert_eq!(policy.next_delay(2, Some("GatewayTimeout")), secs(1));
        assert_eq!(policy.next_delay(2, None), secs(1));
    }

    #[test]
    fn test_seeded_jitter() {
        let policy = RetryPolicy::exponential().with_jitter(0.2);
        let delay = Duration::from_secs(10);

        let first = policy.jittered(delay, 42);
        assert_eq!(first, policy.jittered(delay, 42));
        assert!(first >= Duration::from_secs(8) && first <= Duration::from_secs(12));

        let capped = RetryPolicy::exponential()
            .with_jitter(1.0)
            .with_max_interval(Duration::from_secs(10));
        assert!(capped.jittered(delay, 7) <= Duration::from_secs(10));
        assert_eq!(RetryPolicy::exponential().jittered(delay, 7), delay);
    }

    #[test]
    fn test_wire_format_uses_millis() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 4).with_non_retryable_error("Fatal");

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 2000);
        assert_eq!(json["max_attempts"], 4);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);

        // jitter and the error list may be omitted
        let minimal: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 1,
            "initial_interval": 0,
            "max_interval": 0,
            "backoff_coefficient": 1.0,
        }))
        .unwrap();
        assert_eq!(minimal, RetryPolicy::no_retry());
    }
}
