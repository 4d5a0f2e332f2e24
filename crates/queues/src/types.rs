//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mfgmon_core::{CoreError, JobId, JobName};

/// The primary queues a producer can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// General operations; escalates to the fallback queue on failure.
    Operations,
    /// Record persistence jobs; no fallback, errors propagate.
    Database,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Operations => "operations",
            QueueKind::Database => "database",
        }
    }
}

impl Default for QueueKind {
    fn default() -> Self {
        Self::Operations
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operations" => Ok(Self::Operations),
            "database" => Ok(Self::Database),
            other => Err(CoreError::validation(format!("unknown queue: {other}"))),
        }
    }
}

/// Job state as seen by the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Currently being executed
    Active,
    /// Failed, scheduled for another execution attempt
    Delayed { error: String, attempt: u32 },
    /// Completed successfully
    Completed,
    /// Exhausted execution retries
    Failed { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
///
/// The same policy bounds submission retries in the primary queue and is
/// handed to the backend for execution retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first try (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so concurrent retries do not line up exactly.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Clamp the retry count and every delay.
    pub fn capped(mut self, max_attempts: u32, max_delay: Duration) -> Self {
        self.max_attempts = self.max_attempts.min(max_attempts);
        self.base_delay = self.base_delay.min(max_delay);
        self.max_delay = self.max_delay.min(max_delay);
        self
    }

    /// Whether another retry is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_attempts
    }
}

/// Backoff override supplied with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    pub delay_ms: u64,
}

/// Per-submission overrides of the queue's default retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Retries after the first try.
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl SubmitOptions {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, delay: Duration) -> Self {
        self.backoff = Some(Backoff {
            strategy,
            delay_ms: delay.as_millis() as u64,
        });
        self
    }

    /// Apply the overrides on top of a queue default.
    pub fn resolve(&self, default: &RetryPolicy) -> RetryPolicy {
        let mut policy = default.clone();
        if let Some(attempts) = self.attempts {
            policy.max_attempts = attempts;
        }
        if let Some(backoff) = self.backoff {
            policy.strategy = backoff.strategy;
            policy.base_delay = Duration::from_millis(backoff.delay_ms);
            policy.max_delay = policy.max_delay.max(policy.base_delay);
        }
        policy
    }
}

/// What the primary queue hands to an execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub queue: QueueKind,
    pub name: JobName,
    pub payload: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub submitted_at: DateTime<Utc>,
}

/// A job held by an execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueKind,
    pub name: JobName,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Execution attempts so far (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time of the next execution attempt (delayed jobs)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Error messages from failed execution attempts
    pub errors: Vec<String>,
}

impl Job {
    /// Materialize a request under the identifier the backend assigned.
    pub fn from_request(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            queue: request.queue,
            name: request.name,
            payload: request.payload,
            status: JobStatus::Waiting,
            retry_policy: request.retry_policy,
            attempt: 0,
            created_at: request.submitted_at,
            updated_at: Utc::now(),
            scheduled_at: None,
            errors: Vec::new(),
        }
    }

    /// Check if the job is ready to execute.
    pub fn is_ready(&self) -> bool {
        self.status.is_claimable()
            && match self.scheduled_at {
                Some(at) => Utc::now() >= at,
                None => true,
            }
    }

    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.scheduled_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed execution; schedules a retry while the policy allows one.
    pub fn mark_failed(&mut self, error: String) {
        self.mark_failed_with_delay(error, None);
    }

    pub fn mark_failed_with_delay(&mut self, error: String, delay: Option<Duration>) {
        let now = Utc::now();
        self.updated_at = now;
        self.errors.push(error.clone());

        // `attempt` counts the first try, retries are everything after it.
        let retries_so_far = self.attempt.saturating_sub(1);
        if self.retry_policy.should_retry(retries_so_far) {
            let delay = delay.unwrap_or_else(|| self.retry_policy.delay_for_attempt(self.attempt));
            self.scheduled_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Delayed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::Failed {
                error,
                attempts: self.attempt,
            };
        }
    }
}

/// A job parked in the durable fallback store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackJob {
    pub id: JobId,
    pub name: JobName,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Failed re-submission passes so far
    pub attempts: u32,
}

impl FallbackJob {
    pub fn new(name: JobName, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::fallback(),
            name,
            payload,
            created_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Queue depth snapshot.
///
/// `error` is set when the backend could not be asked; the counts are then zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl QueueCounts {
    pub fn errored() -> Self {
        Self {
            error: true,
            ..Default::default()
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(policy: RetryPolicy) -> JobRequest {
        JobRequest {
            queue: QueueKind::Operations,
            name: JobName::new("createCustomer").unwrap(),
            payload: serde_json::json!({"email": "a@b.com"}),
            retry_policy: policy,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(2000));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
    }

    #[test]
    fn should_retry_counts_retries_after_first_try() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn submit_options_override_defaults() {
        let default = RetryPolicy::fixed(2, Duration::from_millis(2000));

        assert_eq!(SubmitOptions::default().resolve(&default), default);

        let resolved = SubmitOptions::attempts(3)
            .with_backoff(BackoffStrategy::Exponential, Duration::from_millis(500))
            .resolve(&default);
        assert_eq!(resolved.max_attempts, 3);
        assert_eq!(resolved.strategy, BackoffStrategy::Exponential);
        assert_eq!(resolved.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(resolved.delay_for_attempt(2), Duration::from_millis(1000));
    }

    #[test]
    fn submit_options_deserialize_from_json() {
        let opts: SubmitOptions =
            serde_json::from_str(r#"{"attempts": 3, "backoff": {"type": "fixed", "delay_ms": 250}}"#)
                .unwrap();
        assert_eq!(opts.attempts, Some(3));
        assert_eq!(opts.backoff.unwrap().strategy, BackoffStrategy::Fixed);
    }

    #[test]
    fn job_execution_lifecycle() {
        let mut job = Job::from_request(JobId::primary(), request(RetryPolicy::fixed(1, Duration::ZERO)));
        assert!(job.is_ready());

        job.mark_active();
        assert_eq!(job.attempt, 1);
        assert!(!job.is_ready());

        job.mark_failed("broker hiccup".into());
        assert!(matches!(job.status, JobStatus::Delayed { attempt: 1, .. }));
        assert!(job.is_ready());

        job.mark_active();
        job.mark_failed("broker hiccup again".into());
        assert!(matches!(job.status, JobStatus::Failed { attempts: 2, .. }));
        assert_eq!(job.errors.len(), 2);
        assert!(!job.is_ready());
    }

    #[test]
    fn fallback_job_starts_with_zero_attempts() {
        let job = FallbackJob::new(JobName::new("createCustomer").unwrap(), serde_json::json!({}));
        assert_eq!(job.attempts, 0);
        assert!(job.id.is_fallback());
    }

    #[test]
    fn errored_counts_serialize_the_flag() {
        let json = serde_json::to_value(QueueCounts::errored()).unwrap();
        assert_eq!(json["error"], true);
        let json = serde_json::to_value(QueueCounts::default()).unwrap();
        assert!(json.get("error").is_none());
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(
            attempt in 1u32..64,
            base_ms in 0u64..5_000,
            cap_ms in 0u64..120_000,
            linear in any::<bool>(),
        ) {
            let mut policy = RetryPolicy::exponential(
                10,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            if linear {
                policy.strategy = BackoffStrategy::Linear;
            }
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(cap_ms));
        }
    }
}
