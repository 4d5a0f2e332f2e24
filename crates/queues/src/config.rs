//! Queue configuration and its environment-variable loader.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::types::{RetryPolicy, SubmitOptions};

pub const DEFAULT_FALLBACK_PATH: &str = "temp/fallback-queue.json";
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FALLBACK_ATTEMPTS: u32 = 5;
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SUBMIT_DEADLINE: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Fallback queue settings.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// How often the background drain pass runs
    pub drain_interval: Duration,
    /// Failed passes after which a job is dropped for good
    pub max_attempts: u32,
    /// Bound on a single store read or write
    pub store_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            max_attempts: DEFAULT_MAX_FALLBACK_ATTEMPTS,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Primary queue settings.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Policy used when a submission carries no overrides
    pub default_policy: RetryPolicy,
    /// Bound on a single backend call
    pub submit_timeout: Duration,
    /// Bound on a whole submission, retries and backoff included
    pub submit_deadline: Duration,
    /// Upper limit for a per-call `attempts` override
    pub max_retries: u32,
    /// Upper limit for any backoff delay, overrides included
    pub max_backoff: Duration,
}

impl PrimaryConfig {
    /// Operations queue: 2 retries, fixed 2s backoff.
    pub fn operations() -> Self {
        Self {
            default_policy: RetryPolicy::fixed(2, Duration::from_millis(2000)),
            ..Self::limits()
        }
    }

    /// Database queue: 3 retries, exponential backoff from 1s.
    pub fn database() -> Self {
        Self {
            default_policy: RetryPolicy::exponential(
                3,
                Duration::from_millis(1000),
                Duration::from_secs(30),
            ),
            ..Self::limits()
        }
    }

    fn limits() -> Self {
        Self {
            default_policy: RetryPolicy::no_retry(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            submit_deadline: DEFAULT_SUBMIT_DEADLINE,
            max_retries: DEFAULT_MAX_RETRIES,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Queue default with the caller's overrides applied, clamped to the limits.
    pub fn resolve_policy(&self, options: &SubmitOptions) -> RetryPolicy {
        options
            .resolve(&self.default_policy)
            .capped(self.max_retries.max(self.default_policy.max_attempts), self.max_backoff)
    }

    pub fn with_submit_deadline(mut self, deadline: Duration) -> Self {
        self.submit_deadline = deadline;
        self
    }

    pub fn with_limits(mut self, max_retries: u32, max_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}

/// Whole queue subsystem configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub fallback_path: PathBuf,
    pub fallback: FallbackConfig,
    pub operations: PrimaryConfig,
    pub database: PrimaryConfig,
    /// Selects the Redis backend when set (requires the `redis` feature)
    pub redis_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fallback_path: PathBuf::from(DEFAULT_FALLBACK_PATH),
            fallback: FallbackConfig::default(),
            operations: PrimaryConfig::operations(),
            database: PrimaryConfig::database(),
            redis_url: None,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(path) = lookup("FALLBACK_QUEUE_PATH").filter(|p| !p.trim().is_empty()) {
            cfg.fallback_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FALLBACK_DRAIN_INTERVAL_MS").filter(|ms| *ms > 0) {
            cfg.fallback.drain_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "FALLBACK_MAX_ATTEMPTS").filter(|n| *n > 0) {
            cfg.fallback.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QUEUE_STORE_TIMEOUT_MS").filter(|ms| *ms > 0) {
            cfg.fallback.store_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QUEUE_SUBMIT_TIMEOUT_MS").filter(|ms| *ms > 0) {
            cfg.operations.submit_timeout = Duration::from_millis(ms);
            cfg.database.submit_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "QUEUE_SUBMIT_DEADLINE_MS").filter(|ms| *ms > 0) {
            cfg.operations.submit_deadline = Duration::from_millis(ms);
            cfg.database.submit_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "QUEUE_MAX_RETRIES") {
            cfg.operations.max_retries = n;
            cfg.database.max_retries = n;
        }
        cfg.redis_url = lookup("REDIS_URL").filter(|u| !u.trim().is_empty());

        cfg
    }

    pub fn with_fallback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_path = path.into();
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.fallback.drain_interval = interval;
        self
    }

    pub fn with_max_fallback_attempts(mut self, attempts: u32) -> Self {
        self.fallback.max_attempts = attempts;
        self
    }

    pub fn with_operations(mut self, operations: PrimaryConfig) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_database(mut self, database: PrimaryConfig) -> Self {
        self.database = database;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.fallback.drain_interval, Duration::from_secs(30));
        assert_eq!(cfg.fallback.max_attempts, 5);
        assert_eq!(cfg.operations.default_policy.max_attempts, 2);
        assert_eq!(cfg.database.default_policy.max_attempts, 3);
        assert_eq!(cfg.operations.submit_deadline, Duration::from_secs(60));
        assert_eq!(cfg.operations.max_retries, 10);
        assert_eq!(cfg.fallback_path, PathBuf::from("temp/fallback-queue.json"));
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = QueueConfig::from_lookup(lookup(&[
            ("FALLBACK_QUEUE_PATH", "/var/lib/mfgmon/fallback.json"),
            ("FALLBACK_DRAIN_INTERVAL_MS", "1500"),
            ("FALLBACK_MAX_ATTEMPTS", "8"),
            ("QUEUE_SUBMIT_TIMEOUT_MS", "250"),
            ("QUEUE_SUBMIT_DEADLINE_MS", "4000"),
            ("QUEUE_MAX_RETRIES", "4"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]));

        assert_eq!(cfg.fallback_path, PathBuf::from("/var/lib/mfgmon/fallback.json"));
        assert_eq!(cfg.fallback.drain_interval, Duration::from_millis(1500));
        assert_eq!(cfg.fallback.max_attempts, 8);
        assert_eq!(cfg.operations.submit_timeout, Duration::from_millis(250));
        assert_eq!(cfg.database.submit_timeout, Duration::from_millis(250));
        assert_eq!(cfg.database.submit_deadline, Duration::from_millis(4000));
        assert_eq!(cfg.operations.max_retries, 4);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn overrides_are_clamped_to_the_queue_limits() {
        let cfg = PrimaryConfig::operations();
        let huge = SubmitOptions::attempts(u32::MAX)
            .with_backoff(crate::types::BackoffStrategy::Fixed, Duration::from_secs(3600));

        let policy = cfg.resolve_policy(&huge);
        assert_eq!(policy.max_attempts, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.delay_for_attempt(1), DEFAULT_MAX_BACKOFF);

        let modest = SubmitOptions::attempts(3);
        assert_eq!(cfg.resolve_policy(&modest).max_attempts, 3);
        assert_eq!(cfg.resolve_policy(&SubmitOptions::default()), cfg.default_policy);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = QueueConfig::from_lookup(lookup(&[
            ("FALLBACK_DRAIN_INTERVAL_MS", "soon"),
            ("FALLBACK_MAX_ATTEMPTS", "0"),
        ]));

        assert_eq!(cfg.fallback.drain_interval, DEFAULT_DRAIN_INTERVAL);
        assert_eq!(cfg.fallback.max_attempts, DEFAULT_MAX_FALLBACK_ATTEMPTS);
    }
}
