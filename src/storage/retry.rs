//! Bounded exponential backoff with pluggable veto conditions.
//!
//! A [`RetryPolicy`] wraps a fallible operation and re-invokes it on failure
//! up to a configured number of retries. Between attempts it sleeps for
//! `initial_backoff * multiplier^attempt`, clamped to a maximum, optionally
//! scaled by a random jitter factor in `[0.5, 1.5)`.
//!
//! Retry decisions are driven by the *kind* of failure, not its exact value:
//! each error is classified into a [`FailureKind`] and passed to every
//! registered condition. Conditions are vetoes: if any condition returns
//! `true` for a failure, retrying stops immediately and the failure is
//! returned as-is.

use crate::{Error, Result};
use rand::RngExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Retry configuration for storage operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
    /// Upper bound on a single backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Whether to apply random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Loads retry configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CROSSTORE_RETRY_MAX_RETRIES")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.max_retries = parsed;
        }
        if let Ok(v) = std::env::var("CROSSTORE_RETRY_INITIAL_BACKOFF_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.initial_backoff_ms = parsed;
        }
        if let Ok(v) = std::env::var("CROSSTORE_RETRY_MULTIPLIER")
            && let Ok(parsed) = v.parse::<f64>()
            && parsed >= 1.0
        {
            self.multiplier = parsed;
        }
        if let Ok(v) = std::env::var("CROSSTORE_RETRY_MAX_BACKOFF_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.max_backoff_ms = parsed;
        }
        if let Ok(v) = std::env::var("CROSSTORE_RETRY_JITTER")
            && let Ok(parsed) = v.parse::<bool>()
        {
            self.jitter = parsed;
        }
        self
    }

    /// Sets the maximum retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial backoff in milliseconds.
    #[must_use]
    pub const fn with_initial_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.initial_backoff_ms = backoff_ms;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the maximum backoff in milliseconds.
    #[must_use]
    pub const fn with_max_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.max_backoff_ms = backoff_ms;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the backoff delay for a zero-based attempt index, before
    /// jitter.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let raw = (self.initial_backoff_ms as f64)
            * self.multiplier.max(1.0).powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss)]
        let clamped = raw.min(self.max_backoff_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = clamped as u64;
        Duration::from_millis(millis)
    }
}

/// Coarse classification of a failure, used for retry decisions.
///
/// Conditions see the kind instead of the error value, so a policy built for
/// one backend keeps working when another backend produces differently
/// worded failures of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed or unusable input. Never worth retrying.
    InvalidInput,
    /// A backend operation failed; typically transient.
    Operation,
    /// The target's circuit is open.
    CircuitOpen,
    /// A version conflict was detected.
    Conflict,
    /// All candidate stores failed a read.
    Retrieval,
    /// One or more stores failed a write.
    Storage,
    /// A transaction failed during prepare or commit.
    Transaction,
}

impl FailureKind {
    /// Classifies an error.
    #[must_use]
    pub const fn of(error: &Error) -> Self {
        match error {
            Error::InvalidInput(_) => Self::InvalidInput,
            Error::OperationFailed { .. } => Self::Operation,
            Error::CircuitOpen { .. } => Self::CircuitOpen,
            Error::Conflict { .. } => Self::Conflict,
            Error::Retrieval { .. } => Self::Retrieval,
            Error::Storage { .. } => Self::Storage,
            Error::TransactionPrepare { .. } | Error::TransactionCommit { .. } => {
                Self::Transaction
            },
        }
    }
}

/// A named veto predicate over `(failure kind, zero-based attempt)`.
pub type RetryCondition = Arc<dyn Fn(FailureKind, u32) -> bool + Send + Sync>;

/// Ordered set of named veto conditions.
///
/// Every condition is consulted on every failure; the first one returning
/// `true` names the veto in metrics and logs, and the ones that declined
/// are counted as suppressed.
#[derive(Clone, Default)]
pub struct RetryConditions {
    conditions: Vec<(String, RetryCondition)>,
}

impl RetryConditions {
    /// No conditions: every failure is retried until attempts run out.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// The standard condition set: vetoes retries for invalid input, open
    /// circuits, and version conflicts, none of which resolve by waiting.
    #[must_use]
    pub fn standard() -> Self {
        Self::none()
            .with_condition("invalid_input", Arc::new(|kind, _| {
                kind == FailureKind::InvalidInput
            }))
            .with_condition("circuit_open", Arc::new(|kind, _| {
                kind == FailureKind::CircuitOpen
            }))
            .with_condition("conflict", Arc::new(|kind, _| kind == FailureKind::Conflict))
    }

    /// Appends a named condition, builder-style.
    #[must_use]
    pub fn with_condition(mut self, name: impl Into<String>, condition: RetryCondition) -> Self {
        self.conditions.push((name.into(), condition));
        self
    }

    /// Evaluates every condition against this failure, returning the name of
    /// the first one that vetoes (if any) together with the names of the
    /// conditions that declined.
    #[must_use]
    pub fn evaluate(&self, kind: FailureKind, attempt: u32) -> (Option<&str>, Vec<&str>) {
        let mut veto = None;
        let mut declined = Vec::new();
        for (name, condition) in &self.conditions {
            if condition(kind, attempt) {
                if veto.is_none() {
                    veto = Some(name.as_str());
                }
            } else {
                declined.push(name.as_str());
            }
        }
        (veto, declined)
    }

    /// Registered condition names, in evaluation order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.conditions.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl std::fmt::Debug for RetryConditions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConditions")
            .field("conditions", &self.names())
            .finish()
    }
}

/// Per-condition evaluation counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionCounts {
    /// Times the condition fired and stopped a retry loop.
    pub triggered: u64,
    /// Times the condition was consulted on a failure and declined to veto.
    pub suppressed: u64,
}

/// Per-operation retry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    /// Total invocations, including first attempts.
    pub attempts: u64,
    /// Runs that eventually succeeded.
    pub successes: u64,
    /// Runs that failed every attempt.
    pub exhausted: u64,
    /// Runs stopped early by a veto condition.
    pub vetoed: u64,
}

/// Retry counters keyed by operation name, owned explicitly rather than
/// global. Aggregate totals across all operations remain available.
#[derive(Debug, Default)]
pub struct RetryMetricsRegistry {
    attempts: AtomicU64,
    successes: AtomicU64,
    exhausted: AtomicU64,
    vetoed: AtomicU64,
    by_operation: Mutex<HashMap<String, OperationCounts>>,
    by_condition: Mutex<HashMap<String, ConditionCounts>>,
}

impl RetryMetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_operation(&self, operation: &str, update: impl FnOnce(&mut OperationCounts)) {
        let mut by_operation = self
            .by_operation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        update(by_operation.entry(operation.to_string()).or_default());
    }

    fn record_attempt(&self, operation: &str) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.with_operation(operation, |counts| counts.attempts += 1);
        metrics::counter!(
            "crosstore_retry_attempts_total",
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    fn record_success(&self, operation: &str) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.with_operation(operation, |counts| counts.successes += 1);
        metrics::counter!(
            "crosstore_retry_successes_total",
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    fn record_exhausted(&self, operation: &str) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        self.with_operation(operation, |counts| counts.exhausted += 1);
        metrics::counter!(
            "crosstore_retry_exhausted_total",
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    fn record_veto(&self, operation: &str, condition: &str) {
        self.vetoed.fetch_add(1, Ordering::Relaxed);
        self.with_operation(operation, |counts| counts.vetoed += 1);
        let mut by_condition = self
            .by_condition
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        by_condition
            .entry(condition.to_string())
            .or_default()
            .triggered += 1;
        drop(by_condition);
        metrics::counter!(
            "crosstore_retry_vetoes_total",
            "operation" => operation.to_string(),
            "condition" => condition.to_string()
        )
        .increment(1);
    }

    fn record_suppressed(&self, conditions: &[&str]) {
        if conditions.is_empty() {
            return;
        }
        let mut by_condition = self
            .by_condition
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for condition in conditions {
            by_condition
                .entry((*condition).to_string())
                .or_default()
                .suppressed += 1;
        }
    }

    /// Total operation invocations, including first attempts.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Operations that eventually succeeded.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Operations that failed every attempt.
    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Operations stopped early by a veto condition.
    #[must_use]
    pub fn vetoed(&self) -> u64 {
        self.vetoed.load(Ordering::Relaxed)
    }

    /// Counts for a named operation.
    #[must_use]
    pub fn operation_counts(&self, operation: &str) -> OperationCounts {
        self.by_operation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or_default()
    }

    /// Veto counts for a named condition.
    #[must_use]
    pub fn condition_counts(&self, condition: &str) -> ConditionCounts {
        self.by_condition
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(condition)
            .cloned()
            .unwrap_or_default()
    }
}

/// Executes operations with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    conditions: RetryConditions,
    metrics: Arc<RetryMetricsRegistry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), RetryConditions::standard())
    }
}

impl RetryPolicy {
    /// Creates a policy with its own metrics registry.
    #[must_use]
    pub fn new(config: RetryConfig, conditions: RetryConditions) -> Self {
        Self::with_metrics(config, conditions, Arc::new(RetryMetricsRegistry::new()))
    }

    /// Creates a policy sharing an existing metrics registry.
    #[must_use]
    pub fn with_metrics(
        config: RetryConfig,
        conditions: RetryConditions,
        metrics: Arc<RetryMetricsRegistry>,
    ) -> Self {
        Self {
            config,
            conditions,
            metrics,
        }
    }

    /// The metrics registry backing this policy.
    #[must_use]
    pub fn metrics(&self) -> &Arc<RetryMetricsRegistry> {
        &self.metrics
    }

    /// Runs `operation` with retries. See [`Self::run_with_hook`].
    pub fn run<T, F>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        self.run_with_hook(operation_name, operation, |_, _, _| {})
    }

    /// Runs `operation` with retries, invoking `on_retry` before each sleep.
    ///
    /// The operation receives the zero-based attempt index. `on_retry`
    /// receives the failure, the attempt index, and the delay about to be
    /// slept. On exhaustion or veto the final failure is returned unchanged.
    pub fn run_with_hook<T, F, H>(
        &self,
        operation_name: &str,
        mut operation: F,
        mut on_retry: H,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        H: FnMut(&Error, u32, Duration),
    {
        let mut attempt = 0u32;
        loop {
            self.metrics.record_attempt(operation_name);
            match operation(attempt) {
                Ok(value) => {
                    self.metrics.record_success(operation_name);
                    return Ok(value);
                },
                Err(error) => {
                    let kind = FailureKind::of(&error);
                    let (veto, declined) = self.conditions.evaluate(kind, attempt);
                    self.metrics.record_suppressed(&declined);
                    if let Some(condition) = veto {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            condition,
                            kind = ?kind,
                            "retry vetoed"
                        );
                        self.metrics.record_veto(operation_name, condition);
                        return Err(error);
                    }
                    if attempt >= self.config.max_retries {
                        tracing::warn!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "retries exhausted"
                        );
                        self.metrics.record_exhausted(operation_name);
                        return Err(error);
                    }

                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        kind = ?kind,
                        "retrying after failure"
                    );
                    on_retry(&error, attempt, delay);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                },
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for_attempt(attempt);
        if !self.config.jitter {
            return base;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::AtomicU32;

    fn immediate(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_initial_backoff_ms(0)
            .with_jitter(false)
    }

    fn transient() -> Error {
        Error::OperationFailed {
            operation: "store".to_string(),
            cause: "connection reset".to_string(),
        }
    }

    #[test_case::test_case(0, 100 ; "first attempt uses initial backoff")]
    #[test_case::test_case(1, 200 ; "second attempt doubles")]
    #[test_case::test_case(2, 350 ; "third attempt clamps to max")]
    #[test_case::test_case(10, 350 ; "late attempts stay clamped")]
    fn test_backoff_is_exponential_and_clamped(attempt: u32, expected_ms: u64) {
        let config = RetryConfig::default()
            .with_initial_backoff_ms(100)
            .with_multiplier(2.0)
            .with_max_backoff_ms(350);

        assert_eq!(
            config.backoff_for_attempt(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(immediate(3), RetryConditions::none());
        let calls = AtomicU32::new(0);

        let value = policy
            .run("store", |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.metrics().attempts(), 3);
        assert_eq!(policy.metrics().successes(), 1);
    }

    #[test]
    fn test_exhaustion_returns_final_failure_after_exact_attempts() {
        let policy = RetryPolicy::new(immediate(3), RetryConditions::none());
        let calls = AtomicU32::new(0);

        let err = policy
            .run("store", |_| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .unwrap_err();

        // max_retries retries plus the initial attempt.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, Error::OperationFailed { .. }));
        assert_eq!(policy.metrics().exhausted(), 1);
    }

    #[test]
    fn test_veto_stops_immediately() {
        let policy = RetryPolicy::new(immediate(5), RetryConditions::standard());
        let calls = AtomicU32::new(0);

        let err = policy
            .run("retrieve", |_| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::CircuitOpen {
                    target: "vector".to_string(),
                })
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(policy.metrics().vetoed(), 1);
        assert_eq!(policy.metrics().condition_counts("circuit_open").triggered, 1);
        assert_eq!(policy.metrics().condition_counts("conflict").triggered, 0);
        // Conditions that saw the failure but declined are suppressed.
        assert_eq!(
            policy.metrics().condition_counts("invalid_input").suppressed,
            1
        );
        assert_eq!(policy.metrics().condition_counts("conflict").suppressed, 1);
    }

    #[test]
    fn test_attempt_scoped_condition() {
        // Vetoes anything past the second attempt.
        let conditions =
            RetryConditions::none().with_condition("budget", Arc::new(|_, attempt| attempt >= 1));
        let policy = RetryPolicy::new(immediate(10), conditions);
        let calls = AtomicU32::new(0);

        let _ = policy.run("store", |_| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_on_retry_hook_sees_each_delay() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(2)
                .with_initial_backoff_ms(1)
                .with_multiplier(2.0)
                .with_jitter(false),
            RetryConditions::none(),
        );
        let mut observed = Vec::new();

        let _ = policy.run_with_hook(
            "store",
            |_| -> Result<()> { Err(transient()) },
            |_, attempt, delay| observed.push((attempt, delay)),
        );

        assert_eq!(
            observed,
            vec![
                (0, Duration::from_millis(1)),
                (1, Duration::from_millis(2)),
            ]
        );
    }

    #[test]
    fn test_jitter_scales_delay_within_bounds() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_initial_backoff_ms(100)
                .with_jitter(true),
            RetryConditions::none(),
        );

        for _ in 0..32 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(50), "delay {delay:?} below half");
            assert!(delay < Duration::from_millis(150), "delay {delay:?} above 1.5x");
        }
    }

    #[test]
    fn test_metrics_keyed_by_operation_name() {
        let policy = RetryPolicy::new(immediate(0), RetryConditions::none());

        let _ = policy.run("store", |_| -> Result<()> { Err(transient()) });
        policy.run("retrieve", |_| Ok(7)).unwrap();

        let store = policy.metrics().operation_counts("store");
        assert_eq!(store.attempts, 1);
        assert_eq!(store.exhausted, 1);
        assert_eq!(store.successes, 0);

        let retrieve = policy.metrics().operation_counts("retrieve");
        assert_eq!(retrieve.attempts, 1);
        assert_eq!(retrieve.successes, 1);
        assert_eq!(retrieve.exhausted, 0);

        assert_eq!(policy.metrics().operation_counts("delete"), OperationCounts::default());
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            FailureKind::of(&Error::InvalidInput("bad".to_string())),
            FailureKind::InvalidInput
        );
        assert_eq!(FailureKind::of(&transient()), FailureKind::Operation);
        assert_eq!(
            FailureKind::of(&Error::Conflict {
                id: "a".to_string(),
                store: "graph".to_string(),
                detail: "stale".to_string(),
            }),
            FailureKind::Conflict
        );
    }
}
