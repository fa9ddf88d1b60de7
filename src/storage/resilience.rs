//! Per-target circuit breaking for storage backends.
//!
//! Prevents cascade failures when a backend becomes unhealthy: after a run of
//! consecutive failures the circuit opens and calls to that target are
//! rejected without touching the backend until a reset timeout elapses.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                        |
//!     |  success                               | timeout elapsed
//!     |                                        v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! Circuit state is keyed by target name inside an explicitly owned
//! [`CircuitBreakerRegistry`]; tests and embedders instantiate independent
//! registries instead of sharing an implicit global.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Resilience configuration for storage targets.
#[derive(Debug, Clone)]
pub struct StorageResilienceConfig {
    /// Consecutive failures before opening the circuit.
    pub breaker_failure_threshold: u32,
    /// How long to keep the circuit open before half-open.
    pub breaker_reset_timeout_ms: u64,
    /// Maximum trial calls while half-open.
    pub breaker_half_open_max_calls: u32,
}

impl Default for StorageResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 5,
            breaker_reset_timeout_ms: 30_000,
            breaker_half_open_max_calls: 1,
        }
    }
}

impl StorageResilienceConfig {
    /// Loads resilience configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CROSSTORE_BREAKER_FAILURE_THRESHOLD")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.breaker_failure_threshold = parsed.max(1);
        }
        if let Ok(v) = std::env::var("CROSSTORE_BREAKER_RESET_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.breaker_reset_timeout_ms = parsed;
        }
        if let Ok(v) = std::env::var("CROSSTORE_BREAKER_HALF_OPEN_MAX_CALLS")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.breaker_half_open_max_calls = parsed.max(1);
        }
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker_failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.breaker_reset_timeout_ms = timeout_ms;
        self
    }

    /// Sets the half-open max calls.
    #[must_use]
    pub const fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.breaker_half_open_max_calls = max_calls;
        self
    }
}

/// Circuit breaker state machine.
#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { last_failure: Instant },
    HalfOpen { attempts: u32 },
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    AllowedHalfOpen,
    Rejected,
}

/// Circuit breaker for a single target.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: &StorageResilienceConfig) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.breaker_failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            half_open_max_calls: config.breaker_half_open_max_calls.max(1),
        }
    }

    /// Checks if a request is allowed through the circuit breaker.
    fn admit(&mut self) -> Admission {
        match self.state {
            BreakerState::Closed { .. } => Admission::Allowed,
            BreakerState::Open { last_failure } => {
                if last_failure.elapsed() > self.reset_timeout {
                    self.state = BreakerState::HalfOpen { attempts: 1 };
                    Admission::AllowedHalfOpen
                } else {
                    Admission::Rejected
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    Admission::Rejected
                } else {
                    *attempts += 1;
                    Admission::Allowed
                }
            },
        }
    }

    /// Records a successful operation.
    ///
    /// Returns `true` if the circuit just closed from half-open. A success
    /// reported while open belongs to a call admitted before the trip and
    /// is ignored; recovery goes through a half-open trial.
    fn on_success(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures = 0;
                false
            },
            BreakerState::HalfOpen { .. } => {
                self.state = BreakerState::Closed { failures: 0 };
                true
            },
            BreakerState::Open { .. } => false,
        }
    }

    /// Records a failed operation.
    ///
    /// Returns `true` if the circuit just opened (tripped). A single failure
    /// while half-open reopens immediately regardless of the counter.
    fn on_failure(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    self.state = BreakerState::Open {
                        last_failure: Instant::now(),
                    };
                    return true;
                }
            },
            BreakerState::HalfOpen { .. } => {
                self.state = BreakerState::Open {
                    last_failure: Instant::now(),
                };
                return true;
            },
            BreakerState::Open { ref mut last_failure } => {
                *last_failure = Instant::now();
            },
        }
        false
    }

    /// Returns the current state as a numeric value for metrics.
    ///
    /// - 0: Closed
    /// - 1: Open
    /// - 2: Half-Open
    #[must_use]
    pub const fn state_value(&self) -> u8 {
        match self.state {
            BreakerState::Closed { .. } => 0,
            BreakerState::Open { .. } => 1,
            BreakerState::HalfOpen { .. } => 2,
        }
    }
}

/// Transition hook slot: receives the target name.
pub type TransitionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Hooks invoked on circuit transitions, for external metrics/alerting.
#[derive(Clone, Default)]
pub struct TransitionHooks {
    /// Fired when a circuit opens.
    pub on_open: Option<TransitionHook>,
    /// Fired when a circuit closes after recovery.
    pub on_close: Option<TransitionHook>,
    /// Fired when a circuit moves from open to half-open.
    pub on_half_open: Option<TransitionHook>,
}

impl TransitionHooks {
    /// No hooks.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the open hook, builder-style.
    #[must_use]
    pub fn with_on_open(mut self, hook: TransitionHook) -> Self {
        self.on_open = Some(hook);
        self
    }

    /// Sets the close hook, builder-style.
    #[must_use]
    pub fn with_on_close(mut self, hook: TransitionHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    /// Sets the half-open hook, builder-style.
    #[must_use]
    pub fn with_on_half_open(mut self, hook: TransitionHook) -> Self {
        self.on_half_open = Some(hook);
        self
    }
}

impl std::fmt::Debug for TransitionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

/// Name-keyed registry of circuit breakers.
///
/// State for a target is created lazily on first call and persists for the
/// life of the registry. Transitions for a given target are atomic with
/// respect to concurrent `execute` calls on that target.
pub struct CircuitBreakerRegistry {
    config: StorageResilienceConfig,
    hooks: TransitionHooks,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with no transition hooks.
    #[must_use]
    pub fn new(config: StorageResilienceConfig) -> Self {
        Self::with_hooks(config, TransitionHooks::none())
    }

    /// Creates a registry with transition hooks.
    #[must_use]
    pub fn with_hooks(config: StorageResilienceConfig, hooks: TransitionHooks) -> Self {
        Self {
            config,
            hooks,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Executes `operation` guarded by the circuit for `target`.
    ///
    /// Rejects immediately with [`Error::CircuitOpen`] while the circuit is
    /// open; otherwise invokes the operation and records its outcome.
    pub fn execute<T, F>(&self, target: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let admission = {
            let mut breakers = self.locked();
            let breaker = breakers
                .entry(target.to_string())
                .or_insert_with(|| CircuitBreaker::new(&self.config));
            let admission = breaker.admit();
            let state = breaker.state_value();
            drop(breakers);
            metrics::gauge!(
                "crosstore_circuit_state",
                "target" => target.to_string()
            )
            .set(f64::from(state));
            admission
        };

        match admission {
            Admission::Rejected => {
                metrics::counter!(
                    "crosstore_circuit_rejections_total",
                    "target" => target.to_string()
                )
                .increment(1);
                return Err(Error::CircuitOpen {
                    target: target.to_string(),
                });
            },
            Admission::AllowedHalfOpen => {
                tracing::info!(target_name = target, "circuit transitioning to half-open");
                if let Some(hook) = &self.hooks.on_half_open {
                    hook(target);
                }
            },
            Admission::Allowed => {},
        }

        let result = operation();

        let (transition, state) = {
            let mut breakers = self.locked();
            let breaker = breakers
                .entry(target.to_string())
                .or_insert_with(|| CircuitBreaker::new(&self.config));
            let transition = match &result {
                Ok(_) => breaker.on_success().then_some(Transition::Closed),
                Err(_) => breaker.on_failure().then_some(Transition::Opened),
            };
            (transition, breaker.state_value())
        };

        match &result {
            Ok(_) => Self::record_metrics(target, "success", state),
            Err(_) => Self::record_metrics(target, "error", state),
        }

        match transition {
            Some(Transition::Opened) => {
                tracing::warn!(target_name = target, "circuit opened after failures");
                metrics::counter!(
                    "crosstore_circuit_trips_total",
                    "target" => target.to_string()
                )
                .increment(1);
                if let Some(hook) = &self.hooks.on_open {
                    hook(target);
                }
            },
            Some(Transition::Closed) => {
                tracing::info!(target_name = target, "circuit closed after recovery");
                if let Some(hook) = &self.hooks.on_close {
                    hook(target);
                }
            },
            None => {},
        }

        result
    }

    /// Returns the numeric state of a target's circuit, if one exists.
    #[must_use]
    pub fn state_value(&self, target: &str) -> Option<u8> {
        self.locked().get(target).map(CircuitBreaker::state_value)
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record_metrics(target: &str, status: &'static str, state: u8) {
        metrics::counter!(
            "crosstore_requests_total",
            "target" => target.to_string(),
            "status" => status
        )
        .increment(1);
        metrics::gauge!(
            "crosstore_circuit_state",
            "target" => target.to_string()
        )
        .set(f64::from(state));
    }
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Opened,
    Closed,
}
