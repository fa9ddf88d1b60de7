//! Storage layer abstraction.
//!
//! This module provides the adapter contract and the resilience wrappers
//! that guard every adapter call:
//! - **Traits**: the narrow capability interface each backend satisfies
//! - **Resilience**: per-target circuit breaking
//! - **Retry**: bounded exponential backoff with pluggable veto conditions

// Allow manual_let_else for clearer error handling in some contexts.
#![allow(clippy::manual_let_else)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod memory;
pub mod resilience;
pub mod retry;
pub mod traits;

pub use memory::InMemoryAdapter;
pub use resilience::{
    CircuitBreaker, CircuitBreakerRegistry, StorageResilienceConfig, TransitionHooks,
};
pub use retry::{
    ConditionCounts, FailureKind, OperationCounts, RetryConfig, RetryConditions,
    RetryMetricsRegistry, RetryPolicy,
};
pub use traits::{
    AdapterLookup, AdapterRegistry, MemoryAdapter, SnapshotAdapter, StagedOperation,
    TransactionalAdapter,
};
