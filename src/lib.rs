//! # Crosstore
//!
//! A cross-store transaction and resilience coordinator for heterogeneous
//! memory backends.
//!
//! Crosstore makes multiple independent storage backends behave, as a group,
//! like a single consistent store for a logical operation. Backends with
//! native transaction support and backends that can only snapshot/restore
//! participate in the same two-phase commit; per-target circuit breakers and
//! bounded retries isolate failing backends; an asynchronous sync queue
//! propagates writes between stores and keeps the system partially available
//! when a primary store is down.
//!
//! ## Architecture
//!
//! - **Storage adapters** ([`storage::MemoryAdapter`]) expose the narrow
//!   store/retrieve/delete/query contract plus optional transaction and
//!   snapshot capabilities.
//! - **Resilience** ([`storage::CircuitBreakerRegistry`],
//!   [`storage::RetryPolicy`]) wraps every adapter call.
//! - **Transactions** ([`transaction::TransactionCoordinator`]) run a
//!   two-phase prepare/commit protocol across a bound participant set.
//! - **Sync** ([`services::SyncManager`]) propagates writes asynchronously,
//!   resolves conflicts, and drives degraded-mode reconciliation.
//! - **Facade** ([`services::MemoryManager`]) routes caller operations
//!   through all of the above with a read-through cache.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crosstore::{CrosstoreConfig, MemoryManager};
//! use crosstore::storage::InMemoryAdapter;
//!
//! let manager = MemoryManager::builder()
//!     .with_config(CrosstoreConfig::default())
//!     .register(Arc::new(InMemoryAdapter::new("primary")))
//!     .register(Arc::new(InMemoryAdapter::new("fallback")))
//!     .build()?;
//! manager.store(&item, None)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeMap;
use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod transaction;

// Re-exports for convenience
pub use config::{CrosstoreConfig, RetryConfig, StorageResilienceConfig, SyncConfig};
pub use models::{AdapterCapabilities, MemoryId, MemoryItem, QueryCriteria, SnapshotHandle};
pub use services::{ConflictResolver, LastWriterWins, MemoryManager, SyncManager, SyncStats};
pub use storage::{
    AdapterLookup, CircuitBreakerRegistry, InMemoryAdapter, MemoryAdapter, RetryMetricsRegistry,
    RetryPolicy, SnapshotAdapter, TransactionalAdapter,
};
pub use transaction::{
    ParticipantStatus, TransactionCoordinator, TransactionId, TransactionPhase, TransactionReport,
};

/// Error type for crosstore operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Unknown store names, duplicate participants, adapters without a usable capability, staging into a finished transaction |
/// | `OperationFailed` | An adapter call failed (I/O, backend fault, adapter-side timeout) |
/// | `CircuitOpen` | The circuit breaker for a target is open; the operation was not invoked |
/// | `Conflict` | A version conflict was detected and the resolution policy chose to raise |
/// | `Retrieval` | Every targeted store either failed or returned nothing |
/// | `Storage` | A store operation failed on every target after retries and fallbacks |
/// | `TransactionPrepare` | At least one participant failed Phase 1; all prepared participants were rolled back before this was raised |
/// | `TransactionCommit` | Partial failure during Phase 2; the transaction is in the terminal `Failed` phase and must be reconciled manually |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A store name does not resolve to a registered adapter
    /// - A participant is bound twice into the same transaction
    /// - An adapter supports neither native transactions nor snapshots
    /// - An operation targets a transaction that is missing or terminal
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when an adapter call fails for any backend-side reason,
    /// including adapter-enforced timeouts. This is the transient,
    /// retryable failure class.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The circuit breaker for a target is open.
    ///
    /// Raised immediately, without invoking the wrapped operation.
    #[error("circuit breaker open for target '{target}'")]
    CircuitOpen {
        /// The target name whose circuit is open.
        target: String,
    },

    /// A version conflict between stores.
    ///
    /// Raised when the configured conflict resolution policy elects to
    /// surface a conflict instead of resolving it silently.
    #[error("conflict on item '{id}' in store '{store}': {detail}")]
    Conflict {
        /// The conflicting item identifier.
        id: String,
        /// The store where the conflict was detected.
        store: String,
        /// Human-readable conflict detail.
        detail: String,
    },

    /// Every targeted store failed or returned nothing.
    #[error("retrieval failed across all stores: {failures:?}")]
    Retrieval {
        /// Per-store failure reasons, keyed by store name.
        failures: BTreeMap<String, String>,
    },

    /// A store operation failed after exhausting retries and fallbacks.
    #[error("store operation '{operation}' failed on every target: {failures:?}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Per-store failure reasons, keyed by store name.
        failures: BTreeMap<String, String>,
    },

    /// At least one participant failed the prepare phase.
    ///
    /// Recoverable: the coordinator rolled back all already-prepared
    /// participants and restored all snapshot participants before raising.
    #[error("transaction '{transaction_id}' failed to prepare: {failures:?}")]
    TransactionPrepare {
        /// The transaction identifier.
        transaction_id: String,
        /// Per-participant failure detail, in participant order.
        failures: Vec<(String, String)>,
    },

    /// Partial failure during the commit phase.
    ///
    /// Fatal and unrecoverable: the system is left inconsistent. Carries the
    /// full per-participant status for manual reconciliation. Never retried
    /// automatically.
    #[error(
        "transaction '{transaction_id}' failed during commit; manual reconciliation required: {statuses:?}"
    )]
    TransactionCommit {
        /// The transaction identifier.
        transaction_id: String,
        /// Per-participant status, in participant order.
        statuses: Vec<(String, String)>,
    },
}

/// Result type alias for crosstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Centralized utility to avoid duplicate implementations across the
/// codebase. Uses `SystemTime::now()` with fallback to 0 if the system clock
/// is before the Unix epoch.
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "store".to_string(),
            cause: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'store' failed: disk full");

        let err = Error::CircuitOpen {
            target: "sqlite".to_string(),
        };
        assert_eq!(err.to_string(), "circuit breaker open for target 'sqlite'");
    }

    #[test]
    fn test_retrieval_error_carries_failure_map() {
        let mut failures = BTreeMap::new();
        failures.insert("primary".to_string(), "connection refused".to_string());
        let err = Error::Retrieval { failures };
        assert!(err.to_string().contains("primary"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_commit_error_preserves_participant_order() {
        let err = Error::TransactionCommit {
            transaction_id: "tx-1".to_string(),
            statuses: vec![
                ("zeta".to_string(), "committed".to_string()),
                ("alpha".to_string(), "failed".to_string()),
            ],
        };
        let rendered = err.to_string();
        let zeta = rendered.find("zeta").unwrap_or(usize::MAX);
        let alpha = rendered.find("alpha").unwrap_or(0);
        assert!(zeta < alpha, "statuses must render in participant order");
    }

    #[test]
    fn test_current_timestamp_is_positive() {
        assert!(current_timestamp() > 0);
    }
}
