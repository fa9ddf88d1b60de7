//! End-to-end integration tests.
//!
//! Exercises the documented behavioral guarantees through the public API:
//! transaction atomicity, snapshot round-trips, circuit breaker transitions,
//! deterministic retry backoff, fallback reads, and degraded-mode writes.

// Integration tests use unwrap/panic for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use crosstore::storage::traits::AdapterRegistry;
use crosstore::storage::{
    InMemoryAdapter, RetryConditions, StagedOperation, StorageResilienceConfig,
};
use crosstore::{
    CircuitBreakerRegistry, CrosstoreConfig, Error, MemoryAdapter, MemoryId, MemoryItem,
    MemoryManager, QueryCriteria, RetryConfig, RetryPolicy, SyncConfig, TransactionCoordinator,
    TransactionPhase,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn item(id: &str, version: u64) -> MemoryItem {
    MemoryItem::new(id, "note", json!({"v": version})).with_version(version)
}

fn coordinator(adapters: Vec<Arc<InMemoryAdapter>>) -> TransactionCoordinator {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    TransactionCoordinator::new(Arc::new(registry))
}

fn quick_manager(adapters: Vec<Arc<InMemoryAdapter>>) -> MemoryManager {
    let mut builder = MemoryManager::builder().with_config(
        CrosstoreConfig::default()
            .with_retry(
                RetryConfig::default()
                    .with_max_retries(1)
                    .with_initial_backoff_ms(0)
                    .with_jitter(false),
            )
            .with_resilience(
                StorageResilienceConfig::default()
                    .with_failure_threshold(3)
                    .with_reset_timeout_ms(5),
            )
            .with_sync(SyncConfig::default().with_flush_interval_ms(5)),
    );
    for adapter in adapters {
        builder = builder.register(adapter);
    }
    builder.build().unwrap()
}

// ============================================================================
// Transaction atomicity
// ============================================================================

/// All participants' mutations are visible after a fully successful commit;
/// none remain visible after a prepare failure triggers automatic rollback.
#[test]
fn test_transaction_atomicity_across_heterogeneous_participants() {
    init_tracing();
    let native = Arc::new(InMemoryAdapter::native_only("graph"));
    let snapshot = Arc::new(InMemoryAdapter::snapshot_only("vector"));
    let coordinator = coordinator(vec![Arc::clone(&native), Arc::clone(&snapshot)]);

    // Happy path: both mutations become visible.
    let tx = coordinator.begin(&["graph", "vector"]).unwrap();
    coordinator
        .stage(&tx, "graph", StagedOperation::Store(item("a", 1)))
        .unwrap();
    coordinator
        .stage(&tx, "vector", StagedOperation::Store(item("a", 1)))
        .unwrap();
    coordinator.commit(&tx).unwrap();
    assert!(native.retrieve(&MemoryId::from("a")).unwrap().is_some());
    assert!(snapshot.retrieve(&MemoryId::from("a")).unwrap().is_some());

    // Prepare failure: zero new mutations survive the automatic rollback.
    native.fail_next("prepare_commit", 1);
    let tx = coordinator.begin(&["graph", "vector"]).unwrap();
    coordinator
        .stage(&tx, "graph", StagedOperation::Store(item("b", 1)))
        .unwrap();
    coordinator
        .stage(&tx, "vector", StagedOperation::Store(item("b", 1)))
        .unwrap();
    let err = coordinator.commit(&tx).unwrap_err();
    assert!(matches!(err, Error::TransactionPrepare { .. }));
    assert!(native.retrieve(&MemoryId::from("b")).unwrap().is_none());
    assert!(snapshot.retrieve(&MemoryId::from("b")).unwrap().is_none());
    // The earlier committed item is untouched.
    assert!(snapshot.retrieve(&MemoryId::from("a")).unwrap().is_some());
}

/// Snapshot-only participant: state after rollback equals the state
/// immediately before `begin`, whatever was staged in between.
#[test]
fn test_snapshot_round_trip_restores_pre_begin_state() {
    init_tracing();
    let snapshot = Arc::new(InMemoryAdapter::snapshot_only("vector"));
    snapshot.store(&item("kept", 2)).unwrap();
    snapshot.store(&item("doomed", 1)).unwrap();
    let coordinator = coordinator(vec![Arc::clone(&snapshot)]);

    let tx = coordinator.begin(&["vector"]).unwrap();
    coordinator
        .stage(&tx, "vector", StagedOperation::Store(item("added", 1)))
        .unwrap();
    coordinator
        .stage(
            &tx,
            "vector",
            StagedOperation::Delete(MemoryId::from("doomed")),
        )
        .unwrap();
    coordinator
        .stage(&tx, "vector", StagedOperation::Store(item("kept", 3)))
        .unwrap();
    coordinator.rollback(&tx).unwrap();

    assert!(snapshot.retrieve(&MemoryId::from("added")).unwrap().is_none());
    assert!(snapshot.retrieve(&MemoryId::from("doomed")).unwrap().is_some());
    let kept = snapshot.retrieve(&MemoryId::from("kept")).unwrap().unwrap();
    assert_eq!(kept.version, 2);
}

/// The end-to-end scenario: commit with both stores healthy reaches
/// `Committed`; with one store failing prepare, the other store's
/// pre-transaction state is restored.
#[test]
fn test_end_to_end_two_store_transaction() {
    init_tracing();
    let store_a = Arc::new(InMemoryAdapter::snapshot_only("store-a"));
    let store_b = Arc::new(InMemoryAdapter::native_only("store-b"));
    let coordinator = coordinator(vec![Arc::clone(&store_a), Arc::clone(&store_b)]);

    let tx = coordinator.begin(&["store-a", "store-b"]).unwrap();
    coordinator
        .stage(&tx, "store-a", StagedOperation::Store(item("x", 1)))
        .unwrap();
    coordinator
        .stage(&tx, "store-b", StagedOperation::Store(item("x", 1)))
        .unwrap();
    coordinator.commit(&tx).unwrap();
    assert_eq!(coordinator.phase(&tx), Some(TransactionPhase::Committed));
    assert!(store_a.retrieve(&MemoryId::from("x")).unwrap().is_some());
    assert!(store_b.retrieve(&MemoryId::from("x")).unwrap().is_some());

    store_b.fail_next("prepare_commit", 1);
    let tx = coordinator.begin(&["store-a", "store-b"]).unwrap();
    coordinator
        .stage(&tx, "store-a", StagedOperation::Store(item("y", 1)))
        .unwrap();
    coordinator
        .stage(&tx, "store-b", StagedOperation::Store(item("y", 1)))
        .unwrap();
    let err = coordinator.commit(&tx).unwrap_err();
    assert!(matches!(err, Error::TransactionPrepare { .. }));
    assert_eq!(coordinator.phase(&tx), Some(TransactionPhase::RolledBack));
    // store-a is back to its pre-transaction state (x only).
    assert!(store_a.retrieve(&MemoryId::from("y")).unwrap().is_none());
    assert!(store_a.retrieve(&MemoryId::from("x")).unwrap().is_some());
    assert!(store_b.retrieve(&MemoryId::from("y")).unwrap().is_none());
}

// ============================================================================
// Circuit breaker transitions
// ============================================================================

/// After exactly `threshold` consecutive failures the next call is rejected
/// without invoking the operation; after the reset timeout exactly one trial
/// goes through, and its success closes the circuit.
#[test]
fn test_breaker_opens_at_threshold_and_recovers_through_half_open() {
    init_tracing();
    let registry = CircuitBreakerRegistry::new(
        StorageResilienceConfig::default()
            .with_failure_threshold(3)
            .with_reset_timeout_ms(20),
    );
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let _ = registry.execute("db", || -> crosstore::Result<()> {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err(Error::OperationFailed {
                operation: "store".to_string(),
                cause: "down".to_string(),
            })
        });
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(registry.state_value("db"), Some(1));

    // Open: rejected without invoking the operation.
    let err = registry
        .execute("db", || -> crosstore::Result<()> {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // After the reset timeout, one trial is allowed and success closes.
    std::thread::sleep(Duration::from_millis(30));
    registry
        .execute("db", || {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(registry.state_value("db"), Some(0));

    // Closed again: the failure counter was reset, one new failure does not
    // reopen the circuit.
    let _ = registry.execute("db", || -> crosstore::Result<()> {
        Err(Error::OperationFailed {
            operation: "store".to_string(),
            cause: "down".to_string(),
        })
    });
    assert_eq!(registry.state_value("db"), Some(0));
}

// ============================================================================
// Retry backoff determinism
// ============================================================================

/// An operation failing exactly K times is invoked exactly K+1 times, and
/// with jitter disabled the delay before attempt i is
/// `initial_backoff * multiplier^i`.
#[test]
fn test_retry_backoff_is_deterministic_without_jitter() {
    init_tracing();
    let policy = RetryPolicy::new(
        RetryConfig::default()
            .with_max_retries(5)
            .with_initial_backoff_ms(1)
            .with_multiplier(3.0)
            .with_max_backoff_ms(1_000)
            .with_jitter(false),
        RetryConditions::none(),
    );

    let invocations = AtomicU32::new(0);
    let mut delays = Vec::new();
    let value = policy
        .run_with_hook(
            "store",
            |_| {
                if invocations.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::OperationFailed {
                        operation: "store".to_string(),
                        cause: "transient".to_string(),
                    })
                } else {
                    Ok("done")
                }
            },
            |_, attempt, delay| delays.push((attempt, delay)),
        )
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(
        delays,
        vec![
            (0, Duration::from_millis(1)),
            (1, Duration::from_millis(3)),
            (2, Duration::from_millis(9)),
        ]
    );
}

// ============================================================================
// Facade: fallback reads and degraded writes
// ============================================================================

/// With store A failing and store B holding the item, the fallback read
/// returns the item and the failure report names only store A.
#[test]
fn test_fallback_read_reports_only_the_failing_store() {
    init_tracing();
    let store_a = Arc::new(InMemoryAdapter::new("store-a"));
    let store_b = Arc::new(InMemoryAdapter::new("store-b"));
    store_b.store(&item("x", 1)).unwrap();
    store_a.fail_next("retrieve", 8);
    let manager = quick_manager(vec![store_a, store_b]);

    let read = manager
        .get_with_fallback(&MemoryId::from("x"), None)
        .unwrap();
    assert_eq!(read.source, "store-b");
    assert_eq!(read.item.id.as_str(), "x");
    assert_eq!(
        read.failures.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["store-a"]
    );
}

/// A primary that raises on `store()` is skipped: the write lands on the
/// fallback, the degraded flag is raised, and a reconciliation task is
/// observably scheduled and eventually applied.
#[test]
fn test_degraded_write_falls_back_and_reconciles() {
    init_tracing();
    let primary = Arc::new(InMemoryAdapter::new("primary"));
    let fallback = Arc::new(InMemoryAdapter::new("fallback"));
    primary.fail_next("store", 2);
    let manager = quick_manager(vec![Arc::clone(&primary), Arc::clone(&fallback)]);

    let receipt = manager.store(&item("a", 1), None).unwrap();
    assert_eq!(receipt.primary_store, "fallback");
    assert!(receipt.degraded);
    assert!(fallback.retrieve(&MemoryId::from("a")).unwrap().is_some());

    // Reconciliation was scheduled and, with the primary healthy again,
    // eventually lands the write there and clears the degraded flag.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if !manager.sync().is_degraded("primary")
            && primary.retrieve(&MemoryId::from("a")).unwrap().is_some()
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(primary.retrieve(&MemoryId::from("a")).unwrap().is_some());
    assert!(!manager.sync().is_degraded("primary"));
    assert_eq!(manager.sync().stats().reconciled, 1);
}

/// Writes propagate to secondary stores in the background and queries merge
/// the newest revision of each item across stores.
#[test]
fn test_write_propagation_and_cross_store_query() {
    init_tracing();
    let primary = Arc::new(InMemoryAdapter::new("primary"));
    let fallback = Arc::new(InMemoryAdapter::new("fallback"));
    let manager = quick_manager(vec![Arc::clone(&primary), Arc::clone(&fallback)]);

    manager.store(&item("a", 1), None).unwrap();
    manager.store(&item("b", 1), None).unwrap();
    manager.sync().flush_all().unwrap();
    assert!(fallback.retrieve(&MemoryId::from("a")).unwrap().is_some());
    assert!(fallback.retrieve(&MemoryId::from("b")).unwrap().is_some());

    // A newer revision lands only on the fallback; the query still surfaces it.
    fallback.store(&item("a", 5)).unwrap();
    let results = manager.query(&QueryCriteria::any(), None).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id.as_str(), "a");
    assert_eq!(results[0].version, 5);
}

/// The scoped transaction API commits on success and rolls everything back
/// when the closure fails partway through.
#[test]
fn test_manager_scoped_transaction_round_trip() {
    init_tracing();
    let graph = Arc::new(InMemoryAdapter::native_only("graph"));
    let vector = Arc::new(InMemoryAdapter::snapshot_only("vector"));
    let manager = quick_manager(vec![Arc::clone(&graph), Arc::clone(&vector)]);

    manager
        .with_transaction(&["graph", "vector"], |tx| {
            tx.store("graph", item("g", 1))?;
            tx.store("vector", item("v", 1))?;
            Ok(())
        })
        .unwrap();
    assert!(graph.retrieve(&MemoryId::from("g")).unwrap().is_some());
    assert!(vector.retrieve(&MemoryId::from("v")).unwrap().is_some());

    let err = manager
        .with_transaction(&["graph", "vector"], |tx| {
            tx.store("graph", item("g2", 1))?;
            tx.store("vector", item("v2", 1))?;
            Err::<(), Error>(Error::InvalidInput("abort".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(graph.retrieve(&MemoryId::from("g2")).unwrap().is_none());
    assert!(vector.retrieve(&MemoryId::from("v2")).unwrap().is_none());
    // The earlier committed items survive.
    assert!(vector.retrieve(&MemoryId::from("v")).unwrap().is_some());
}
