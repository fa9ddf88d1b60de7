//! In-memory storage adapter.
//!
//! Reference adapter used as a lightweight store and throughout the test
//! suites. Supports both transaction capabilities so any capability mix can
//! be exercised, enforces version monotonicity, and offers per-operation
//! failure injection for resilience testing.

use crate::models::{AdapterCapabilities, MemoryId, MemoryItem, QueryCriteria, SnapshotHandle};
use crate::storage::traits::{
    MemoryAdapter, SnapshotAdapter, StagedOperation, TransactionalAdapter,
};
use crate::transaction::TransactionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct AdapterState {
    items: HashMap<MemoryId, MemoryItem>,
    staged: HashMap<TransactionId, Vec<StagedOperation>>,
    snapshots: HashMap<u64, HashMap<MemoryId, MemoryItem>>,
    next_snapshot: u64,
    // operation name -> remaining injected failures
    failures: HashMap<String, u32>,
}

/// In-memory adapter with full capability support.
pub struct InMemoryAdapter {
    name: String,
    capabilities: AdapterCapabilities,
    state: Mutex<AdapterState>,
}

impl InMemoryAdapter {
    /// Creates an adapter supporting both native transactions and snapshots.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, AdapterCapabilities::full())
    }

    /// Creates an adapter with an explicit capability set.
    #[must_use]
    pub fn with_capabilities(name: impl Into<String>, capabilities: AdapterCapabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            state: Mutex::new(AdapterState::default()),
        }
    }

    /// Creates a snapshot-only adapter (no native transaction path).
    #[must_use]
    pub fn snapshot_only(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, AdapterCapabilities::snapshot_only())
    }

    /// Creates a natively transactional adapter (no snapshot path).
    #[must_use]
    pub fn native_only(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, AdapterCapabilities::native())
    }

    /// Arms failure injection: the next `count` invocations of `operation`
    /// fail with [`Error::OperationFailed`]. Operation names match the
    /// adapter trait methods (`store`, `retrieve`, `prepare_commit`, ...).
    pub fn fail_next(&self, operation: &str, count: u32) {
        let mut state = self.locked();
        state.failures.insert(operation.to_string(), count);
    }

    /// Number of items currently visible.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locked().items.len()
    }

    /// Returns `true` if no items are visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locked().items.is_empty()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_injected(&self, state: &mut AdapterState, operation: &str) -> Result<()> {
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::OperationFailed {
                    operation: operation.to_string(),
                    cause: format!("injected failure in adapter '{}'", self.name),
                });
            }
        }
        Ok(())
    }

    fn apply(state: &mut AdapterState, op: &StagedOperation) {
        match op {
            StagedOperation::Store(item) => {
                state.items.insert(item.id.clone(), item.clone());
            },
            StagedOperation::Delete(id) => {
                state.items.remove(id);
            },
        }
    }

    fn check_version(state: &AdapterState, item: &MemoryItem) -> Result<()> {
        if let Some(existing) = state.items.get(&item.id)
            && existing.version > item.version
        {
            return Err(Error::Conflict {
                id: item.id.to_string(),
                store: String::new(),
                detail: format!(
                    "stored version {} is newer than incoming version {}",
                    existing.version, item.version
                ),
            });
        }
        Ok(())
    }
}

impl MemoryAdapter for InMemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    fn store(&self, item: &MemoryItem) -> Result<MemoryId> {
        let mut state = self.locked();
        self.check_injected(&mut state, "store")?;
        Self::check_version(&state, item).map_err(|e| match e {
            Error::Conflict { id, detail, .. } => Error::Conflict {
                id,
                store: self.name.clone(),
                detail,
            },
            other => other,
        })?;
        state.items.insert(item.id.clone(), item.clone());
        Ok(item.id.clone())
    }

    fn retrieve(&self, id: &MemoryId) -> Result<Option<MemoryItem>> {
        let mut state = self.locked();
        self.check_injected(&mut state, "retrieve")?;
        Ok(state.items.get(id).cloned())
    }

    fn delete(&self, id: &MemoryId) -> Result<bool> {
        let mut state = self.locked();
        self.check_injected(&mut state, "delete")?;
        Ok(state.items.remove(id).is_some())
    }

    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<MemoryItem>> {
        let mut state = self.locked();
        self.check_injected(&mut state, "query")?;
        let mut matches: Vec<MemoryItem> = state
            .items
            .values()
            .filter(|item| criteria.matches(item))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    fn transactional(&self) -> Option<&dyn TransactionalAdapter> {
        self.capabilities.native_transactions.then_some(self)
    }

    fn snapshots(&self) -> Option<&dyn SnapshotAdapter> {
        self.capabilities.snapshot_restore.then_some(self)
    }
}

impl TransactionalAdapter for InMemoryAdapter {
    fn begin_transaction(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "begin_transaction")?;
        if state.staged.contains_key(tx) {
            return Err(Error::InvalidInput(format!(
                "transaction '{tx}' already open on adapter '{}'",
                self.name
            )));
        }
        state.staged.insert(tx.clone(), Vec::new());
        Ok(())
    }

    fn stage(&self, tx: &TransactionId, op: &StagedOperation) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "stage")?;
        let Some(log) = state.staged.get_mut(tx) else {
            return Err(Error::InvalidInput(format!(
                "no open transaction '{tx}' on adapter '{}'",
                self.name
            )));
        };
        log.push(op.clone());
        Ok(())
    }

    fn prepare_commit(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "prepare_commit")?;
        let staged = state.staged.get(tx).cloned().ok_or_else(|| {
            Error::InvalidInput(format!(
                "no open transaction '{tx}' on adapter '{}'",
                self.name
            ))
        })?;
        // Validate now so commit cannot fail on version conflicts.
        for op in &staged {
            if let StagedOperation::Store(item) = op {
                Self::check_version(&state, item)?;
            }
        }
        Ok(())
    }

    fn commit(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "commit")?;
        let staged = state.staged.remove(tx).ok_or_else(|| {
            Error::InvalidInput(format!(
                "no open transaction '{tx}' on adapter '{}'",
                self.name
            ))
        })?;
        for op in &staged {
            Self::apply(&mut state, op);
        }
        Ok(())
    }

    fn rollback(&self, tx: &TransactionId) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "rollback")?;
        state.staged.remove(tx);
        Ok(())
    }
}

impl SnapshotAdapter for InMemoryAdapter {
    fn snapshot(&self) -> Result<SnapshotHandle> {
        let mut state = self.locked();
        self.check_injected(&mut state, "snapshot")?;
        let token = state.next_snapshot;
        state.next_snapshot += 1;
        let copy = state.items.clone();
        state.snapshots.insert(token, copy);
        Ok(SnapshotHandle::new(token))
    }

    fn restore(&self, handle: &SnapshotHandle) -> Result<()> {
        let mut state = self.locked();
        self.check_injected(&mut state, "restore")?;
        let snapshot = state.snapshots.get(&handle.token()).cloned().ok_or_else(|| {
            Error::InvalidInput(format!(
                "unknown snapshot handle '{handle}' on adapter '{}'",
                self.name
            ))
        })?;
        state.items = snapshot;
        Ok(())
    }

    fn release(&self, handle: &SnapshotHandle) {
        let mut state = self.locked();
        state.snapshots.remove(&handle.token());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn item(id: &str, version: u64) -> MemoryItem {
        MemoryItem::new(id, "note", json!({"id": id})).with_version(version)
    }

    #[test]
    fn test_store_retrieve_delete_roundtrip() {
        let adapter = InMemoryAdapter::new("mem");
        let stored = adapter.store(&item("a", 1)).unwrap();
        assert_eq!(stored.as_str(), "a");
        assert!(adapter.retrieve(&stored).unwrap().is_some());
        assert!(adapter.delete(&stored).unwrap());
        assert!(adapter.retrieve(&stored).unwrap().is_none());
        assert!(!adapter.delete(&stored).unwrap());
    }

    #[test]
    fn test_store_rejects_stale_version() {
        let adapter = InMemoryAdapter::new("mem");
        adapter.store(&item("a", 3)).unwrap();
        let err = adapter.store(&item("a", 2)).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        // Same version is an idempotent overwrite, not a conflict.
        adapter.store(&item("a", 3)).unwrap();
    }

    #[test]
    fn test_query_filters_by_criteria() {
        let adapter = InMemoryAdapter::new("mem");
        adapter
            .store(&item("a", 1).with_metadata("phase", json!("expand")))
            .unwrap();
        adapter
            .store(&item("b", 1).with_metadata("phase", json!("refine")))
            .unwrap();

        let all = adapter.query(&QueryCriteria::any()).unwrap();
        assert_eq!(all.len(), 2);

        let refined = adapter
            .query(&QueryCriteria::any().with_metadata("phase", json!("refine")))
            .unwrap();
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].id.as_str(), "b");
    }

    #[test]
    fn test_staged_mutations_invisible_until_commit() {
        let adapter = InMemoryAdapter::new("mem");
        let tx = TransactionId::generate();
        adapter.begin_transaction(&tx).unwrap();
        adapter
            .stage(&tx, &StagedOperation::Store(item("a", 1)))
            .unwrap();

        assert!(adapter.retrieve(&MemoryId::from("a")).unwrap().is_none());
        adapter.prepare_commit(&tx).unwrap();
        adapter.commit(&tx).unwrap();
        assert!(adapter.retrieve(&MemoryId::from("a")).unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards_staged_mutations() {
        let adapter = InMemoryAdapter::new("mem");
        let tx = TransactionId::generate();
        adapter.begin_transaction(&tx).unwrap();
        adapter
            .stage(&tx, &StagedOperation::Store(item("a", 1)))
            .unwrap();
        adapter.rollback(&tx).unwrap();
        assert!(adapter.is_empty());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let adapter = InMemoryAdapter::snapshot_only("mem");
        adapter.store(&item("keep", 1)).unwrap();

        let handle = adapter.snapshot().unwrap();
        adapter.store(&item("added", 1)).unwrap();
        adapter.delete(&MemoryId::from("keep")).unwrap();

        adapter.restore(&handle).unwrap();
        assert!(adapter.retrieve(&MemoryId::from("keep")).unwrap().is_some());
        assert!(adapter.retrieve(&MemoryId::from("added")).unwrap().is_none());
        adapter.release(&handle);
        assert!(adapter.restore(&handle).is_err());
    }

    #[test]
    fn test_failure_injection_is_bounded() {
        let adapter = InMemoryAdapter::new("mem");
        adapter.fail_next("store", 2);
        assert!(adapter.store(&item("a", 1)).is_err());
        assert!(adapter.store(&item("a", 1)).is_err());
        assert!(adapter.store(&item("a", 1)).is_ok());
    }

    #[test]
    fn test_capability_gated_surfaces() {
        let native = InMemoryAdapter::native_only("n");
        assert!(native.transactional().is_some());
        assert!(native.snapshots().is_none());

        let snap = InMemoryAdapter::snapshot_only("s");
        assert!(snap.transactional().is_none());
        assert!(snap.snapshots().is_some());
    }
}
