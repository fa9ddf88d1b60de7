//! Adapter capability traits.
//!
//! Each storage backend satisfies [`MemoryAdapter`] and optionally one or
//! both capability traits. The coordinator resolves the capability once at
//! transaction `begin` time instead of branching repeatedly during the
//! protocol.

use crate::models::{AdapterCapabilities, MemoryId, MemoryItem, QueryCriteria, SnapshotHandle};
use crate::transaction::TransactionId;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// A mutation staged into a transaction or queued for propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOperation {
    /// Store (insert or update) an item.
    Store(MemoryItem),
    /// Delete an item by identifier.
    Delete(MemoryId),
}

impl StagedOperation {
    /// The identifier this operation targets.
    #[must_use]
    pub const fn id(&self) -> &MemoryId {
        match self {
            Self::Store(item) => &item.id,
            Self::Delete(id) => id,
        }
    }
}

/// Trait for storage backend adapters.
///
/// Adapters are required to provide per-key isolation between concurrent
/// transactions (optimistic versioning or native locking) and to bound their
/// own blocking I/O: an adapter-enforced timeout surfaces as an ordinary
/// `Err` and counts as a failure for circuit breaker and retry accounting.
pub trait MemoryAdapter: Send + Sync {
    /// Stable name used for routing, circuit state, and diagnostics.
    fn name(&self) -> &str;

    /// Declared capability flags, consulted once at transaction `begin`.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Stores an item, returning its identifier.
    fn store(&self, item: &MemoryItem) -> Result<MemoryId>;

    /// Retrieves an item by identifier.
    fn retrieve(&self, id: &MemoryId) -> Result<Option<MemoryItem>>;

    /// Deletes an item by identifier. Returns `true` if it existed.
    fn delete(&self, id: &MemoryId) -> Result<bool>;

    /// Returns all items matching the criteria.
    fn query(&self, criteria: &QueryCriteria) -> Result<Vec<MemoryItem>>;

    /// Native transaction surface, when supported.
    fn transactional(&self) -> Option<&dyn TransactionalAdapter> {
        None
    }

    /// Snapshot/restore surface, when supported.
    fn snapshots(&self) -> Option<&dyn SnapshotAdapter> {
        None
    }
}

/// Native transaction capability.
///
/// Adapters reporting `native_transactions` must serialize transactions
/// touching the same key; the coordinator does not implement cross-
/// transaction locking.
pub trait TransactionalAdapter: Send + Sync {
    /// Opens a transactional context for `tx`.
    fn begin_transaction(&self, tx: &TransactionId) -> Result<()>;

    /// Routes a staged mutation through the adapter's transactional write
    /// path. The mutation must not be visible until `commit`.
    fn stage(&self, tx: &TransactionId, op: &StagedOperation) -> Result<()>;

    /// Phase 1: validates that `commit` will succeed.
    fn prepare_commit(&self, tx: &TransactionId) -> Result<()>;

    /// Phase 2: makes all staged mutations visible.
    fn commit(&self, tx: &TransactionId) -> Result<()>;

    /// Discards all staged mutations.
    fn rollback(&self, tx: &TransactionId) -> Result<()>;
}

/// Snapshot/restore capability, used as a rollback substitute for adapters
/// without native transactions.
pub trait SnapshotAdapter: Send + Sync {
    /// Captures the adapter's current state, returning an opaque handle.
    fn snapshot(&self) -> Result<SnapshotHandle>;

    /// Reverts the adapter to the state captured by `handle`.
    fn restore(&self, handle: &SnapshotHandle) -> Result<()>;

    /// Releases state retained for `handle`. Infallible by contract; called
    /// exactly once when the owning transaction context is destroyed.
    fn release(&self, handle: &SnapshotHandle);
}

/// Narrow adapter lookup capability.
///
/// The sync manager and the transaction coordinator receive this instead of
/// a reference to the full facade, so no back-reference cycle forms between
/// the facade and its collaborators.
pub trait AdapterLookup: Send + Sync {
    /// Resolves a store name to its adapter, if registered.
    fn adapter(&self, name: &str) -> Option<Arc<dyn MemoryAdapter>>;

    /// Registered store names in priority order (first entry is primary).
    fn store_names(&self) -> Vec<String>;
}

/// Registry of adapters keyed by store name.
///
/// Insertion order is the priority order used for fallback reads; the first
/// registered adapter is the primary store.
#[derive(Default)]
pub struct AdapterRegistry {
    order: Vec<String>,
    adapters: HashMap<String, Arc<dyn MemoryAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own name. Re-registering a name
    /// replaces the adapter but keeps its priority position.
    pub fn register(&mut self, adapter: Arc<dyn MemoryAdapter>) {
        let name = adapter.name().to_string();
        if !self.adapters.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.adapters.insert(name, adapter);
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no adapters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl AdapterLookup for AdapterRegistry {
    fn adapter(&self, name: &str) -> Option<Arc<dyn MemoryAdapter>> {
        self.adapters.get(name).map(Arc::clone)
    }

    fn store_names(&self) -> Vec<String> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryAdapter;

    #[test]
    fn test_registry_preserves_priority_order() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(InMemoryAdapter::new("primary")));
        registry.register(Arc::new(InMemoryAdapter::new("fallback")));
        registry.register(Arc::new(InMemoryAdapter::new("archive")));

        assert_eq!(registry.store_names(), vec!["primary", "fallback", "archive"]);
        assert!(registry.adapter("fallback").is_some());
        assert!(registry.adapter("missing").is_none());
    }

    #[test]
    fn test_registry_reregister_keeps_position() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(InMemoryAdapter::new("a")));
        registry.register(Arc::new(InMemoryAdapter::new("b")));
        registry.register(Arc::new(InMemoryAdapter::new("a")));

        assert_eq!(registry.store_names(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_staged_operation_id() {
        let item = MemoryItem::new("x", "note", serde_json::json!(1));
        assert_eq!(StagedOperation::Store(item).id().as_str(), "x");
        assert_eq!(
            StagedOperation::Delete(MemoryId::from("y")).id().as_str(),
            "y"
        );
    }
}
