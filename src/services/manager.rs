//! Facade over adapters, resilience, transactions, and sync.
//!
//! [`MemoryManager`] is the surface callers use. Every per-store call runs
//! inside the retry policy with the circuit breaker innermost, so an open
//! circuit vetoes further retries instead of burning attempts against a
//! store that is known to be down. Reads go through an in-process LRU cache
//! and fall down the configured store priority order; writes land on the
//! first healthy store and propagate to the rest in the background.

use crate::config::CrosstoreConfig;
use crate::models::{MemoryId, MemoryItem, QueryCriteria};
use crate::services::sync::{ConflictResolver, LastWriterWins, SyncManager};
use crate::storage::resilience::{CircuitBreakerRegistry, TransitionHooks};
use crate::storage::retry::{RetryConditions, RetryPolicy};
use crate::storage::traits::{AdapterLookup, AdapterRegistry, MemoryAdapter, StagedOperation};
use crate::transaction::{TransactionCoordinator, TransactionId};
use crate::{Error, Result};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Outcome of a facade `store` call.
#[derive(Debug, Clone)]
pub struct StoreReceipt {
    /// Identifier of the stored item.
    pub id: MemoryId,
    /// Store the write landed on synchronously.
    pub primary_store: String,
    /// Stores the write was queued for in the background.
    pub replicated_to: Vec<String>,
    /// `true` if the write skipped one or more failing stores.
    pub degraded: bool,
}

/// Outcome of a fallback read: the item, where it came from, and which
/// stores failed on the way there.
#[derive(Debug, Clone)]
pub struct FallbackRead {
    /// The item found.
    pub item: MemoryItem,
    /// Store that served it.
    pub source: String,
    /// Stores that failed before `source`, with causes.
    pub failures: BTreeMap<String, String>,
}

/// Scoped handle for staging mutations inside `with_transaction`.
///
/// Dropping the scope without completing it rolls the transaction back, so
/// a panic inside the closure cannot leak an open transaction.
pub struct TransactionScope<'a> {
    coordinator: &'a TransactionCoordinator,
    id: TransactionId,
    staged_ids: Vec<MemoryId>,
    completed: bool,
}

impl TransactionScope<'_> {
    /// The transaction's identifier.
    #[must_use]
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Stages a write against one participant store.
    pub fn store(&mut self, store: &str, item: MemoryItem) -> Result<()> {
        self.staged_ids.push(item.id.clone());
        self.coordinator
            .stage(&self.id, store, StagedOperation::Store(item))
    }

    /// Stages a delete against one participant store.
    pub fn delete(&mut self, store: &str, id: MemoryId) -> Result<()> {
        self.staged_ids.push(id.clone());
        self.coordinator
            .stage(&self.id, store, StagedOperation::Delete(id))
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(error) = self.coordinator.rollback(&self.id) {
                tracing::warn!(
                    transaction_id = %self.id,
                    error = %error,
                    "rollback on scope drop failed"
                );
            }
        }
    }
}

/// Builder for [`MemoryManager`].
pub struct MemoryManagerBuilder {
    config: CrosstoreConfig,
    registry: AdapterRegistry,
    resolver: Arc<dyn ConflictResolver>,
    hooks: TransitionHooks,
}

impl Default for MemoryManagerBuilder {
    fn default() -> Self {
        Self {
            config: CrosstoreConfig::default(),
            registry: AdapterRegistry::new(),
            resolver: Arc::new(LastWriterWins),
            hooks: TransitionHooks::none(),
        }
    }
}

impl MemoryManagerBuilder {
    /// Starts an empty builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CrosstoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an adapter. Registration order is the read priority order;
    /// the first adapter is the primary store.
    #[must_use]
    pub fn register(mut self, adapter: Arc<dyn MemoryAdapter>) -> Self {
        self.registry.register(adapter);
        self
    }

    /// Replaces the conflict resolution policy used by the sync manager.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Installs circuit breaker transition hooks.
    #[must_use]
    pub fn with_breaker_hooks(mut self, hooks: TransitionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builds the manager. Fails if no adapters were registered.
    pub fn build(self) -> Result<MemoryManager> {
        if self.registry.is_empty() {
            return Err(Error::InvalidInput(
                "at least one adapter must be registered".to_string(),
            ));
        }
        let adapters: Arc<dyn AdapterLookup> = Arc::new(self.registry);
        let breakers = Arc::new(CircuitBreakerRegistry::with_hooks(
            self.config.resilience.clone(),
            self.hooks,
        ));
        let retry = RetryPolicy::new(self.config.retry.clone(), RetryConditions::standard());
        let coordinator = TransactionCoordinator::new(Arc::clone(&adapters));
        let sync = SyncManager::with_resolver(
            Arc::clone(&adapters),
            Arc::clone(&breakers),
            self.config.sync.clone(),
            self.resolver,
        );
        let capacity = NonZeroUsize::new(self.config.cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let default_stores = adapters.store_names();

        Ok(MemoryManager {
            adapters,
            breakers,
            retry,
            coordinator,
            sync,
            cache: Mutex::new(LruCache::new(capacity)),
            default_stores,
        })
    }
}

/// Coordinating facade over all registered stores.
pub struct MemoryManager {
    adapters: Arc<dyn AdapterLookup>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    coordinator: TransactionCoordinator,
    sync: SyncManager,
    cache: Mutex<LruCache<MemoryId, MemoryItem>>,
    default_stores: Vec<String>,
}

impl MemoryManager {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::new()
    }

    /// The background sync manager, for degraded-mode inspection.
    #[must_use]
    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// The circuit breaker registry guarding adapter calls.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Registered store names in priority order.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.adapters.store_names()
    }

    /// Stores an item on the first healthy target store and queues
    /// background propagation to the remaining targets.
    ///
    /// Targets default to every registered store in priority order. A
    /// failing store ahead of the one that accepted the write is marked
    /// degraded and gets a reconciliation task; if every target fails the
    /// aggregated causes come back as [`Error::Storage`].
    pub fn store(&self, item: &MemoryItem, targets: Option<&[&str]>) -> Result<StoreReceipt> {
        let targets = self.resolve_targets(targets)?;
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut primary: Option<usize> = None;

        for (index, store) in targets.iter().enumerate() {
            match self.guarded(store, "store", || {
                self.adapter(store)?.store(item).map(|_| ())
            }) {
                Ok(()) => {
                    primary = Some(index);
                    break;
                },
                Err(error) => {
                    tracing::warn!(store, error = %error, "store write failed");
                    failures.insert(store.clone(), error.to_string());
                },
            }
        }

        let Some(primary) = primary else {
            return Err(Error::Storage {
                operation: "store".to_string(),
                failures,
            });
        };

        // Skipped stores are degraded; the write is parked for them.
        for store in &targets[..primary] {
            self.sync.mark_degraded(store)?;
            self.sync
                .enqueue_reconciliation(store, StagedOperation::Store(item.clone()))?;
        }
        let replicated: Vec<String> = targets[primary + 1..].to_vec();
        for store in &replicated {
            self.sync
                .enqueue(store, StagedOperation::Store(item.clone()))?;
        }

        self.cache_put(item.clone());
        Ok(StoreReceipt {
            id: item.id.clone(),
            primary_store: targets[primary].clone(),
            replicated_to: replicated,
            degraded: primary > 0,
        })
    }

    /// Retrieves an item, trying the cache first and then each target store
    /// in priority order, with degraded stores moved to the back.
    ///
    /// Returns [`Error::Retrieval`] with a per-store failure map only when
    /// every targeted store failed or had no item.
    pub fn retrieve(&self, id: &MemoryId, targets: Option<&[&str]>) -> Result<MemoryItem> {
        if let Some(item) = self.cache_get(id) {
            return Ok(item);
        }
        let read = self.read_ladder(id, targets)?;
        Ok(read.item)
    }

    /// Reads an item through the fallback ladder, bypassing the cache, and
    /// reports which stores failed along the way.
    pub fn get_with_fallback(&self, id: &MemoryId, targets: Option<&[&str]>) -> Result<FallbackRead> {
        self.read_ladder(id, targets)
    }

    fn read_ladder(&self, id: &MemoryId, targets: Option<&[&str]>) -> Result<FallbackRead> {
        let targets = self.order_for_reads(self.resolve_targets(targets)?);
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut misses: Vec<String> = Vec::new();

        for store in &targets {
            match self.guarded(store, "retrieve", || self.adapter(store)?.retrieve(id)) {
                Ok(Some(item)) => {
                    self.cache_put(item.clone());
                    return Ok(FallbackRead {
                        item,
                        source: store.clone(),
                        failures,
                    });
                },
                Ok(None) => misses.push(store.clone()),
                Err(error) => {
                    tracing::warn!(store, error = %error, "read failed; trying next store");
                    failures.insert(store.clone(), error.to_string());
                },
            }
        }

        for store in misses {
            failures.entry(store).or_insert_with(|| "no item".to_string());
        }
        Err(Error::Retrieval { failures })
    }

    /// Deletes an item from every target store. Returns `true` if any store
    /// held it; fails with [`Error::Storage`] only if every store failed.
    pub fn delete(&self, id: &MemoryId, targets: Option<&[&str]>) -> Result<bool> {
        let targets = self.resolve_targets(targets)?;
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut existed = false;
        let mut any_ok = false;

        for store in &targets {
            match self.guarded(store, "delete", || self.adapter(store)?.delete(id)) {
                Ok(found) => {
                    any_ok = true;
                    existed |= found;
                },
                Err(error) => {
                    failures.insert(store.clone(), error.to_string());
                },
            }
        }

        if !any_ok {
            return Err(Error::Storage {
                operation: "delete".to_string(),
                failures,
            });
        }
        self.cache_evict(id);
        Ok(existed)
    }

    /// Queries every target store and merges results by identifier, keeping
    /// the highest version of each item. Per-store failures are logged;
    /// [`Error::Retrieval`] is returned only if every store failed.
    pub fn query(
        &self,
        criteria: &QueryCriteria,
        targets: Option<&[&str]>,
    ) -> Result<Vec<MemoryItem>> {
        let targets = self.resolve_targets(targets)?;
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut merged: BTreeMap<MemoryId, MemoryItem> = BTreeMap::new();
        let mut any_ok = false;

        for store in &targets {
            match self.guarded(store, "query", || self.adapter(store)?.query(criteria)) {
                Ok(items) => {
                    any_ok = true;
                    for item in items {
                        match merged.get(&item.id) {
                            Some(existing) if existing.version >= item.version => {},
                            _ => {
                                merged.insert(item.id.clone(), item);
                            },
                        }
                    }
                },
                Err(error) => {
                    tracing::warn!(store, error = %error, "query failed on store");
                    failures.insert(store.clone(), error.to_string());
                },
            }
        }

        if !any_ok {
            return Err(Error::Retrieval { failures });
        }
        Ok(merged.into_values().collect())
    }

    /// Runs `f` inside a transaction spanning `stores`.
    ///
    /// Commits on `Ok`, rolls back on `Err` or panic. The transaction
    /// context is released exactly once on every exit path.
    pub fn with_transaction<T, F>(&self, stores: &[&str], f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope<'_>) -> Result<T>,
    {
        let id = self.coordinator.begin(stores)?;
        let mut scope = TransactionScope {
            coordinator: &self.coordinator,
            id,
            staged_ids: Vec::new(),
            completed: false,
        };

        match f(&mut scope) {
            Ok(value) => {
                scope.completed = true;
                self.coordinator.commit(&scope.id)?;
                // Committed writes supersede whatever the cache holds.
                for staged in &scope.staged_ids {
                    self.cache_evict(staged);
                }
                Ok(value)
            },
            Err(error) => {
                scope.completed = true;
                if let Err(rollback_error) = self.coordinator.rollback(&scope.id) {
                    tracing::warn!(
                        transaction_id = %scope.id,
                        error = %rollback_error,
                        "rollback after scope error failed"
                    );
                }
                Err(error)
            },
        }
    }

    fn resolve_targets(&self, targets: Option<&[&str]>) -> Result<Vec<String>> {
        let Some(targets) = targets else {
            return Ok(self.default_stores.clone());
        };
        if targets.is_empty() {
            return Err(Error::InvalidInput(
                "target store list must not be empty".to_string(),
            ));
        }
        for store in targets {
            if self.adapters.adapter(store).is_none() {
                return Err(Error::InvalidInput(format!("unknown store '{store}'")));
            }
        }
        Ok(targets.iter().map(ToString::to_string).collect())
    }

    // Degraded stores keep their relative order but go to the back, so
    // reads prefer healthy fallbacks while reconciliation catches up.
    fn order_for_reads(&self, targets: Vec<String>) -> Vec<String> {
        let (healthy, degraded): (Vec<String>, Vec<String>) = targets
            .into_iter()
            .partition(|store| !self.sync.is_degraded(store));
        let mut ordered = healthy;
        ordered.extend(degraded);
        ordered
    }

    fn guarded<T>(&self, store: &str, operation: &str, call: impl Fn() -> Result<T>) -> Result<T> {
        self.retry
            .run(operation, |_| self.breakers.execute(store, &call))
    }

    fn adapter(&self, store: &str) -> Result<Arc<dyn MemoryAdapter>> {
        self.adapters
            .adapter(store)
            .ok_or_else(|| Error::InvalidInput(format!("unknown store '{store}'")))
    }

    fn cache_get(&self, id: &MemoryId) -> Option<MemoryItem> {
        self.locked_cache().get(id).cloned()
    }

    fn cache_put(&self, item: MemoryItem) {
        self.locked_cache().put(item.id.clone(), item);
    }

    fn cache_evict(&self, id: &MemoryId) {
        self.locked_cache().pop(id);
    }

    fn locked_cache(&self) -> std::sync::MutexGuard<'_, LruCache<MemoryId, MemoryItem>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
