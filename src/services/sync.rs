//! Background propagation of writes across stores.
//!
//! Each store gets its own FIFO queue drained by a dedicated worker thread,
//! so operations for the same key land in submission order. Nothing is
//! guaranteed across different keys or different store queues.
//!
//! When applying a queued write, the target store's current version is
//! compared against the incoming item's version; a newer current version is
//! a conflict and is handed to the injected [`ConflictResolver`]. The
//! default policy is last-writer-wins by version, which discards the stale
//! queued write.
//!
//! A store whose writes start failing enters degraded mode: its failed
//! operations move to a reconciliation queue that is re-attempted through
//! the circuit breaker, so a down store is probed rather than hammered.
//! Later submissions queue behind the parked work, keeping per-store order
//! intact across the degraded boundary. Draining the reconciliation queue
//! clears the degraded flag.

use crate::models::{MemoryId, MemoryItem, QueryCriteria};
use crate::storage::resilience::CircuitBreakerRegistry;
use crate::storage::traits::{AdapterLookup, StagedOperation};
use crate::transaction::{TransactionCoordinator, TransactionId};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

// Oldest records are dropped once the conflict log reaches this size.
const CONFLICT_LOG_CAPACITY: usize = 256;

/// Background synchronization settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Worker wake interval in milliseconds, bounding how quickly a flush
    /// completes and how often degraded stores are probed.
    pub flush_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
        }
    }
}

impl SyncConfig {
    /// Loads sync configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CROSSTORE_SYNC_FLUSH_INTERVAL_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.flush_interval_ms = parsed.max(1);
        }
        self
    }

    /// Sets the flush interval, builder-style.
    #[must_use]
    pub const fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }
}

/// Conflict resolution policy, consulted when a queued write is older than
/// the target store's current revision.
pub trait ConflictResolver: Send + Sync {
    /// Policy name, for logs and conflict records.
    fn name(&self) -> &str;

    /// Returns the item to write instead, or `None` to discard the stale
    /// incoming write and keep the store's current revision. A returned
    /// item must carry a version at least equal to `current`'s or the
    /// store will reject it.
    fn resolve(&self, incoming: &MemoryItem, current: &MemoryItem) -> Option<MemoryItem>;
}

/// Last-writer-wins by version: a stale queued write is discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn name(&self) -> &str {
        "last-writer-wins"
    }

    fn resolve(&self, _incoming: &MemoryItem, _current: &MemoryItem) -> Option<MemoryItem> {
        None
    }
}

/// Record of a detected conflict and how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Item the conflict was detected on.
    pub id: MemoryId,
    /// Store the queued write targeted.
    pub store: String,
    /// Version carried by the stale queued write.
    pub incoming_version: u64,
    /// Version already present in the store.
    pub current_version: u64,
    /// Name of the resolver policy that handled it.
    pub resolved_by: String,
    /// When the conflict was detected.
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

/// Point-in-time counters for sync activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Operations applied successfully, queued or bulk.
    pub synchronized: u64,
    /// Conflicts detected (resolved or discarded).
    pub conflicts: u64,
    /// Reconciliation operations applied after a degraded period.
    pub reconciled: u64,
    /// Operations that failed to apply and were parked for reconciliation.
    pub failed: u64,
}

impl SyncStats {
    /// Returns `true` if nothing has happened yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.synchronized == 0 && self.conflicts == 0 && self.reconciled == 0 && self.failed == 0
    }

    /// Human-readable one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "synchronized {} operations ({} conflicts, {} reconciled, {} failed)",
            self.synchronized, self.conflicts, self.reconciled, self.failed
        )
    }
}

#[derive(Default)]
struct Counters {
    synchronized: AtomicU64,
    conflicts: AtomicU64,
    reconciled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SyncStats {
        SyncStats {
            synchronized: self.synchronized.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    pending: VecDeque<StagedOperation>,
    reconcile: VecDeque<StagedOperation>,
    degraded: bool,
    applying: bool,
    shutdown: bool,
}

#[derive(Default)]
struct StoreChannel {
    state: Mutex<ChannelState>,
    signal: Condvar,
}

impl StoreChannel {
    fn locked(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

enum Task {
    Sync(StagedOperation),
    Reconcile(StagedOperation),
}

struct Worker {
    store: String,
    channel: Arc<StoreChannel>,
    adapters: Arc<dyn AdapterLookup>,
    breakers: Arc<CircuitBreakerRegistry>,
    resolver: Arc<dyn ConflictResolver>,
    counters: Arc<Counters>,
    conflicts: Arc<Mutex<Vec<ConflictRecord>>>,
    interval: Duration,
}

/// Propagates writes to secondary stores without blocking callers.
pub struct SyncManager {
    adapters: Arc<dyn AdapterLookup>,
    breakers: Arc<CircuitBreakerRegistry>,
    resolver: Arc<dyn ConflictResolver>,
    config: SyncConfig,
    channels: Mutex<HashMap<String, Arc<StoreChannel>>>,
    counters: Arc<Counters>,
    conflicts: Arc<Mutex<Vec<ConflictRecord>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    /// Creates a sync manager with the default last-writer-wins policy.
    #[must_use]
    pub fn new(
        adapters: Arc<dyn AdapterLookup>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self::with_resolver(adapters, breakers, config, Arc::new(LastWriterWins))
    }

    /// Creates a sync manager with an injected conflict resolution policy.
    #[must_use]
    pub fn with_resolver(
        adapters: Arc<dyn AdapterLookup>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: SyncConfig,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            adapters,
            breakers,
            resolver,
            config,
            channels: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            conflicts: Arc::new(Mutex::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Queues an operation for background application to `store`.
    ///
    /// Operations for the same store apply strictly in submission order.
    pub fn enqueue(&self, store: &str, operation: StagedOperation) -> Result<()> {
        if self.adapters.adapter(store).is_none() {
            return Err(Error::InvalidInput(format!("unknown store '{store}'")));
        }
        let channel = self.channel(store)?;
        let mut state = channel.locked();
        state.pending.push_back(operation);
        metrics::gauge!("crosstore_sync_queue_depth", "store" => store.to_string())
            .set(approx_len(state.pending.len()));
        drop(state);
        channel.signal.notify_all();
        Ok(())
    }

    /// Blocks until `store`'s pending queue is drained.
    pub fn flush(&self, store: &str) -> Result<()> {
        let channel = self.channel(store)?;
        let mut state = channel.locked();
        while !state.pending.is_empty() || state.applying {
            let (next, _) = channel
                .signal
                .wait_timeout(state, Duration::from_millis(self.config.flush_interval_ms))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
        }
        Ok(())
    }

    /// Flushes every store that has ever had a queue.
    pub fn flush_all(&self) -> Result<()> {
        let names: Vec<String> = self.locked_channels().keys().cloned().collect();
        for name in names {
            self.flush(&name)?;
        }
        Ok(())
    }

    /// Marks a store degraded, without queueing anything.
    pub fn mark_degraded(&self, store: &str) -> Result<()> {
        let channel = self.channel(store)?;
        let mut state = channel.locked();
        if !state.degraded {
            state.degraded = true;
            tracing::warn!(store, "store entered degraded mode");
            metrics::gauge!("crosstore_degraded", "store" => store.to_string()).set(1.0);
        }
        Ok(())
    }

    /// Returns `true` while `store` is degraded.
    #[must_use]
    pub fn is_degraded(&self, store: &str) -> bool {
        self.locked_channels()
            .get(store)
            .is_some_and(|channel| channel.locked().degraded)
    }

    /// Queues an operation to be re-attempted against a degraded store once
    /// it becomes reachable again, probed through the circuit breaker.
    /// Marks the store degraded as a side effect.
    pub fn enqueue_reconciliation(&self, store: &str, operation: StagedOperation) -> Result<()> {
        let channel = self.channel(store)?;
        let mut state = channel.locked();
        if !state.degraded {
            state.degraded = true;
            tracing::warn!(store, "store entered degraded mode");
            metrics::gauge!("crosstore_degraded", "store" => store.to_string()).set(1.0);
        }
        state.reconcile.push_back(operation);
        drop(state);
        channel.signal.notify_all();
        Ok(())
    }

    /// Number of reconciliation operations still queued for `store`.
    #[must_use]
    pub fn pending_reconciliations(&self, store: &str) -> usize {
        self.locked_channels()
            .get(store)
            .map_or(0, |channel| channel.locked().reconcile.len())
    }

    /// Copies every item in `source` into `target` inside one transaction,
    /// resolving version conflicts through the configured policy. With
    /// `bidirectional` set, a second transaction copies the other way.
    /// Returns the number of items written.
    pub fn synchronize(&self, source: &str, target: &str, bidirectional: bool) -> Result<u64> {
        let mut written = self.synchronize_one_way(source, target)?;
        if bidirectional {
            written += self.synchronize_one_way(target, source)?;
        }
        Ok(written)
    }

    fn synchronize_one_way(&self, source: &str, target: &str) -> Result<u64> {
        let source_adapter = self
            .adapters
            .adapter(source)
            .ok_or_else(|| Error::InvalidInput(format!("unknown store '{source}'")))?;
        let items = source_adapter.query(&QueryCriteria::any())?;

        let coordinator = TransactionCoordinator::new(Arc::clone(&self.adapters));
        let tx = coordinator.begin(&[target])?;
        match self.stage_for_target(&coordinator, &tx, target, &items) {
            Ok(written) => {
                coordinator.commit(&tx)?;
                self.counters
                    .synchronized
                    .fetch_add(written, Ordering::Relaxed);
                tracing::info!(source, target, written, "bulk synchronization committed");
                Ok(written)
            },
            Err(error) => {
                if let Err(rollback_error) = coordinator.rollback(&tx) {
                    tracing::warn!(
                        source,
                        target,
                        error = %rollback_error,
                        "rollback after failed bulk synchronization failed"
                    );
                }
                Err(error)
            },
        }
    }

    fn stage_for_target(
        &self,
        coordinator: &TransactionCoordinator,
        tx: &TransactionId,
        target: &str,
        items: &[MemoryItem],
    ) -> Result<u64> {
        let target_adapter = self
            .adapters
            .adapter(target)
            .ok_or_else(|| Error::InvalidInput(format!("unknown store '{target}'")))?;
        let mut written = 0u64;
        for item in items {
            let staged = match target_adapter.retrieve(&item.id)? {
                Some(current) if current.version > item.version => log_conflict(
                    &self.counters,
                    &self.conflicts,
                    self.resolver.as_ref(),
                    target,
                    item,
                    &current,
                ),
                _ => Some(item.clone()),
            };
            if let Some(resolved) = staged {
                coordinator.stage(tx, target, StagedOperation::Store(resolved))?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Current activity counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.counters.snapshot()
    }

    /// Conflicts recorded so far, oldest first.
    #[must_use]
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn channel(&self, store: &str) -> Result<Arc<StoreChannel>> {
        let mut channels = self.locked_channels();
        if let Some(channel) = channels.get(store) {
            return Ok(Arc::clone(channel));
        }
        let channel = Arc::new(StoreChannel::default());
        channels.insert(store.to_string(), Arc::clone(&channel));
        drop(channels);

        let worker = Worker {
            store: store.to_string(),
            channel: Arc::clone(&channel),
            adapters: Arc::clone(&self.adapters),
            breakers: Arc::clone(&self.breakers),
            resolver: Arc::clone(&self.resolver),
            counters: Arc::clone(&self.counters),
            conflicts: Arc::clone(&self.conflicts),
            interval: Duration::from_millis(self.config.flush_interval_ms),
        };
        let handle = std::thread::Builder::new()
            .name(format!("crosstore-sync-{store}"))
            .spawn(move || worker.run())
            .map_err(|error| Error::OperationFailed {
                operation: "spawn_sync_worker".to_string(),
                cause: error.to_string(),
            })?;
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
        Ok(channel)
    }

    fn locked_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<StoreChannel>>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for channel in self.locked_channels().values() {
            channel.locked().shutdown = true;
            channel.signal.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Worker {
    fn run(&self) {
        loop {
            let task = {
                let mut state = self.channel.locked();
                loop {
                    if state.shutdown && state.pending.is_empty() {
                        return;
                    }
                    // While reconcile work is parked, later submissions move
                    // behind it, keeping one FIFO per store across the
                    // degraded boundary.
                    if state.degraded || !state.reconcile.is_empty() {
                        while let Some(op) = state.pending.pop_front() {
                            state.reconcile.push_back(op);
                        }
                        if let Some(op) = state.reconcile.front().cloned() {
                            state.applying = true;
                            break Task::Reconcile(op);
                        }
                    } else if let Some(op) = state.pending.pop_front() {
                        state.applying = true;
                        break Task::Sync(op);
                    }
                    let (next, _) = self
                        .channel
                        .signal
                        .wait_timeout(state, self.interval)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state = next;
                }
            };
            match task {
                Task::Sync(op) => self.run_sync(op),
                Task::Reconcile(op) => self.run_reconcile(&op),
            }
        }
    }

    fn run_sync(&self, op: StagedOperation) {
        let outcome = self.apply(&op);
        let mut state = self.channel.locked();
        state.applying = false;
        match outcome {
            Ok(()) => {
                self.counters.synchronized.fetch_add(1, Ordering::Relaxed);
            },
            Err(error) => {
                // Park the failed write for reconciliation instead of
                // dropping it; the store is treated as degraded from here.
                tracing::warn!(
                    store = self.store,
                    error = %error,
                    "sync apply failed; parking operation for reconciliation"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if !state.degraded {
                    state.degraded = true;
                    metrics::gauge!("crosstore_degraded", "store" => self.store.clone()).set(1.0);
                }
                state.reconcile.push_back(op);
            },
        }
        drop(state);
        self.channel.signal.notify_all();
    }

    fn run_reconcile(&self, op: &StagedOperation) {
        let outcome = self.breakers.execute(&self.store, || self.apply(op));
        let mut state = self.channel.locked();
        state.applying = false;
        if outcome.is_ok() {
            state.reconcile.pop_front();
            self.counters.reconciled.fetch_add(1, Ordering::Relaxed);
            if state.reconcile.is_empty() {
                state.degraded = false;
                tracing::info!(store = self.store, "store left degraded mode");
                metrics::gauge!("crosstore_degraded", "store" => self.store.clone()).set(0.0);
            }
            drop(state);
            self.channel.signal.notify_all();
        } else {
            drop(state);
            self.channel.signal.notify_all();
            // Probe failed (or circuit open); back off before the next try.
            std::thread::sleep(self.interval);
        }
    }

    fn apply(&self, op: &StagedOperation) -> Result<()> {
        let adapter = self
            .adapters
            .adapter(&self.store)
            .ok_or_else(|| Error::InvalidInput(format!("unknown store '{}'", self.store)))?;
        match op {
            StagedOperation::Store(item) => {
                let current = adapter.retrieve(&item.id)?;
                if let Some(current) = current
                    && current.version > item.version
                {
                    if let Some(resolved) = log_conflict(
                        &self.counters,
                        &self.conflicts,
                        self.resolver.as_ref(),
                        &self.store,
                        item,
                        &current,
                    ) {
                        adapter.store(&resolved)?;
                    }
                    return Ok(());
                }
                adapter.store(item)?;
            },
            StagedOperation::Delete(id) => {
                adapter.delete(id)?;
            },
        }
        Ok(())
    }
}

fn log_conflict(
    counters: &Counters,
    conflicts: &Mutex<Vec<ConflictRecord>>,
    resolver: &dyn ConflictResolver,
    store: &str,
    incoming: &MemoryItem,
    current: &MemoryItem,
) -> Option<MemoryItem> {
    counters.conflicts.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("crosstore_sync_conflicts_total", "store" => store.to_string())
        .increment(1);
    let record = ConflictRecord {
        id: incoming.id.clone(),
        store: store.to_string(),
        incoming_version: incoming.version,
        current_version: current.version,
        resolved_by: resolver.name().to_string(),
        detected_at: chrono::Utc::now(),
    };
    tracing::debug!(
        store,
        id = %record.id,
        incoming_version = record.incoming_version,
        current_version = record.current_version,
        policy = record.resolved_by,
        "conflict detected on incoming write"
    );
    let mut log = conflicts
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if log.len() >= CONFLICT_LOG_CAPACITY {
        log.remove(0);
    }
    log.push(record);
    drop(log);

    resolver.resolve(incoming, current)
}

#[allow(clippy::cast_precision_loss)]
fn approx_len(len: usize) -> f64 {
    len as f64
}
