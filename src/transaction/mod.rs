//! Two-phase transaction coordination across heterogeneous adapters.
//!
//! The coordinator binds a fixed, ordered set of participant adapters at
//! `begin` and drives a prepare/commit protocol over them. Natively
//! transactional adapters go through their own begin/prepare/commit/rollback
//! path; snapshot-only adapters have their state captured at `begin` and
//! mutations applied immediately at stage time, with `restore` standing in
//! for rollback.
//!
//! # Phase machine
//!
//! ```text
//! Begun -> Preparing -> Prepared -> Committing -> Committed
//!             |                         |
//!             v                         v
//!        RollingBack -> RolledBack    Failed
//! ```
//!
//! `Committed`, `RolledBack`, and `Failed` are terminal. `Failed` means a
//! Phase 2 commit call failed after the protocol passed prepare; there is no
//! durable log to replay, so the outcome is surfaced with full
//! per-participant status for manual reconciliation and never retried
//! automatically.

use crate::models::SnapshotHandle;
use crate::storage::traits::{AdapterLookup, MemoryAdapter, StagedOperation};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Terminal outcomes kept for phase queries after a context is dropped.
const OUTCOME_LOG_CAPACITY: usize = 256;

/// Unique transaction identifier, fresh per `begin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// Open for staging.
    Begun,
    /// Phase 1 in progress.
    Preparing,
    /// Every native participant prepared successfully.
    Prepared,
    /// Phase 2 in progress.
    Committing,
    /// All participants committed. Terminal.
    Committed,
    /// Rollback in progress after a prepare failure or explicit rollback.
    RollingBack,
    /// All participants rolled back or restored. Terminal.
    RolledBack,
    /// A Phase 2 commit failed partway. Terminal and unrecoverable.
    Failed,
}

impl TransactionPhase {
    /// Returns `true` for phases with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Begun => "begun",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Per-participant outcome, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// Snapshot-only participant whose mutations applied at stage time.
    Applied,
    /// Native participant passed Phase 1.
    Prepared,
    /// Native participant committed in Phase 2.
    Committed,
    /// Participant rolled back (native) or restored (snapshot).
    RolledBack,
    /// Phase not reached for this participant.
    Pending,
    /// Phase 1 failure with cause.
    PrepareFailed(String),
    /// Phase 2 failure with cause.
    CommitFailed(String),
    /// Best-effort rollback failed with cause.
    RollbackFailed(String),
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Prepared => write!(f, "prepared"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled-back"),
            Self::Pending => write!(f, "pending"),
            Self::PrepareFailed(cause) => write!(f, "prepare failed: {cause}"),
            Self::CommitFailed(cause) => write!(f, "commit failed: {cause}"),
            Self::RollbackFailed(cause) => write!(f, "rollback failed: {cause}"),
        }
    }
}

/// Outcome summary returned by a successful `commit` or `rollback`.
#[derive(Debug, Clone)]
pub struct TransactionReport {
    /// The transaction this report describes.
    pub transaction_id: TransactionId,
    /// Terminal phase reached.
    pub phase: TransactionPhase,
    /// Per-participant status, in participant order.
    pub participants: Vec<(String, ParticipantStatus)>,
}

enum RollbackPath {
    Native,
    Snapshot(Option<SnapshotHandle>),
}

struct Participant {
    name: String,
    adapter: Arc<dyn MemoryAdapter>,
    path: RollbackPath,
}

impl Participant {
    const fn is_native(&self) -> bool {
        matches!(self.path, RollbackPath::Native)
    }

    fn release_snapshot(&mut self) {
        if let RollbackPath::Snapshot(handle) = &mut self.path
            && let Some(handle) = handle.take()
            && let Some(snapshots) = self.adapter.snapshots()
        {
            snapshots.release(&handle);
        }
    }
}

struct TransactionContext {
    id: TransactionId,
    phase: TransactionPhase,
    participants: Vec<Participant>,
    staged_count: usize,
}

impl Drop for TransactionContext {
    // Snapshot handles are released exactly once, here, whatever path
    // destroyed the context.
    fn drop(&mut self) {
        for participant in &mut self.participants {
            participant.release_snapshot();
        }
    }
}

/// Coordinates two-phase transactions over registered adapters.
///
/// Distinct transactions never contend at the coordinator: the shared map is
/// locked only to look up the per-transaction slot, and all adapter calls
/// happen under the transaction's own lock. Serializing two transactions
/// that touch the same adapter and key is the adapter's contract.
pub struct TransactionCoordinator {
    adapters: Arc<dyn AdapterLookup>,
    contexts: Mutex<HashMap<TransactionId, Arc<Mutex<TransactionContext>>>>,
    outcomes: Mutex<OutcomeLog>,
}

/// Insertion-ordered record of terminal phases, capped at
/// [`OUTCOME_LOG_CAPACITY`]; the oldest entry is evicted first.
#[derive(Default)]
struct OutcomeLog {
    order: VecDeque<TransactionId>,
    phases: HashMap<TransactionId, TransactionPhase>,
}

impl OutcomeLog {
    fn record(&mut self, id: &TransactionId, phase: TransactionPhase) {
        if self.phases.insert(id.clone(), phase).is_none() {
            self.order.push_back(id.clone());
        }
        while self.order.len() > OUTCOME_LOG_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.phases.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &TransactionId) -> Option<TransactionPhase> {
        self.phases.get(id).copied()
    }
}

impl TransactionCoordinator {
    /// Creates a coordinator over the given adapter lookup.
    #[must_use]
    pub fn new(adapters: Arc<dyn AdapterLookup>) -> Self {
        Self {
            adapters,
            contexts: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(OutcomeLog::default()),
        }
    }

    /// Opens a transaction over the named stores, in the given order.
    ///
    /// Fails fast, creating no transaction, if the participant list is empty
    /// or contains duplicates, if a name is not registered, or if an adapter
    /// supports neither native transactions nor snapshot/restore. For
    /// snapshot-only participants a snapshot is captured here; for native
    /// participants the adapter's own transaction is opened.
    pub fn begin(&self, participant_names: &[&str]) -> Result<TransactionId> {
        if participant_names.is_empty() {
            return Err(Error::InvalidInput(
                "transaction requires at least one participant".to_string(),
            ));
        }
        let id = TransactionId::generate();
        let mut participants: Vec<Participant> = Vec::with_capacity(participant_names.len());

        for name in participant_names {
            let result = self.bind_participant(&id, name, &participants);
            match result {
                Ok(participant) => participants.push(participant),
                Err(error) => {
                    Self::unwind_begin(&id, &mut participants);
                    return Err(error);
                },
            }
        }

        tracing::debug!(
            transaction_id = %id,
            participants = ?participant_names,
            "transaction begun"
        );
        metrics::counter!("crosstore_transactions_total", "outcome" => "begun").increment(1);

        let context = TransactionContext {
            id: id.clone(),
            phase: TransactionPhase::Begun,
            participants,
            staged_count: 0,
        };
        self.locked_contexts()
            .insert(id.clone(), Arc::new(Mutex::new(context)));
        Ok(id)
    }

    fn bind_participant(
        &self,
        id: &TransactionId,
        name: &str,
        bound: &[Participant],
    ) -> Result<Participant> {
        if bound.iter().any(|p| p.name == name) {
            return Err(Error::InvalidInput(format!(
                "store '{name}' bound twice into one transaction"
            )));
        }
        let adapter = self.adapters.adapter(name).ok_or_else(|| {
            Error::InvalidInput(format!("unknown store '{name}'"))
        })?;

        let capabilities = adapter.capabilities();
        if capabilities.native_transactions
            && let Some(transactional) = adapter.transactional()
        {
            transactional.begin_transaction(id)?;
            return Ok(Participant {
                name: name.to_string(),
                adapter: Arc::clone(&adapter),
                path: RollbackPath::Native,
            });
        }
        if capabilities.snapshot_restore
            && let Some(snapshots) = adapter.snapshots()
        {
            let handle = snapshots.snapshot()?;
            return Ok(Participant {
                name: name.to_string(),
                adapter: Arc::clone(&adapter),
                path: RollbackPath::Snapshot(Some(handle)),
            });
        }
        Err(Error::InvalidInput(format!(
            "store '{name}' supports neither native transactions nor snapshots"
        )))
    }

    // No mutations have happened yet, so releasing is enough for snapshot
    // participants; native ones get a best-effort rollback.
    fn unwind_begin(id: &TransactionId, participants: &mut Vec<Participant>) {
        for participant in participants.iter_mut() {
            match &participant.path {
                RollbackPath::Native => {
                    if let Some(transactional) = participant.adapter.transactional()
                        && let Err(error) = transactional.rollback(id)
                    {
                        tracing::warn!(
                            transaction_id = %id,
                            store = participant.name,
                            error = %error,
                            "rollback during begin unwind failed"
                        );
                    }
                },
                RollbackPath::Snapshot(_) => participant.release_snapshot(),
            }
        }
        participants.clear();
    }

    /// Stages a mutation against one participant.
    ///
    /// Native participants buffer the mutation through their transactional
    /// write path, invisible until commit. Snapshot-only participants apply
    /// it immediately; the snapshot captured at `begin` undoes it on
    /// rollback.
    pub fn stage(
        &self,
        transaction_id: &TransactionId,
        store: &str,
        operation: StagedOperation,
    ) -> Result<()> {
        let slot = self.context(transaction_id)?;
        let mut context = lock_context(&slot);
        if context.phase != TransactionPhase::Begun {
            return Err(Error::InvalidInput(format!(
                "transaction '{transaction_id}' is {} and not open for staging",
                context.phase
            )));
        }
        let participant = context
            .participants
            .iter()
            .find(|p| p.name == store)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "store '{store}' is not a participant of transaction '{transaction_id}'"
                ))
            })?;

        match &participant.path {
            RollbackPath::Native => {
                let transactional = participant.adapter.transactional().ok_or_else(|| {
                    Error::OperationFailed {
                        operation: "stage".to_string(),
                        cause: format!("store '{store}' lost its transactional surface"),
                    }
                })?;
                transactional.stage(transaction_id, &operation)?;
            },
            RollbackPath::Snapshot(_) => match &operation {
                StagedOperation::Store(item) => {
                    participant.adapter.store(item)?;
                },
                StagedOperation::Delete(id) => {
                    participant.adapter.delete(id)?;
                },
            },
        }
        context.staged_count += 1;
        Ok(())
    }

    /// Runs the two-phase commit protocol.
    ///
    /// On a Phase 1 failure every participant is rolled back and
    /// [`Error::TransactionPrepare`] is returned; the write set is intact
    /// nowhere. On a Phase 2 failure the transaction ends [`Failed`] with
    /// [`Error::TransactionCommit`] carrying every participant's status;
    /// nothing is retried or undone. Either way the context is destroyed and
    /// snapshot handles are released.
    ///
    /// [`Failed`]: TransactionPhase::Failed
    pub fn commit(&self, transaction_id: &TransactionId) -> Result<TransactionReport> {
        let slot = self.take_context(transaction_id)?;
        let mut context = lock_context(&slot);
        if context.phase != TransactionPhase::Begun {
            return Err(Error::InvalidInput(format!(
                "transaction '{transaction_id}' is {} and cannot commit",
                context.phase
            )));
        }

        // Phase 1.
        context.phase = TransactionPhase::Preparing;
        if let Err(error) = Self::prepare_all(&mut context) {
            self.record_outcome(transaction_id, TransactionPhase::RolledBack);
            metrics::counter!("crosstore_transactions_total", "outcome" => "prepare_failed")
                .increment(1);
            return Err(error);
        }
        context.phase = TransactionPhase::Prepared;

        // Phase 2.
        context.phase = TransactionPhase::Committing;
        let report = Self::commit_all(&mut context);
        self.record_outcome(transaction_id, context.phase);
        match &report {
            Ok(_) => {
                tracing::info!(
                    transaction_id = %transaction_id,
                    staged = context.staged_count,
                    "transaction committed"
                );
                metrics::counter!("crosstore_transactions_total", "outcome" => "committed")
                    .increment(1);
            },
            Err(error) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %error,
                    "transaction failed during commit; manual reconciliation required"
                );
                metrics::counter!("crosstore_transactions_total", "outcome" => "failed")
                    .increment(1);
            },
        }
        report
    }

    fn prepare_all(context: &mut TransactionContext) -> Result<()> {
        let mut failure: Option<(String, String)> = None;

        for participant in &context.participants {
            if !participant.is_native() {
                continue;
            }
            let Some(transactional) = participant.adapter.transactional() else {
                failure = Some((
                    participant.name.clone(),
                    "transactional surface unavailable".to_string(),
                ));
                break;
            };
            if let Err(error) = transactional.prepare_commit(&context.id) {
                failure = Some((participant.name.clone(), error.to_string()));
                break;
            }
        }

        let Some((failed_store, cause)) = failure else {
            return Ok(());
        };

        tracing::warn!(
            transaction_id = %context.id,
            store = failed_store,
            cause,
            "prepare failed; rolling back all participants"
        );
        context.phase = TransactionPhase::RollingBack;
        Self::rollback_all(context);
        context.phase = TransactionPhase::RolledBack;

        Err(Error::TransactionPrepare {
            transaction_id: context.id.to_string(),
            failures: vec![(failed_store, cause)],
        })
    }

    fn commit_all(context: &mut TransactionContext) -> Result<TransactionReport> {
        let mut statuses: Vec<(String, ParticipantStatus)> = context
            .participants
            .iter()
            .map(|p| {
                let status = if p.is_native() {
                    ParticipantStatus::Prepared
                } else {
                    ParticipantStatus::Applied
                };
                (p.name.clone(), status)
            })
            .collect();

        for (index, participant) in context.participants.iter().enumerate() {
            if !participant.is_native() {
                continue;
            }
            let outcome = participant
                .adapter
                .transactional()
                .ok_or_else(|| Error::OperationFailed {
                    operation: "commit".to_string(),
                    cause: format!("store '{}' lost its transactional surface", participant.name),
                })
                .and_then(|t| t.commit(&context.id));

            match outcome {
                Ok(()) => statuses[index].1 = ParticipantStatus::Committed,
                Err(error) => {
                    statuses[index].1 = ParticipantStatus::CommitFailed(error.to_string());
                    for pending in statuses.iter_mut().skip(index + 1) {
                        if matches!(pending.1, ParticipantStatus::Prepared) {
                            pending.1 = ParticipantStatus::Pending;
                        }
                    }
                    context.phase = TransactionPhase::Failed;
                    return Err(Error::TransactionCommit {
                        transaction_id: context.id.to_string(),
                        statuses: statuses
                            .iter()
                            .map(|(name, status)| (name.clone(), status.to_string()))
                            .collect(),
                    });
                },
            }
        }

        context.phase = TransactionPhase::Committed;
        Ok(TransactionReport {
            transaction_id: context.id.clone(),
            phase: TransactionPhase::Committed,
            participants: statuses,
        })
    }

    /// Rolls back an open transaction.
    ///
    /// Native participants roll back through their adapter; snapshot-only
    /// participants are restored from the handle captured at `begin`.
    /// Individual rollback failures are logged and do not prevent the
    /// context from being released.
    pub fn rollback(&self, transaction_id: &TransactionId) -> Result<TransactionReport> {
        let slot = self.take_context(transaction_id)?;
        let mut context = lock_context(&slot);
        if context.phase != TransactionPhase::Begun {
            return Err(Error::InvalidInput(format!(
                "transaction '{transaction_id}' is {} and cannot roll back",
                context.phase
            )));
        }

        context.phase = TransactionPhase::RollingBack;
        let statuses = Self::rollback_all(&mut context);
        context.phase = TransactionPhase::RolledBack;
        self.record_outcome(transaction_id, TransactionPhase::RolledBack);

        tracing::info!(transaction_id = %transaction_id, "transaction rolled back");
        metrics::counter!("crosstore_transactions_total", "outcome" => "rolled_back")
            .increment(1);

        Ok(TransactionReport {
            transaction_id: transaction_id.clone(),
            phase: TransactionPhase::RolledBack,
            participants: statuses,
        })
    }

    fn rollback_all(context: &mut TransactionContext) -> Vec<(String, ParticipantStatus)> {
        let id = context.id.clone();
        context
            .participants
            .iter()
            .map(|participant| {
                let outcome = match &participant.path {
                    RollbackPath::Native => participant
                        .adapter
                        .transactional()
                        .map_or(Ok(()), |t| t.rollback(&id)),
                    RollbackPath::Snapshot(handle) => match (handle, participant.adapter.snapshots())
                    {
                        (Some(handle), Some(snapshots)) => snapshots.restore(handle),
                        _ => Ok(()),
                    },
                };
                let status = match outcome {
                    Ok(()) => ParticipantStatus::RolledBack,
                    Err(error) => {
                        tracing::warn!(
                            transaction_id = %id,
                            store = participant.name,
                            error = %error,
                            "best-effort rollback failed"
                        );
                        ParticipantStatus::RollbackFailed(error.to_string())
                    },
                };
                (participant.name.clone(), status)
            })
            .collect()
    }

    /// Current phase of a transaction: live phase for open transactions,
    /// recorded terminal phase for finished ones, `None` for unknown ids.
    #[must_use]
    pub fn phase(&self, transaction_id: &TransactionId) -> Option<TransactionPhase> {
        if let Some(slot) = self.locked_contexts().get(transaction_id).map(Arc::clone) {
            return Some(lock_context(&slot).phase);
        }
        self.locked_outcomes().get(transaction_id)
    }

    /// Number of currently open transactions.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.locked_contexts().len()
    }

    fn context(&self, id: &TransactionId) -> Result<Arc<Mutex<TransactionContext>>> {
        self.locked_contexts()
            .get(id)
            .map(Arc::clone)
            .ok_or_else(|| Error::InvalidInput(format!("unknown transaction '{id}'")))
    }

    fn take_context(&self, id: &TransactionId) -> Result<Arc<Mutex<TransactionContext>>> {
        self.locked_contexts()
            .remove(id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown transaction '{id}'")))
    }

    fn record_outcome(&self, id: &TransactionId, phase: TransactionPhase) {
        self.locked_outcomes().record(id, phase);
    }

    fn locked_contexts(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TransactionId, Arc<Mutex<TransactionContext>>>> {
        self.contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn locked_outcomes(&self) -> std::sync::MutexGuard<'_, OutcomeLog> {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn lock_context(slot: &Arc<Mutex<TransactionContext>>) -> std::sync::MutexGuard<'_, TransactionContext> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
