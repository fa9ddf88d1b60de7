//! Coordinating services layered over the storage adapters.
//!
//! - **Sync**: background write propagation, conflict resolution, and
//!   degraded-mode reconciliation
//! - **Manager**: the facade combining adapters, resilience, transactions,
//!   caching, and sync behind one surface

pub mod manager;
pub mod sync;

pub use manager::{
    FallbackRead, MemoryManager, MemoryManagerBuilder, StoreReceipt, TransactionScope,
};
pub use sync::{
    ConflictRecord, ConflictResolver, LastWriterWins, SyncConfig, SyncManager, SyncStats,
};
