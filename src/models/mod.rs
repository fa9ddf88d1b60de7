//! Domain models: memory items, identifiers, and capability descriptors.

mod memory;

pub use memory::{AdapterCapabilities, MemoryId, MemoryItem, QueryCriteria, SnapshotHandle};
