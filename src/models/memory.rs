//! Memory item types and identifiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a memory item.
///
/// Uniqueness is guaranteed within a single backend, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Creates a new memory ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A memory item stored across one or more backends.
///
/// The payload is opaque to the coordinator; only the identifier, type tag,
/// metadata, and version participate in routing and conflict decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier within a backend.
    pub id: MemoryId,
    /// Type tag used for query filtering.
    pub item_type: String,
    /// Opaque payload.
    pub content: Value,
    /// JSON-compatible metadata keyed by string.
    pub metadata: BTreeMap<String, Value>,
    /// Monotonically comparable version. Non-decreasing for a given
    /// identifier within a backend.
    pub version: u64,
    /// Last update timestamp (Unix epoch seconds).
    pub updated_at: u64,
}

impl MemoryItem {
    /// Creates a memory item at version 1 with the current timestamp.
    #[must_use]
    pub fn new(id: impl Into<MemoryId>, item_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            item_type: item_type.into(),
            content,
            metadata: BTreeMap::new(),
            version: 1,
            updated_at: crate::current_timestamp(),
        }
    }

    /// Adds a metadata entry, builder-style.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the version, builder-style.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns a copy of this item at the next version with a fresh
    /// timestamp.
    #[must_use]
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version.saturating_add(1);
        next.updated_at = crate::current_timestamp();
        next
    }

    /// Returns `true` if `other` is a newer revision of the same item.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.id == other.id && self.version < other.version
    }
}

/// Criteria for cross-store queries.
///
/// All present fields must match; an empty criteria matches every item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCriteria {
    /// Match the item type tag exactly.
    pub item_type: Option<String>,
    /// Metadata keys that must be present with exactly these values.
    pub metadata: BTreeMap<String, Value>,
}

impl QueryCriteria {
    /// Criteria matching every item.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to a single item type, builder-style.
    #[must_use]
    pub fn with_item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    /// Requires a metadata key/value pair, builder-style.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns `true` if `item` satisfies every present criterion.
    #[must_use]
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if let Some(item_type) = &self.item_type
            && item.item_type != *item_type
        {
            return false;
        }
        self.metadata
            .iter()
            .all(|(key, value)| item.metadata.get(key) == Some(value))
    }
}

/// Per-adapter capability flags.
///
/// Every participant bound into a transaction must support at least one of
/// the two capabilities; binding an adapter with neither is a configuration
/// error detected at `begin` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterCapabilities {
    /// The adapter exposes begin/prepare/commit/rollback natively.
    pub native_transactions: bool,
    /// The adapter can snapshot its state and restore it later.
    pub snapshot_restore: bool,
}

impl AdapterCapabilities {
    /// Capability set for a natively transactional adapter.
    #[must_use]
    pub const fn native() -> Self {
        Self {
            native_transactions: true,
            snapshot_restore: false,
        }
    }

    /// Capability set for a snapshot-only adapter.
    #[must_use]
    pub const fn snapshot_only() -> Self {
        Self {
            native_transactions: false,
            snapshot_restore: true,
        }
    }

    /// Capability set for an adapter supporting both mechanisms.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            native_transactions: true,
            snapshot_restore: true,
        }
    }

    /// Returns `true` if the adapter can participate in a transaction.
    #[must_use]
    pub const fn transactable(&self) -> bool {
        self.native_transactions || self.snapshot_restore
    }
}

/// Opaque, adapter-owned snapshot token.
///
/// The coordinator captures one per snapshot-only participant at `begin` and
/// releases it when the transaction context is destroyed; only the issuing
/// adapter can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotHandle(u64);

impl SnapshotHandle {
    /// Wraps a raw adapter-issued token.
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}
