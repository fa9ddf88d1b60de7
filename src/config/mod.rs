//! Configuration for the coordinator and its components.
//!
//! Component configs live beside the components they configure; this module
//! aggregates them into a single [`CrosstoreConfig`] and layers environment
//! variable overrides (`CROSSTORE_*`) on top of the defaults.

pub use crate::services::sync::SyncConfig;
pub use crate::storage::resilience::StorageResilienceConfig;
pub use crate::storage::retry::RetryConfig;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct CrosstoreConfig {
    /// Circuit breaker settings, shared by all targets.
    pub resilience: StorageResilienceConfig,
    /// Retry settings for wrapped adapter calls.
    pub retry: RetryConfig,
    /// Background synchronization settings.
    pub sync: SyncConfig,
    /// Capacity of the facade's read-through cache, in items.
    pub cache_capacity: usize,
}

impl Default for CrosstoreConfig {
    fn default() -> Self {
        Self {
            resilience: StorageResilienceConfig::default(),
            retry: RetryConfig::default(),
            sync: SyncConfig::default(),
            cache_capacity: 256,
        }
    }
}

impl CrosstoreConfig {
    /// Loads configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides to every section.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.resilience = self.resilience.with_env_overrides();
        self.retry = self.retry.with_env_overrides();
        self.sync = self.sync.with_env_overrides();
        if let Ok(v) = std::env::var("CROSSTORE_CACHE_CAPACITY")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.cache_capacity = parsed.max(1);
        }
        self
    }

    /// Sets the cache capacity, builder-style.
    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Replaces the resilience section, builder-style.
    #[must_use]
    pub fn with_resilience(mut self, resilience: StorageResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Replaces the retry section, builder-style.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the sync section, builder-style.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
