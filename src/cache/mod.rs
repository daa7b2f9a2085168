//! Result cache
//!
//! Results are keyed by a fingerprint of server, tool and canonicalized
//! arguments. Entries expire after their TTL, checked lazily on lookup and by a
//! periodic sweep. When the cache holds more than `max_keys` entries or
//! `max_size_bytes` estimated bytes, expired entries go first and then live
//! ones in the order given by the eviction policy.
//!
//! Concurrent misses for the same key are not coalesced; both callers compute
//! and the last write wins.

pub mod key;
pub mod pattern;
pub mod store;

pub use key::CacheKey;
pub use pattern::KeyPattern;
pub use store::{CacheConfig, CacheManager, CacheStats, EvictionPolicy};

/// Cache failures. The coordinator logs these and carries on uncached.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("entry of {size} bytes exceeds the cache size limit of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("failed to serialize cache entry: {0}")]
    Serialization(#[from] serde_json::Error),
}
