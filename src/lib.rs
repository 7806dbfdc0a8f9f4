//! authcache - Tiered authentication cache
//!
//! Answers "is this password correct for this user" without reaching the
//! directory service on every request:
//! - L1: In-process encrypted LRU store (fastest, per instance)
//! - L2: Redis (shared across instances)
//! - L3: PostgreSQL (durable fallback)
//!
//! The cache supports:
//! - Ordered tier lookup with promotion of hits into faster tiers
//! - Graceful degradation when L2 or L3 is unreachable
//! - Pooled backend connections with health checks and automatic recovery
//! - Multi-scheme credential hashing (Argon2id, PBKDF2-SHA256, LDAP SSHA)
//! - Single-flight loads from the directory on a cache miss
//! - Redis pub/sub for invalidation across instances

mod config;
mod crypto;
mod error;
pub mod memory_backend;
mod orchestrator;
mod password;
pub mod pool;
pub mod postgres_backend;
mod record;
pub mod redis_backend;
pub mod remote_tier;
mod secure_store;
pub mod tamper;
mod tier;

pub use config::{CacheConfig, PoolConfig};
pub use crypto::{KeyManager, SealedBlob, StorageCipher, StorageCiphertext};
pub use error::{BoxError, CacheError, CryptoError, HashError, PoolError};
pub use orchestrator::{
    AuthCache, AuthCacheBuilder, InvalidationPublisher, UserLoader, WeakAuthCache,
};
pub use password::{ClearTextPassword, CredentialHasher, HashParams, HashScheme};
pub use record::{
    AccountStatus, AuthenticationOutcome, CacheMetadata, CacheStatistics, CacheTier,
    FailureReason, UserRecord,
};
pub use secure_store::SecureTierStore;
pub use tier::TierStore;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
