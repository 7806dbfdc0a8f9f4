//! Cache error types

use std::time::Duration;

use redis::RedisError;

use crate::CacheTier;

/// Boxed error returned by external collaborators (loaders, custom backends)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Tier {0} unavailable")]
    TierUnavailable(CacheTier),

    #[error("L1 is in security lockdown")]
    Lockdown,

    #[error("Backend error: {0}")]
    Backend(#[from] BoxError),
}

/// Errors raised by the pooled backend connector
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    #[error("Backend is unhealthy")]
    Unhealthy,

    #[error("Failed to connect: {0}")]
    Connect(String),
}

/// Encryption and decryption errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Key generation {0} has been retired")]
    RetiredKey(u64),

    #[error("Unknown key id: {0}")]
    UnknownKey(String),

    #[error("Invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Credential hashing and verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("Malformed credential hash: {0}")]
    MalformedHash(String),

    #[error("Unsupported hash scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Password hashing failed: {0}")]
    HashingFailed(String),
}
