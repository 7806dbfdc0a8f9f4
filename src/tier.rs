//! Common interface over the three cache tiers

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::record::{CacheTier, UserRecord};
use crate::secure_store::SecureTierStore;

/// One cache tier: L1, L2 or L3
///
/// The orchestrator holds tiers in a fixed ordered list and drives all of
/// them through this trait.
#[async_trait]
pub trait TierStore: Send + Sync + 'static {
    /// Which tier this is
    fn tier(&self) -> CacheTier;

    /// TTL stamped on records written to this tier
    fn ttl(&self) -> Duration;

    /// Availability flag, toggled by health checks
    fn is_available(&self) -> bool;

    /// Look up a record; expired copies are reported as absent
    async fn get(&self, username: &str) -> Result<Option<UserRecord>, CacheError>;

    /// Write a record, replacing any previous copy atomically
    async fn put(&self, record: &UserRecord) -> Result<(), CacheError>;

    /// Remove a record
    async fn remove(&self, username: &str) -> Result<(), CacheError>;

    /// Probe the tier's backend and update availability
    async fn health_check(&self) -> bool;

    /// Delete expired entries the backend does not expire on its own
    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(0)
    }
}

#[async_trait]
impl TierStore for SecureTierStore {
    fn tier(&self) -> CacheTier {
        CacheTier::L1
    }

    fn ttl(&self) -> Duration {
        SecureTierStore::ttl(self)
    }

    fn is_available(&self) -> bool {
        !self.is_locked_down()
    }

    async fn get(&self, username: &str) -> Result<Option<UserRecord>, CacheError> {
        Ok(SecureTierStore::get(self, username))
    }

    async fn put(&self, record: &UserRecord) -> Result<(), CacheError> {
        self.try_put(&record.username, record)
    }

    async fn remove(&self, username: &str) -> Result<(), CacheError> {
        SecureTierStore::remove(self, username);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.is_locked_down()
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(SecureTierStore::purge_expired(self) as u64)
    }
}
