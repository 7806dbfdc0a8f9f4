//! L2/L3 tier adapter over a pooled backend
//!
//! Records leave the process only as encrypted envelopes:
//!
//! ```text
//! key   = formatted username
//! value = {"v":1,"key_id":..,"nonce":..,"ciphertext":..,"expires_at_ms":..}
//! ```
//!
//! `expires_at_ms` is checked on every read independently of any TTL the
//! backend enforces natively, so a logically stale entry is rejected even if
//! the backend still returns it. The formatted key and the expiry are bound to
//! the ciphertext as associated data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{NONCE_SIZE, StorageCipher, StorageCiphertext};
use crate::error::{CacheError, CryptoError, PoolError};
use crate::pool::{ConnectionManager, ConnectionPool, PoolStatus, PooledConnection};
use crate::record::{CacheTier, UserRecord, now_ms};
use crate::tier::TierStore;

const ENVELOPE_VERSION: u8 = 1;

/// Key/value operations a pooled backend must offer to host a tier
#[async_trait]
pub trait RecordBackend: ConnectionManager {
    async fn fetch(
        &self,
        conn: &mut Self::Connection,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value`, replacing any previous value atomically; `ttl` is a hint
    /// for backends with native expiry
    async fn store(
        &self,
        conn: &mut Self::Connection,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, conn: &mut Self::Connection, key: &str) -> Result<(), CacheError>;

    /// Drop entries past their expiry, returning how many were removed;
    /// backends with native expiry have nothing to do
    async fn purge_expired(&self, _conn: &mut Self::Connection) -> Result<u64, CacheError> {
        Ok(0)
    }
}

/// Trait for generating backend keys from usernames
pub trait KeyFormatter: Send + Sync + 'static {
    fn format_key(&self, username: &str) -> String;
}

/// Formats keys as `<prefix><username>`
#[derive(Debug, Clone)]
pub struct PrefixKeyFormatter {
    prefix: String,
}

impl PrefixKeyFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyFormatter for PrefixKeyFormatter {
    fn format_key(&self, username: &str) -> String {
        format!("{}{}", self.prefix, username)
    }
}

/// Persisted layout of a record in L2/L3
#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    v: u8,
    key_id: String,
    nonce: String,
    ciphertext: String,
    expires_at_ms: i64,
}

fn associated_data(key: &str, expires_at_ms: i64) -> Vec<u8> {
    format!("{key}|{expires_at_ms}").into_bytes()
}

impl StoredEnvelope {
    fn seal(
        cipher: &StorageCipher,
        key: &str,
        record: &UserRecord,
        expires_at_ms: i64,
    ) -> Result<Vec<u8>, CacheError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(record)?);
        let sealed = cipher.encrypt(&plaintext, &associated_data(key, expires_at_ms))?;
        let envelope = StoredEnvelope {
            v: ENVELOPE_VERSION,
            key_id: sealed.key_id,
            nonce: BASE64.encode(sealed.nonce),
            ciphertext: BASE64.encode(&sealed.ciphertext),
            expires_at_ms,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn open(&self, cipher: &StorageCipher, key: &str) -> Result<UserRecord, CacheError> {
        if self.v != ENVELOPE_VERSION {
            return Err(CryptoError::Decrypt.into());
        }
        let nonce: [u8; NONCE_SIZE] = BASE64
            .decode(&self.nonce)
            .map_err(CryptoError::from)?
            .try_into()
            .map_err(|_| CryptoError::Decrypt)?;
        let sealed = StorageCiphertext {
            key_id: self.key_id.clone(),
            nonce,
            ciphertext: BASE64.decode(&self.ciphertext).map_err(CryptoError::from)?,
        };
        let plaintext = cipher.decrypt(&sealed, &associated_data(key, self.expires_at_ms))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// A remote cache tier: encrypted envelopes in a pooled key/value backend
pub struct RemoteTier<B: RecordBackend> {
    tier: CacheTier,
    pool: Arc<ConnectionPool<B>>,
    cipher: StorageCipher,
    ttl: Duration,
    key_formatter: Box<dyn KeyFormatter>,
}

impl<B: RecordBackend> RemoteTier<B> {
    pub fn new(
        tier: CacheTier,
        pool: ConnectionPool<B>,
        cipher: StorageCipher,
        ttl: Duration,
        key_formatter: impl KeyFormatter,
    ) -> Self {
        Self {
            tier,
            pool: Arc::new(pool),
            cipher,
            ttl,
            key_formatter: Box::new(key_formatter),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<B>> {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Start the pool's periodic health probe
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        ConnectionPool::spawn_health_monitor(&self.pool)
    }

    async fn borrow(&self) -> Result<PooledConnection<'_, B>, CacheError> {
        self.pool.get().await.map_err(|e| self.unavailable(e.into()))
    }

    /// Pool timeouts and an unhealthy pool mean the tier cannot answer
    fn unavailable(&self, e: CacheError) -> CacheError {
        match e {
            CacheError::Pool(PoolError::Unhealthy | PoolError::Timeout(_)) => {
                CacheError::TierUnavailable(self.tier)
            }
            e => e,
        }
    }

    /// Close a connection whose operation failed
    async fn release_failed(&self, mut conn: PooledConnection<'_, B>, e: CacheError) -> CacheError {
        conn.mark_invalid();
        self.pool.return_connection(conn).await;
        self.unavailable(e)
    }

    /// Best-effort delete on an already borrowed connection
    async fn discard_entry(&self, conn: &mut B::Connection, key: &str, username: &str) {
        if let Err(e) = self.pool.timed(self.pool.manager().delete(conn, key)).await {
            warn!(
                "{} DEL error for key {} while discarding entry: {}",
                self.tier, username, e
            );
        }
    }
}

#[async_trait]
impl<B: RecordBackend> TierStore for RemoteTier<B> {
    fn tier(&self) -> CacheTier {
        self.tier
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_available(&self) -> bool {
        self.pool.is_healthy()
    }

    async fn get(&self, username: &str) -> Result<Option<UserRecord>, CacheError> {
        let key = self.key_formatter.format_key(username);
        let mut conn = self.borrow().await?;

        let fetched = self
            .pool
            .timed(self.pool.manager().fetch(&mut *conn, &key))
            .await;
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => return Err(self.release_failed(conn, e).await),
        };

        let Some(raw) = raw else {
            debug!("Cache miss {} for key: {}", self.tier, username);
            self.pool.return_connection(conn).await;
            return Ok(None);
        };

        let result = match serde_json::from_slice::<StoredEnvelope>(&raw) {
            Ok(envelope) if envelope.expires_at_ms <= now_ms() => {
                debug!("{} entry for key {} is past its expiry, deleting", self.tier, username);
                self.discard_entry(&mut *conn, &key, username).await;
                None
            }
            Ok(envelope) => match envelope.open(&self.cipher, &key) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        "Failed to open {} entry for key {}: {}. Deleting corrupt entry.",
                        self.tier, username, e
                    );
                    self.discard_entry(&mut *conn, &key, username).await;
                    None
                }
            },
            Err(e) => {
                warn!(
                    "Failed to deserialize {} envelope for key {}: {}. Deleting corrupt entry.",
                    self.tier, username, e
                );
                self.discard_entry(&mut *conn, &key, username).await;
                None
            }
        };

        self.pool.return_connection(conn).await;
        Ok(result)
    }

    async fn put(&self, record: &UserRecord) -> Result<(), CacheError> {
        let key = self.key_formatter.format_key(&record.username);
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms().saturating_add(ttl_ms);
        let value = StoredEnvelope::seal(&self.cipher, &key, record, expires_at_ms)?;

        let mut conn = self.borrow().await?;
        let stored = self
            .pool
            .timed(self.pool.manager().store(&mut *conn, &key, &value, self.ttl))
            .await;
        match stored {
            Ok(()) => {
                self.pool.return_connection(conn).await;
                Ok(())
            }
            Err(e) => Err(self.release_failed(conn, e).await),
        }
    }

    async fn remove(&self, username: &str) -> Result<(), CacheError> {
        let key = self.key_formatter.format_key(username);
        let mut conn = self.borrow().await?;
        let deleted = self
            .pool
            .timed(self.pool.manager().delete(&mut *conn, &key))
            .await;
        match deleted {
            Ok(()) => {
                self.pool.return_connection(conn).await;
                Ok(())
            }
            Err(e) => Err(self.release_failed(conn, e).await),
        }
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let mut conn = self.borrow().await?;
        let purged = self
            .pool
            .timed(self.pool.manager().purge_expired(&mut *conn))
            .await;
        match purged {
            Ok(count) => {
                self.pool.return_connection(conn).await;
                Ok(count)
            }
            Err(e) => Err(self.release_failed(conn, e).await),
        }
    }

    async fn health_check(&self) -> bool {
        self.pool.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::memory_backend::MemoryBackend;

    fn tier(backend: &MemoryBackend, ttl: Duration) -> RemoteTier<MemoryBackend> {
        RemoteTier::new(
            CacheTier::L2,
            ConnectionPool::new(backend.clone(), PoolConfig::default()),
            StorageCipher::new("test", [3u8; 32]),
            ttl,
            PrefixKeyFormatter::new("user:"),
        )
    }

    fn record() -> UserRecord {
        UserRecord::new("alice", "$argon2id$v=19$m=1024,t=1,p=1$c2FsdHNhbHRzYWx0$aGFzaA")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let backend = MemoryBackend::new("l2");
        let l2 = tier(&backend, Duration::from_secs(60));

        l2.put(&record()).await.unwrap();
        let found = l2.get("alice").await.unwrap().unwrap();
        assert_eq!(found.username, "alice");
        assert_eq!(found.credential_hash, record().credential_hash);
        assert!(l2.get("bob").await.unwrap().is_none());
        assert_eq!(l2.pool_status().idle, 1);
    }

    #[tokio::test]
    async fn test_value_is_encrypted_at_rest() {
        let backend = MemoryBackend::new("l2");
        let l2 = tier(&backend, Duration::from_secs(60));
        l2.put(&record()).await.unwrap();

        let raw = backend.raw_get("user:alice").unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("\"expires_at_ms\""));
        assert!(!text.contains("argon2id"));
        assert!(!text.contains("credential_hash"));
    }

    #[tokio::test]
    async fn test_logically_stale_entry_is_rejected() {
        let backend = MemoryBackend::new("l2");
        // Zero TTL: the backend keeps the bytes but the envelope is already expired
        let l2 = tier(&backend, Duration::ZERO);
        backend.set_native_ttl(false);
        l2.put(&record()).await.unwrap();
        assert!(backend.raw_get("user:alice").is_some());

        assert!(l2.get("alice").await.unwrap().is_none());
        assert!(backend.raw_get("user:alice").is_none());
    }

    #[tokio::test]
    async fn test_tampered_entry_is_deleted() {
        let backend = MemoryBackend::new("l2");
        let l2 = tier(&backend, Duration::from_secs(60));
        l2.put(&record()).await.unwrap();

        // Move alice's envelope under bob's key: associated data no longer matches
        let raw = backend.raw_get("user:alice").unwrap();
        backend.raw_put("user:bob", raw);
        assert!(l2.get("bob").await.unwrap().is_none());
        assert!(backend.raw_get("user:bob").is_none());

        backend.raw_put("user:carol", b"not json".to_vec());
        assert!(l2.get("carol").await.unwrap().is_none());
        assert!(backend.raw_get("user:carol").is_none());
    }

    #[tokio::test]
    async fn test_other_storage_key_cannot_read() {
        let backend = MemoryBackend::new("l2");
        let l2 = tier(&backend, Duration::from_secs(60));
        l2.put(&record()).await.unwrap();

        let foreign = RemoteTier::new(
            CacheTier::L2,
            ConnectionPool::new(backend.clone(), PoolConfig::default()),
            StorageCipher::new("test", [4u8; 32]),
            Duration::from_secs(60),
            PrefixKeyFormatter::new("user:"),
        );
        assert!(foreign.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_drops_expired_entries() {
        let backend = MemoryBackend::new("l3");
        let l3 = tier(&backend, Duration::ZERO);
        l3.put(&record()).await.unwrap();
        assert_eq!(backend.len(), 1);

        assert_eq!(l3.purge_expired().await.unwrap(), 1);
        assert!(backend.is_empty());
        assert_eq!(l3.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_error() {
        let backend = MemoryBackend::new("l2");
        let l2 = tier(&backend, Duration::from_secs(60));
        l2.put(&record()).await.unwrap();

        backend.set_available(false);
        assert!(l2.get("alice").await.is_err());
        assert!(l2.put(&record()).await.is_err());

        backend.set_available(true);
        assert!(l2.health_check().await);
        assert!(l2.get("alice").await.unwrap().is_some());
    }
}
