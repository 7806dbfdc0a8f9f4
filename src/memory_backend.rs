//! In-process record backend
//!
//! Stands in for Redis or PostgreSQL when running a tier without external
//! services (tests, single-node deployments). Clones share storage, so a
//! handle kept outside the pool can inspect entries and simulate outages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::pool::ConnectionManager;
use crate::remote_tier::RecordBackend;

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

struct MemoryState {
    name: String,
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
    native_ttl: AtomicBool,
    connects: AtomicUsize,
    fetches: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

/// Connection handle; carries nothing but the shared state
pub struct MemoryConnection {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(MemoryState {
                name: name.into(),
                entries: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                native_ttl: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Toggle expiry of stored values by the `ttl` passed to `store`
    pub fn set_native_ttl(&self, enabled: bool) {
        self.state.native_ttl.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored bytes under `key`, bypassing availability and expiry
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .entries
            .lock()
            .get(key)
            .map(|value| value.bytes.clone())
    }

    /// Store bytes under `key` without expiry
    pub fn raw_put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.state.entries.lock().insert(
            key.into(),
            StoredValue {
                bytes,
                expires_at: None,
            },
        );
    }
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Backend(
                format!("backend {} is unreachable", self.name).into(),
            ))
        }
    }
}

#[async_trait]
impl ConnectionManager for MemoryBackend {
    type Connection = MemoryConnection;

    fn name(&self) -> &str {
        &self.state.name
    }

    async fn connect(&self) -> Result<MemoryConnection, CacheError> {
        self.state.ensure_available()?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }

    async fn ping(&self, conn: &mut MemoryConnection) -> Result<(), CacheError> {
        conn.state.ensure_available()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn fetch(
        &self,
        conn: &mut MemoryConnection,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        conn.state.ensure_available()?;
        conn.state.fetches.fetch_add(1, Ordering::SeqCst);
        let mut entries = conn.state.entries.lock();
        let expired = entries
            .get(key)
            .and_then(|value| value.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|value| value.bytes.clone()))
    }

    async fn store(
        &self,
        conn: &mut MemoryConnection,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        conn.state.ensure_available()?;
        let expires_at = conn
            .state
            .native_ttl
            .load(Ordering::SeqCst)
            .then(|| Instant::now() + ttl);
        conn.state.entries.lock().insert(
            key.to_owned(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, conn: &mut MemoryConnection, key: &str) -> Result<(), CacheError> {
        conn.state.ensure_available()?;
        conn.state.entries.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self, conn: &mut MemoryConnection) -> Result<u64, CacheError> {
        conn.state.ensure_available()?;
        let now = Instant::now();
        let mut entries = conn.state.entries.lock();
        let before = entries.len();
        entries.retain(|_, value| value.expires_at.is_none_or(|at| at > now));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_ttl_and_outage() {
        let backend = MemoryBackend::new("mem");
        let mut conn = backend.connect().await.unwrap();

        backend
            .store(&mut conn, "a", b"1", Duration::from_secs(60))
            .await
            .unwrap();
        backend.store(&mut conn, "b", b"2", Duration::ZERO).await.unwrap();
        backend.store(&mut conn, "c", b"3", Duration::ZERO).await.unwrap();
        assert_eq!(backend.purge_expired(&mut conn).await.unwrap(), 1);
        assert_eq!(backend.raw_get("c"), None);
        assert_eq!(backend.fetch(&mut conn, "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.fetch(&mut conn, "b").await.unwrap(), None);
        assert_eq!(backend.len(), 1);

        backend.set_available(false);
        assert!(backend.fetch(&mut conn, "a").await.is_err());
        assert!(backend.ping(&mut conn).await.is_err());
        assert!(backend.connect().await.is_err());

        backend.set_available(true);
        backend.delete(&mut conn, "a").await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.connect_count(), 1);
    }
}
