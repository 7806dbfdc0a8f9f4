//! L1: in-process encrypted store with LRU eviction
//!
//! Records are serialized, sealed under the rotating L1 key and held in a
//! capacity-bounded LRU map behind a single mutex, so the recency update on a
//! read happens atomically with the read itself. Nothing here performs I/O.
//!
//! Evicted, replaced and removed entries are dropped as [`SealedBlob`]s, which
//! overwrite their ciphertext before the allocation is released. Decrypted
//! plaintext only ever lives in zeroizing buffers.
//!
//! Entries sealed under the key generation retired by the last rotation are
//! re-sealed under the current key when read. Anything older cannot be opened
//! and is evicted.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::crypto::{KeyManager, SealedBlob};
use crate::error::{CacheError, CryptoError};
use crate::record::{StatsCounters, UserRecord, now_ms};
use crate::{CacheConfig, tamper};

struct L1Entry {
    sealed: SealedBlob,
    expires_at: Instant,
}

enum ReadFailure {
    Expired,
    RetiredKey,
    Tampered,
    Corrupt,
}

/// Encrypted, capacity-bounded L1 store
pub struct SecureTierStore {
    entries: Mutex<LruCache<String, L1Entry>>,
    keys: KeyManager,
    ttl: Duration,
    stats: Arc<StatsCounters>,
    violation_threshold: u64,
    violations_since_reset: AtomicU64,
    lockdown: AtomicBool,
}

impl SecureTierStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_stats(config, Arc::new(StatsCounters::default()))
    }

    pub(crate) fn with_stats(config: &CacheConfig, stats: Arc<StatsCounters>) -> Self {
        let capacity = NonZeroUsize::new(config.l1_max_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            keys: KeyManager::new(config.key_rotation_interval),
            ttl: config.l1_ttl,
            stats,
            violation_threshold: config.security_violation_threshold.max(1),
            violations_since_reset: AtomicU64::new(0),
            lockdown: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Presence check that does not touch recency or bookkeeping
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    pub fn key_generation(&self) -> u64 {
        self.keys.current_generation()
    }

    /// Encrypt and insert a record, evicting the least-recently-used entry when
    /// the store is full. Returns `false` when the write was refused.
    pub fn put(&self, key: &str, record: &UserRecord) -> bool {
        match self.try_put(key, record) {
            Ok(()) => true,
            Err(e) => {
                debug!("L1 put refused for key {}: {}", key, e);
                false
            }
        }
    }

    pub(crate) fn try_put(&self, key: &str, record: &UserRecord) -> Result<(), CacheError> {
        if self.is_locked_down() {
            return Err(CacheError::Lockdown);
        }

        let plaintext = Zeroizing::new(serde_json::to_vec(record)?);
        let sealed = self.keys.seal(&plaintext, key.as_bytes())?;
        let entry = L1Entry {
            sealed,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.lock();
        // Lockdown may have been entered while sealing
        if self.is_locked_down() {
            return Err(CacheError::Lockdown);
        }
        if entries.contains(key) {
            entries.put(key.to_owned(), entry);
        } else {
            if entries.len() >= entries.cap().get()
                && let Some((evicted, _)) = entries.pop_lru()
            {
                self.stats.record_eviction();
                debug!("L1 evicted least recently used key: {}", evicted);
            }
            entries.put(key.to_owned(), entry);
        }
        Ok(())
    }

    /// Decrypt a record and mark it most-recently-used
    ///
    /// Bookkeeping (access count, last access) is updated and the entry is
    /// re-sealed under the current key while the lock is held.
    pub fn get(&self, key: &str) -> Option<UserRecord> {
        let result = {
            let mut entries = self.entries.lock();
            let outcome = match entries.get_mut(key) {
                None => return None,
                Some(entry) => self.open_and_touch(key, entry),
            };
            if outcome.is_err() {
                entries.pop(key);
            }
            outcome
        };

        match result {
            Ok(record) => Some(record),
            Err(ReadFailure::Expired) => {
                debug!("L1 entry expired for key: {}", key);
                None
            }
            Err(ReadFailure::RetiredKey) => {
                debug!("L1 entry for key {} sealed under a retired key, evicted", key);
                self.stats.record_eviction();
                None
            }
            Err(ReadFailure::Tampered) => {
                self.record_security_violation("L1 entry failed authentication");
                None
            }
            Err(ReadFailure::Corrupt) => {
                warn!("L1 entry for key {} could not be decoded, removed", key);
                None
            }
        }
    }

    fn open_and_touch(&self, key: &str, entry: &mut L1Entry) -> Result<UserRecord, ReadFailure> {
        if entry.expires_at <= Instant::now() {
            return Err(ReadFailure::Expired);
        }

        let plaintext = match self.keys.open(&entry.sealed, key.as_bytes()) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::RetiredKey(_)) => return Err(ReadFailure::RetiredKey),
            Err(_) => return Err(ReadFailure::Tampered),
        };
        let mut record: UserRecord =
            serde_json::from_slice(&plaintext).map_err(|_| ReadFailure::Corrupt)?;

        record.cache.access_count = record.cache.access_count.saturating_add(1);
        record.cache.last_accessed_ms = now_ms();

        let updated = Zeroizing::new(serde_json::to_vec(&record).map_err(|_| ReadFailure::Corrupt)?);
        match self.keys.seal(&updated, key.as_bytes()) {
            Ok(sealed) => entry.sealed = sealed,
            Err(e) => warn!("L1 re-seal failed for key {}: {}", key, e),
        }

        Ok(record)
    }

    /// Securely erase and remove an entry
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Securely erase every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn rotate_key(&self) -> u64 {
        self.keys.rotate()
    }

    pub fn rotate_key_if_due(&self) -> bool {
        self.keys.rotate_if_due()
    }

    pub fn is_locked_down(&self) -> bool {
        self.lockdown.load(Ordering::SeqCst)
    }

    /// Count a violation; crossing the threshold purges L1 and disables writes
    pub fn record_security_violation(&self, reason: &str) {
        let total = self.stats.record_security_violation();
        let since_reset = self.violations_since_reset.fetch_add(1, Ordering::SeqCst) + 1;
        error!(
            "L1 security violation ({}): {} since reset, {} total",
            reason, since_reset, total
        );

        if since_reset >= self.violation_threshold && !self.lockdown.swap(true, Ordering::SeqCst) {
            self.clear();
            error!(
                "L1 entered security lockdown after {} violations; writes disabled until reset",
                since_reset
            );
        }
    }

    /// Report a violation when a tracer is attached to the process
    pub fn check_for_tracer(&self) -> bool {
        match tamper::tracer_pid() {
            Some(pid) => {
                self.record_security_violation(&format!("tracer attached (pid {pid})"));
                true
            }
            None => false,
        }
    }

    /// Operator reset: leave lockdown and re-enable writes
    pub fn reset_lockdown(&self) {
        self.violations_since_reset.store(0, Ordering::SeqCst);
        if self.lockdown.swap(false, Ordering::SeqCst) {
            warn!("L1 security lockdown reset by operator");
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str) {
        if let Some(entry) = self.entries.lock().peek_mut(key) {
            entry.sealed.corrupt();
        }
    }
}

impl std::fmt::Debug for SecureTierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTierStore")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .field("keys", &self.keys)
            .field("locked_down", &self.is_locked_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> SecureTierStore {
        SecureTierStore::new(&CacheConfig {
            l1_max_capacity: capacity,
            security_violation_threshold: 2,
            ..Default::default()
        })
    }

    fn record(name: &str) -> UserRecord {
        UserRecord::new(name, "{SSHA}aGFzaA==").with_roles(["reader"])
    }

    #[test]
    fn test_put_and_get() {
        let l1 = store(10);
        assert!(l1.put("alice", &record("alice")));

        let first = l1.get("alice").unwrap();
        assert_eq!(first.username, "alice");
        assert_eq!(first.roles, vec!["reader".to_owned()]);
        assert_eq!(first.cache.access_count, 1);

        let second = l1.get("alice").unwrap();
        assert_eq!(second.cache.access_count, 2);
        assert!(second.cache.last_accessed_ms > 0);

        assert!(l1.get("bob").is_none());
    }

    #[test]
    fn test_lru_eviction_order() {
        let stats = Arc::new(StatsCounters::default());
        let l1 = SecureTierStore::with_stats(
            &CacheConfig {
                l1_max_capacity: 2,
                ..Default::default()
            },
            Arc::clone(&stats),
        );

        assert!(l1.put("A", &record("A")));
        assert!(l1.put("B", &record("B")));
        assert!(l1.get("A").is_some());
        assert!(l1.put("C", &record("C")));

        assert!(l1.contains("A"));
        assert!(!l1.contains("B"));
        assert!(l1.contains("C"));
        assert_eq!(l1.len(), 2);
        assert_eq!(stats.snapshot().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let l1 = store(2);
        l1.put("A", &record("A"));
        l1.put("B", &record("B"));
        l1.put("A", &record("A").with_roles(["admin"]));
        assert_eq!(l1.len(), 2);
        assert_eq!(l1.get("A").unwrap().roles, vec!["admin".to_owned()]);
        assert!(l1.contains("B"));
    }

    #[test]
    fn test_expired_entries_are_not_returned() {
        let l1 = SecureTierStore::new(&CacheConfig {
            l1_ttl: Duration::ZERO,
            ..Default::default()
        });
        l1.put("alice", &record("alice"));
        assert!(l1.get("alice").is_none());
        assert!(l1.is_empty());

        l1.put("bob", &record("bob"));
        assert_eq!(l1.purge_expired(), 1);
    }

    #[test]
    fn test_remove() {
        let l1 = store(10);
        l1.put("alice", &record("alice"));
        assert!(l1.remove("alice"));
        assert!(!l1.remove("alice"));
        assert!(l1.get("alice").is_none());
    }

    #[test]
    fn test_rotation_reseals_on_access() {
        let l1 = store(10);
        l1.put("alice", &record("alice"));
        l1.put("bob", &record("bob"));

        l1.rotate_key();
        // Read under the previous generation re-seals with the current key
        assert!(l1.get("alice").is_some());

        l1.rotate_key();
        assert!(l1.get("alice").is_some());
        // bob was never touched and is now two generations behind
        assert!(l1.get("bob").is_none());
        assert!(!l1.is_locked_down());
    }

    #[test]
    fn test_tampering_triggers_lockdown() {
        let l1 = store(10);
        l1.put("alice", &record("alice"));
        l1.put("bob", &record("bob"));

        l1.corrupt("alice");
        assert!(l1.get("alice").is_none());
        assert!(!l1.is_locked_down());

        l1.corrupt("bob");
        assert!(l1.get("bob").is_none());
        assert!(l1.is_locked_down());

        assert!(!l1.put("carol", &record("carol")));
        assert!(l1.is_empty());

        l1.reset_lockdown();
        assert!(l1.put("carol", &record("carol")));
        assert!(l1.get("carol").is_some());
    }
}
