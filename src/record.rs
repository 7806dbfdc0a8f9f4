//! Identity records, tier identifiers, outcomes and statistics

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One of the three cache tiers, in lookup order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheTier::L1 => "L1",
            CacheTier::L2 => "L2",
            CacheTier::L3 => "L3",
        };
        f.write_str(name)
    }
}

/// Account status flags as reported by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub expired: bool,
}

fn default_active() -> bool {
    true
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self {
            active: true,
            locked: false,
            expired: false,
        }
    }
}

impl AccountStatus {
    /// Active, not locked and not expired
    pub fn is_usable(&self) -> bool {
        self.active && !self.locked && !self.expired
    }
}

/// Cache bookkeeping carried with every record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the record entered the cache from the authoritative source (unix ms)
    #[serde(default)]
    pub loaded_at_ms: i64,
    /// When this copy was written into its current tier (unix ms)
    #[serde(default)]
    pub cached_at_ms: i64,
    /// TTL of the tier holding this copy
    #[serde(default)]
    pub ttl_secs: u64,
    /// Number of successful lookups served from this copy
    #[serde(default)]
    pub access_count: u64,
    /// Last successful lookup (unix ms)
    #[serde(default)]
    pub last_accessed_ms: i64,
}

/// Identity resolved from the authoritative directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Username (unique key)
    pub username: String,
    /// Self-describing credential hash
    pub credential_hash: String,
    #[serde(default)]
    pub status: AccountStatus,
    /// Roles granted by the directory
    #[serde(default)]
    pub roles: Vec<String>,
    /// Entitlements and other authorization attributes, opaque to the cache
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    /// Risk and audit metadata, opaque to the cache
    #[serde(default)]
    pub audit: HashMap<String, String>,
    #[serde(default)]
    pub cache: CacheMetadata,
}

impl UserRecord {
    pub fn new(username: impl Into<String>, credential_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            credential_hash: credential_hash.into(),
            status: AccountStatus::default(),
            roles: Vec::new(),
            attributes: HashMap::new(),
            audit: HashMap::new(),
            cache: CacheMetadata::default(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    /// Copy of this record stamped for a tier write
    pub fn stamped(&self, now_ms: i64, ttl: Duration) -> Self {
        let mut copy = self.clone();
        copy.cache.cached_at_ms = now_ms;
        copy.cache.ttl_secs = ttl.as_secs();
        copy
    }
}

/// Why an authentication attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The password did not verify against the cached credential
    InvalidCredentials,
    /// No tier holds the user; the caller should load from the directory
    CacheMiss,
    /// The request exceeded its time budget
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::InvalidCredentials => "INVALID_CREDENTIALS",
            FailureReason::CacheMiss => "CACHE_MISS",
            FailureReason::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Result of one `authenticate` call
#[derive(Debug, Clone)]
pub struct AuthenticationOutcome {
    pub success: bool,
    pub record: Option<Arc<UserRecord>>,
    pub tier: Option<CacheTier>,
    pub elapsed: Duration,
    pub failure: Option<FailureReason>,
}

impl AuthenticationOutcome {
    pub fn success(record: Arc<UserRecord>, tier: CacheTier, elapsed: Duration) -> Self {
        Self {
            success: true,
            record: Some(record),
            tier: Some(tier),
            elapsed,
            failure: None,
        }
    }

    /// Success answered by the directory after a cache miss; no tier is reported
    pub fn loaded(record: Arc<UserRecord>, elapsed: Duration) -> Self {
        Self {
            success: true,
            record: Some(record),
            tier: None,
            elapsed,
            failure: None,
        }
    }

    pub fn failure(reason: FailureReason, elapsed: Duration) -> Self {
        Self {
            success: false,
            record: None,
            tier: None,
            elapsed,
            failure: Some(reason),
        }
    }

    pub fn is_miss(&self) -> bool {
        self.failure == Some(FailureReason::CacheMiss)
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub security_violations: u64,
    pub invalid_credentials: u64,
    pub tier_errors: u64,
    pub loads: u64,
    pub coalesced_loads: u64,
}

impl CacheStatistics {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }

    /// Fraction of lookups answered by some tier
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// Monotonic counters shared between the orchestrator and the L1 store
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    security_violations: AtomicU64,
    invalid_credentials: AtomicU64,
    tier_errors: AtomicU64,
    loads: AtomicU64,
    coalesced_loads: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::L1 => &self.l1_hits,
            CacheTier::L2 => &self.l2_hits,
            CacheTier::L3 => &self.l3_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total of violations
    pub(crate) fn record_security_violation(&self) -> u64 {
        self.security_violations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_invalid_credentials(&self) {
        self.invalid_credentials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tier_error(&self) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced_load(&self) {
        self.coalesced_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.l3_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::SeqCst),
            invalid_credentials: self.invalid_credentials.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            coalesced_loads: self.coalesced_loads.load(Ordering::Relaxed),
        }
    }
}

/// Current wall-clock time in unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_copy_carries_tier_ttl() {
        let record = UserRecord::new("alice", "{SSHA}x").stamped(1_000, Duration::from_secs(2));
        assert_eq!(record.cache.cached_at_ms, 1_000);
        assert_eq!(record.cache.ttl_secs, 2);
        assert_eq!(record.cache.loaded_at_ms, 0);
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: UserRecord =
            serde_json::from_str(r#"{"username":"bob","credential_hash":"h"}"#).unwrap();
        assert!(record.status.is_usable());
        assert!(record.roles.is_empty());
        assert_eq!(record.cache, CacheMetadata::default());
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStatistics {
            l1_hits: 2,
            l3_hits: 1,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hits(), 3);
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStatistics::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_tier_order() {
        assert!(CacheTier::L1 < CacheTier::L2);
        assert!(CacheTier::L2 < CacheTier::L3);
        assert_eq!(CacheTier::L3.to_string(), "L3");
    }
}
