//! Cache configuration

use std::time::Duration;

/// Configuration for the tiered authentication cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the L1 secure store
    pub l1_max_capacity: usize,
    /// Time-to-live for L1 entries
    pub l1_ttl: Duration,
    /// Time-to-live for L2 (Redis) entries
    pub l2_ttl: Duration,
    /// Time-to-live for L3 (durable store) entries
    pub l3_ttl: Duration,
    /// How often the L1 encryption key is regenerated
    pub key_rotation_interval: Duration,
    /// Security violations tolerated before L1 locks down
    pub security_violation_threshold: u64,
    /// Upper bound on a single `authenticate` call
    pub authenticate_timeout: Duration,
    /// Period of the background maintenance task
    pub maintenance_interval: Duration,
    /// Enable Redis pub/sub for cross-instance invalidation
    pub enable_pubsub: bool,
    /// Pool settings for the L2 backend
    pub l2_pool: PoolConfig,
    /// Pool settings for the L3 backend
    pub l3_pool: PoolConfig,
}

impl CacheConfig {
    /// The longest TTL of any tier; revocation fences are kept this long.
    pub fn max_ttl(&self) -> Duration {
        self.l1_ttl.max(self.l2_ttl).max(self.l3_ttl)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_capacity: 1000,
            l1_ttl: Duration::from_secs(300),    // 5 minutes
            l2_ttl: Duration::from_secs(900),    // 15 minutes
            l3_ttl: Duration::from_secs(86_400), // 24 hours
            key_rotation_interval: Duration::from_secs(300),
            security_violation_threshold: 5,
            authenticate_timeout: Duration::from_secs(2),
            maintenance_interval: Duration::from_secs(30),
            enable_pubsub: true,
            l2_pool: PoolConfig::default(),
            l3_pool: PoolConfig::default(),
        }
    }
}

/// Configuration for a pooled backend connector
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections borrowed at once
    pub max_size: usize,
    /// How long `borrow` waits for a free connection before giving up
    pub borrow_timeout: Duration,
    /// Consecutive failures before the pool reports unhealthy
    pub failure_threshold: u32,
    /// How often an unhealthy pool re-probes its backend
    pub health_check_interval: Duration,
    /// Timeout for a single health probe round-trip
    pub probe_timeout: Duration,
    /// Upper bound on one backend operation (GET, SET, DEL, validation ping);
    /// exceeding it counts as a backend failure
    pub op_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            borrow_timeout: Duration::from_millis(250),
            failure_threshold: 3,
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(1),
            op_timeout: Duration::from_millis(300),
        }
    }
}
