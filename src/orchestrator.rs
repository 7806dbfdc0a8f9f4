//! Tier orchestrator: the authentication entry point
//!
//! `authenticate` walks L1, L2, L3 in order. The first tier holding the user
//! answers: the password is verified against its copy and a wrong password is
//! final. A verified hit from L2 or L3 is promoted into every faster tier.
//! Tier errors are absorbed and the walk continues with the next tier.
//!
//! `invalidate` records a revocation fence before removing tier copies. A
//! record whose `loaded_at_ms` is not newer than the fence is rejected on read,
//! which covers copies left behind in a tier that could not be reached and
//! writes racing with the invalidation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::crypto::StorageCipher;
use crate::error::{BoxError, CacheError};
use crate::password::{ClearTextPassword, CredentialHasher};
use crate::pool::ConnectionPool;
use crate::postgres_backend::PostgresBackend;
use crate::record::{
    AuthenticationOutcome, CacheStatistics, CacheTier, FailureReason, StatsCounters, UserRecord,
    now_ms,
};
use crate::redis_backend::{
    DEFAULT_INVALIDATION_CHANNEL, RedisBackend, RedisInvalidationBus, RedisKeyFormatter,
};
use crate::remote_tier::{PrefixKeyFormatter, RemoteTier};
use crate::secure_store::SecureTierStore;
use crate::tier::TierStore;

/// Records stored concurrently by `warmup`
pub const WARMUP_CONCURRENCY: usize = 8;

/// Access to the authoritative directory service
#[async_trait]
pub trait UserLoader: Send + Sync {
    /// Resolve one user; `Ok(None)` when the directory does not know them
    async fn load(&self, username: &str) -> Result<Option<UserRecord>, BoxError>;

    /// Records to pre-populate the cache with
    async fn warmup_batch(&self, _criteria: &str) -> Result<Vec<UserRecord>, BoxError> {
        Ok(Vec::new())
    }
}

/// Announces invalidations to other cache instances
#[async_trait]
pub trait InvalidationPublisher: Send + Sync + 'static {
    async fn publish(&self, username: &str) -> Result<(), CacheError>;
}

type LoadResult = Result<Option<Arc<UserRecord>>, String>;
/// An in-flight directory load that other requests can wait on
type InFlightLoad = watch::Receiver<Option<LoadResult>>;

enum Flight {
    Leader(watch::Sender<Option<LoadResult>>),
    Follower(InFlightLoad),
}

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the username from the in-flight map and notifies
/// waiters with an error if no result was sent.
struct InFlightGuard<'a> {
    username: String,
    in_flight: &'a Mutex<HashMap<String, InFlightLoad>>,
    tx: Option<watch::Sender<Option<LoadResult>>>,
}

impl InFlightGuard<'_> {
    fn complete(mut self, result: LoadResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("Load was cancelled or panicked".to_owned())));
        }
        self.in_flight.lock().remove(&self.username);
    }
}

struct AuthCacheInner {
    config: CacheConfig,
    l1: Arc<SecureTierStore>,
    /// Fixed probe order: L1, then L2 and L3 when configured
    tiers: Vec<Arc<dyn TierStore>>,
    hasher: CredentialHasher,
    stats: Arc<StatsCounters>,
    /// Username -> revocation time (unix ms)
    revocations: DashMap<String, i64>,
    in_flight: Mutex<HashMap<String, InFlightLoad>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for AuthCacheInner {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl AuthCacheInner {
    fn is_revoked(&self, record: &UserRecord) -> bool {
        self.revocations
            .get(&record.username)
            .is_some_and(|fence| record.cache.loaded_at_ms <= *fence)
    }

    /// Fence `username` at now and drop this instance's L1 copy
    fn revoke_local(&self, username: &str) {
        let fence = now_ms();
        self.revocations
            .entry(username.to_owned())
            .and_modify(|existing| *existing = (*existing).max(fence))
            .or_insert(fence);
        self.l1.remove(username);
    }

    fn revoked_since(&self, username: &str, since_ms: i64) -> bool {
        self.revocations
            .get(username)
            .is_some_and(|fence| *fence >= since_ms)
    }

    async fn run_maintenance(&self) {
        if self.l1.rotate_key_if_due() {
            debug!("Maintenance: L1 key rotated");
        }
        self.l1.check_for_tracer();

        let max_ttl_ms = i64::try_from(self.config.max_ttl().as_millis()).unwrap_or(i64::MAX);
        let horizon = now_ms().saturating_sub(max_ttl_ms);
        self.revocations.retain(|_, fence| *fence > horizon);

        for tier in &self.tiers {
            if !tier.is_available() {
                let healthy = tier.health_check().await;
                debug!("Maintenance: re-probed {}: healthy={}", tier.tier(), healthy);
                continue;
            }
            match tier.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => {
                    debug!("Maintenance: purged {} expired {} entries", purged, tier.tier())
                }
                Err(e) => warn!("Maintenance: {} purge failed: {}", tier.tier(), e),
            }
        }
    }
}

/// Assembles an [`AuthCache`] from its tiers
pub struct AuthCacheBuilder {
    config: CacheConfig,
    hasher: CredentialHasher,
    l2: Option<Arc<dyn TierStore>>,
    l3: Option<Arc<dyn TierStore>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
}

impl AuthCacheBuilder {
    pub fn hasher(mut self, hasher: CredentialHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn l2(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.l2 = Some(tier);
        self
    }

    pub fn l3(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.l3 = Some(tier);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn InvalidationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<AuthCache, CacheError> {
        let mut remote = Vec::with_capacity(2);
        for (expected, tier) in [(CacheTier::L2, self.l2), (CacheTier::L3, self.l3)] {
            if let Some(tier) = tier {
                if tier.tier() != expected {
                    return Err(CacheError::Backend(
                        format!("{} store supplied as {}", tier.tier(), expected).into(),
                    ));
                }
                remote.push(tier);
            }
        }
        Ok(AuthCache::assemble(
            self.config,
            self.hasher,
            remote,
            self.publisher,
        ))
    }
}

/// Tiered authentication cache
///
/// Cheap to clone; clones share every tier and counter.
#[derive(Clone)]
pub struct AuthCache {
    inner: Arc<AuthCacheInner>,
}

/// Non-owning handle for background tasks that must not keep the cache alive
#[derive(Clone)]
pub struct WeakAuthCache {
    inner: Weak<AuthCacheInner>,
}

impl WeakAuthCache {
    pub fn upgrade(&self) -> Option<AuthCache> {
        self.inner.upgrade().map(|inner| AuthCache { inner })
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl AuthCache {
    pub fn builder(config: CacheConfig) -> AuthCacheBuilder {
        AuthCacheBuilder {
            config,
            hasher: CredentialHasher::default(),
            l2: None,
            l3: None,
            publisher: None,
        }
    }

    /// L1-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self::assemble(config, CredentialHasher::default(), Vec::new(), None)
    }

    fn assemble(
        config: CacheConfig,
        hasher: CredentialHasher,
        remote: Vec<Arc<dyn TierStore>>,
        publisher: Option<Arc<dyn InvalidationPublisher>>,
    ) -> Self {
        let stats = Arc::new(StatsCounters::default());
        let l1 = Arc::new(SecureTierStore::with_stats(&config, Arc::clone(&stats)));

        let mut tiers: Vec<Arc<dyn TierStore>> = Vec::with_capacity(1 + remote.len());
        tiers.push(l1.clone());
        tiers.extend(remote);

        Self {
            inner: Arc::new(AuthCacheInner {
                config,
                l1,
                tiers,
                hasher,
                stats,
                revocations: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                publisher,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Full deployment: Redis L2, PostgreSQL L3, pool monitors, pub/sub
    /// invalidation and the maintenance task
    ///
    /// Unreachable backends do not fail construction; their tiers start
    /// unhealthy and recover through the health monitors.
    pub async fn connect(
        config: CacheConfig,
        redis_url: &str,
        postgres_url: &str,
        cipher: StorageCipher,
    ) -> Result<Self, CacheError> {
        let redis_client = redis::Client::open(redis_url)?;

        let l2 = Arc::new(RemoteTier::new(
            CacheTier::L2,
            ConnectionPool::new(RedisBackend::new(redis_client.clone()), config.l2_pool.clone()),
            cipher.clone(),
            config.l2_ttl,
            RedisKeyFormatter,
        ));
        let l3 = Arc::new(RemoteTier::new(
            CacheTier::L3,
            ConnectionPool::new(PostgresBackend::new(postgres_url), config.l3_pool.clone()),
            cipher,
            config.l3_ttl,
            PrefixKeyFormatter::new(""),
        ));

        let (l2_healthy, l3_healthy) = tokio::join!(l2.health_check(), l3.health_check());
        info!(
            "AuthCache connecting: L2 healthy={}, L3 healthy={}",
            l2_healthy, l3_healthy
        );

        let mut builder = Self::builder(config.clone())
            .l2(l2.clone())
            .l3(l3.clone());
        let bus = config.enable_pubsub.then(|| {
            Arc::new(RedisInvalidationBus::new(
                redis_client,
                DEFAULT_INVALIDATION_CHANNEL,
            ))
        });
        if let Some(bus) = &bus {
            builder = builder.publisher(bus.clone());
        }
        let cache = builder.build()?;

        {
            let mut background = cache.inner.background.lock();
            background.push(l2.spawn_health_monitor());
            background.push(l3.spawn_health_monitor());
            if let Some(bus) = &bus {
                background.push(bus.spawn_listener(cache.downgrade()));
            }
        }
        cache.spawn_maintenance();

        Ok(cache)
    }

    pub fn downgrade(&self) -> WeakAuthCache {
        WeakAuthCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn hasher(&self) -> &CredentialHasher {
        &self.inner.hasher
    }

    /// The L1 store, for inspection and operator actions
    pub fn l1(&self) -> &SecureTierStore {
        &self.inner.l1
    }

    /// Tiers in probe order
    pub fn tiers(&self) -> impl Iterator<Item = CacheTier> + '_ {
        self.inner.tiers.iter().map(|tier| tier.tier())
    }

    /// Authenticate against the cache within `authenticate_timeout`
    ///
    /// Never fails: tier errors degrade to the next tier and the caller only
    /// ever sees success, `InvalidCredentials`, `CacheMiss` or `Timeout`.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthenticationOutcome {
        let timeout = self.inner.config.authenticate_timeout;
        self.authenticate_with_timeout(username, password, timeout)
            .await
    }

    /// [`authenticate`](Self::authenticate) bounded by the caller's `timeout`
    pub async fn authenticate_with_timeout(
        &self,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> AuthenticationOutcome {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.resolve(username, password, started)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Authentication for user {} exceeded {:?}",
                    username, timeout
                );
                AuthenticationOutcome::failure(FailureReason::Timeout, started.elapsed())
            }
        }
    }

    async fn resolve(&self, username: &str, password: &str, started: Instant) -> AuthenticationOutcome {
        if username.is_empty() {
            self.inner.stats.record_invalid_credentials();
            return AuthenticationOutcome::failure(
                FailureReason::InvalidCredentials,
                started.elapsed(),
            );
        }

        let Some((record, index)) = self.lookup(username).await else {
            debug!("Cache miss for user: {}", username);
            self.inner.stats.record_miss();
            return AuthenticationOutcome::failure(FailureReason::CacheMiss, started.elapsed());
        };

        let tier = self.inner.tiers[index].tier();
        let record = Arc::new(record);
        let password = ClearTextPassword::new(password);
        if !self.verify(password, &record).await {
            self.inner.stats.record_invalid_credentials();
            return AuthenticationOutcome::failure(
                FailureReason::InvalidCredentials,
                started.elapsed(),
            );
        }

        debug!("Cache hit {} for user: {}", tier, username);
        self.inner.stats.record_hit(tier);
        if index > 0 {
            self.promote(&record, index).await;
        }
        AuthenticationOutcome::success(record, tier, started.elapsed())
    }

    /// First tier copy of `username`, with the index of the tier holding it
    async fn lookup(&self, username: &str) -> Option<(UserRecord, usize)> {
        for (index, tier) in self.inner.tiers.iter().enumerate() {
            if !tier.is_available() {
                debug!("Skipping unavailable tier {} for user: {}", tier.tier(), username);
                continue;
            }
            let record = match tier.get(username).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "{} lookup error for user {}: {}. Falling back to next tier.",
                        tier.tier(),
                        username,
                        e
                    );
                    self.inner.stats.record_tier_error();
                    continue;
                }
            };

            if record.username != username {
                warn!(
                    "{} returned a record for {} under key {}; discarding",
                    tier.tier(),
                    record.username,
                    username
                );
                if let Err(e) = tier.remove(username).await {
                    warn!("{} failed to remove mismatched entry {}: {}", tier.tier(), username, e);
                }
                continue;
            }
            if self.inner.is_revoked(&record) {
                debug!("{} copy of user {} predates its revocation, removing", tier.tier(), username);
                if let Err(e) = tier.remove(username).await {
                    warn!("{} failed to remove revoked user {}: {}", tier.tier(), username, e);
                }
                continue;
            }
            return Some((record, index));
        }
        None
    }

    /// Verify off the async workers; malformed or unsupported hashes fail
    async fn verify(&self, password: ClearTextPassword, record: &UserRecord) -> bool {
        let hasher = self.inner.hasher.clone();
        let encoded = record.credential_hash.clone();
        let username = record.username.clone();
        let verdict =
            tokio::task::spawn_blocking(move || hasher.verify(&password, &encoded)).await;
        match verdict {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                warn!("Credential hash for user {} cannot be verified: {}", username, e);
                false
            }
            Err(e) => {
                error!("Credential verification task failed for user {}: {}", username, e);
                false
            }
        }
    }

    /// Copy a record found at `tiers[found]` into every faster tier
    async fn promote(&self, record: &UserRecord, found: usize) {
        let now = now_ms();
        for tier in self.inner.tiers[..found].iter().rev() {
            if !tier.is_available() {
                continue;
            }
            if self.inner.is_revoked(record) {
                return;
            }
            match tier.put(&record.stamped(now, tier.ttl())).await {
                Ok(()) => debug!("Promoted user {} into {}", record.username, tier.tier()),
                Err(e) => {
                    warn!(
                        "Promotion of user {} into {} failed: {}",
                        record.username,
                        tier.tier(),
                        e
                    );
                    self.inner.stats.record_tier_error();
                }
            }
        }
    }

    /// Write-through to every available tier
    ///
    /// Returns the number of tiers written. Unavailable tiers are skipped and
    /// write errors are logged, never returned.
    pub async fn store(&self, username: &str, record: UserRecord) -> usize {
        let now = now_ms();
        // Strictly after any revocation, so the write is visible
        let loaded_at = match self.inner.revocations.get(username) {
            Some(fence) => now.max(fence.saturating_add(1)),
            None => now,
        };
        self.write_tiers(username, record, loaded_at).await
    }

    async fn write_tiers(&self, username: &str, mut record: UserRecord, loaded_at_ms: i64) -> usize {
        if username.is_empty() {
            warn!("Refusing to cache a record without a username");
            return 0;
        }
        if record.username != username {
            warn!(
                "Record for {} offered under key {}; not caching",
                record.username, username
            );
            return 0;
        }
        record.cache.loaded_at_ms = loaded_at_ms;

        let now = now_ms();
        let writes = self
            .inner
            .tiers
            .iter()
            .filter(|tier| tier.is_available())
            .map(|tier| {
                let copy = record.stamped(now, tier.ttl());
                async move { (tier.tier(), tier.put(&copy).await) }
            });

        let mut written = 0;
        for (tier, result) in join_all(writes).await {
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("{} write failed for user {}: {}. Continuing.", tier, username, e);
                    self.inner.stats.record_tier_error();
                }
            }
        }
        debug!("Stored user {} in {} tier(s)", username, written);
        written
    }

    /// Remove a user from every tier
    ///
    /// Takes effect for this instance before returning, even for copies in a
    /// tier that cannot be reached right now.
    pub async fn invalidate(&self, username: &str) {
        self.inner.revoke_local(username);

        for tier in self.inner.tiers.iter().skip(1) {
            if let Err(e) = tier.remove(username).await {
                warn!(
                    "{} remove failed for user {}: {}. Revocation fence still applies.",
                    tier.tier(),
                    username,
                    e
                );
                self.inner.stats.record_tier_error();
            }
        }

        if let Some(publisher) = &self.inner.publisher
            && let Err(e) = publisher.publish(username).await
        {
            warn!("Invalidation publish failed for user {}: {}. Continuing.", username, e);
        }
        debug!("Invalidated user: {}", username);
    }

    /// Apply an invalidation announced by another instance
    ///
    /// Fences the user here and drops the local L1 copy. Shared tiers were
    /// cleaned by the announcing instance; copies it could not reach are
    /// rejected by the fence.
    pub fn revoke_local(&self, username: &str) {
        self.inner.revoke_local(username);
        debug!("Applied remote invalidation for user: {}", username);
    }

    /// Store a batch, returning how many records reached at least one tier
    pub async fn warmup(&self, records: Vec<UserRecord>) -> usize {
        let total = records.len();
        let stored = stream::iter(records)
            .map(|record| async move {
                let username = record.username.clone();
                self.store(&username, record).await > 0
            })
            .buffer_unordered(WARMUP_CONCURRENCY)
            .filter(|stored| futures::future::ready(*stored))
            .count()
            .await;
        info!("Cache warmup stored {} of {} records", stored, total);
        stored
    }

    /// Warm the cache from the directory's batch query
    pub async fn warmup_from<L>(&self, loader: &L, criteria: &str) -> Result<usize, CacheError>
    where
        L: UserLoader + ?Sized,
    {
        let records = loader
            .warmup_batch(criteria)
            .await
            .map_err(CacheError::Backend)?;
        Ok(self.warmup(records).await)
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.inner.stats.snapshot()
    }

    /// Authenticate, loading from the directory on a cache miss
    ///
    /// Concurrent misses for one username share a single `load`. The loaded
    /// record is stored and the caller's password is verified against it; an
    /// unknown user is reported as `InvalidCredentials`.
    pub async fn authenticate_or_load<L>(
        &self,
        username: &str,
        password: &str,
        loader: &L,
    ) -> Result<AuthenticationOutcome, CacheError>
    where
        L: UserLoader + ?Sized,
    {
        let started = Instant::now();
        let outcome = self.authenticate(username, password).await;
        if !outcome.is_miss() {
            return Ok(outcome);
        }

        let Some(record) = self.load_single_flight(username, loader).await? else {
            debug!("User {} not found in directory", username);
            self.inner.stats.record_invalid_credentials();
            return Ok(AuthenticationOutcome::failure(
                FailureReason::InvalidCredentials,
                started.elapsed(),
            ));
        };

        if self.verify(ClearTextPassword::new(password), &record).await {
            Ok(AuthenticationOutcome::loaded(record, started.elapsed()))
        } else {
            self.inner.stats.record_invalid_credentials();
            Ok(AuthenticationOutcome::failure(
                FailureReason::InvalidCredentials,
                started.elapsed(),
            ))
        }
    }

    async fn load_single_flight<L>(
        &self,
        username: &str,
        loader: &L,
    ) -> Result<Option<Arc<UserRecord>>, CacheError>
    where
        L: UserLoader + ?Sized,
    {
        let flight = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(username) {
                Some(rx) => Flight::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(username.to_owned(), rx);
                    Flight::Leader(tx)
                }
            }
        };

        let tx = match flight {
            Flight::Follower(rx) => {
                debug!("Joining in-flight load for user: {}", username);
                self.inner.stats.record_coalesced_load();
                return Self::wait_for_load(rx).await;
            }
            Flight::Leader(tx) => tx,
        };
        let guard = InFlightGuard {
            username: username.to_owned(),
            in_flight: &self.inner.in_flight,
            tx: Some(tx),
        };

        // Another load may have finished between our cache probe and taking the lead
        if let Some((record, _)) = self.lookup(username).await {
            let record = Arc::new(record);
            guard.complete(Ok(Some(Arc::clone(&record))));
            return Ok(Some(record));
        }

        self.inner.stats.record_load();
        let started_ms = now_ms();
        let result = match loader.load(username).await {
            Ok(Some(record)) => {
                if self.inner.revoked_since(username, started_ms) {
                    debug!(
                        "User {} was invalidated while loading; not caching",
                        username
                    );
                } else {
                    self.write_tiers(username, record.clone(), started_ms).await;
                }
                Ok(Some(Arc::new(record)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Directory load failed for user {}: {}", username, e);
                Err(CacheError::Backend(e))
            }
        };

        guard.complete(match &result {
            Ok(record) => Ok(record.clone()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    async fn wait_for_load(
        mut rx: InFlightLoad,
    ) -> Result<Option<Arc<UserRecord>>, CacheError> {
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result
                    .clone()
                    .map_err(|e| CacheError::Backend(e.into()));
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::Backend(
                    "In-flight load ended without a result".into(),
                ));
            }
        }
    }

    /// Operator reset of the L1 security lockdown
    pub fn reset_security_lockdown(&self) {
        self.inner.l1.reset_lockdown();
    }

    pub fn is_locked_down(&self) -> bool {
        self.inner.l1.is_locked_down()
    }

    /// Availability of each tier, in probe order
    pub fn tier_status(&self) -> Vec<(CacheTier, bool)> {
        self.inner
            .tiers
            .iter()
            .map(|tier| (tier.tier(), tier.is_available()))
            .collect()
    }

    /// Probe every tier now
    pub async fn health_check(&self) -> Vec<(CacheTier, bool)> {
        let probes = self
            .inner
            .tiers
            .iter()
            .map(|tier| async move { (tier.tier(), tier.health_check().await) });
        join_all(probes).await
    }

    /// Start the periodic maintenance task
    ///
    /// Rotates the L1 key when due, runs the tracer probe, purges expired L1
    /// entries, prunes old revocation fences and re-probes unavailable tiers.
    /// The task stops when the last handle to the cache is dropped.
    pub fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_maintenance().await;
            }
        });
        self.inner.background.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::PoolConfig;
    use crate::memory_backend::MemoryBackend;
    use crate::pool::ConnectionManager;
    use crate::remote_tier::RecordBackend;
    use crate::password::HashParams;

    const PASSWORD: &str = "Corr3ct!";

    struct Harness {
        cache: AuthCache,
        l2: MemoryBackend,
        l3: MemoryBackend,
    }

    fn remote(tier: CacheTier, backend: &MemoryBackend, ttl: Duration) -> Arc<dyn TierStore> {
        Arc::new(RemoteTier::new(
            tier,
            ConnectionPool::new(backend.clone(), PoolConfig::default()),
            StorageCipher::new("test", [9u8; 32]),
            ttl,
            PrefixKeyFormatter::new("user:"),
        ))
    }

    fn harness(config: CacheConfig) -> Harness {
        let l2 = MemoryBackend::new("l2");
        let l3 = MemoryBackend::new("l3");
        let cache = AuthCache::builder(config.clone())
            .hasher(CredentialHasher::new(HashParams::fast()))
            .l2(remote(CacheTier::L2, &l2, config.l2_ttl))
            .l3(remote(CacheTier::L3, &l3, config.l3_ttl))
            .build()
            .unwrap();
        Harness { cache, l2, l3 }
    }

    fn alice(cache: &AuthCache, password: &str) -> UserRecord {
        let hash = cache
            .hasher()
            .hash_default(&ClearTextPassword::new(password))
            .unwrap();
        UserRecord::new("alice", hash).with_roles(["staff"])
    }

    struct CountingLoader {
        record: Option<UserRecord>,
        loads: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl UserLoader for CountingLoader {
        async fn load(&self, _username: &str) -> Result<Option<UserRecord>, BoxError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.record.clone())
        }

        async fn warmup_batch(&self, _criteria: &str) -> Result<Vec<UserRecord>, BoxError> {
            Ok(self.record.clone().into_iter().collect())
        }
    }

    #[tokio::test]
    async fn test_cold_store_then_hit_then_wrong_password() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureReason::CacheMiss));

        let record = alice(cache, PASSWORD);
        let hash = record.credential_hash.clone();
        assert_eq!(cache.store("alice", record).await, 3);

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L1));
        assert_eq!(outcome.record.as_ref().unwrap().roles, vec!["staff"]);

        let outcome = cache.authenticate("alice", "wrong").await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
        assert_eq!(outcome.tier, None);
        assert_eq!(cache.l1().get("alice").unwrap().credential_hash, hash);

        let stats = cache.statistics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.invalid_credentials, 1);
    }

    #[tokio::test]
    async fn test_l3_hit_promotes_to_faster_tiers() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        let record = alice(cache, PASSWORD);

        let l3 = &cache.inner.tiers[2];
        l3.put(&record.stamped(now_ms(), l3.ttl())).await.unwrap();
        assert!(!cache.l1().contains("alice"));
        assert!(h.l2.raw_get("user:alice").is_none());

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L3));
        assert!(cache.l1().contains("alice"));
        assert!(h.l2.raw_get("user:alice").is_some());

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.tier, Some(CacheTier::L1));
        assert_eq!(cache.statistics().l3_hits, 1);
    }

    #[tokio::test]
    async fn test_l2_outage_degrades_to_l3() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        let record = alice(cache, PASSWORD);
        let l3 = &cache.inner.tiers[2];
        l3.put(&record.stamped(now_ms(), l3.ttl())).await.unwrap();

        h.l2.set_available(false);
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L3));
        assert!(cache.l1().contains("alice"));
        assert!(cache.statistics().tier_errors >= 1);
    }

    #[tokio::test]
    async fn test_wrong_password_does_not_fall_through() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;

        // Stale L1 copy with the old password, newer copy in L3
        let old = alice(cache, "old-password");
        cache.l1().put("alice", &old);
        let new = alice(cache, PASSWORD);
        let l3 = &cache.inner.tiers[2];
        l3.put(&new.stamped(now_ms(), l3.ttl())).await.unwrap();

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
        assert_eq!(h.l3.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_for_other_user_is_discarded() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        let mut bob = alice(cache, PASSWORD);
        bob.username = "bob".to_owned();
        assert!(cache.l1().put("alice", &bob));

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::CacheMiss));
        assert!(!cache.l1().contains("alice"));
    }

    #[tokio::test]
    async fn test_malformed_hash_is_invalid_credentials() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        cache
            .store("alice", UserRecord::new("alice", "not-a-hash"))
            .await;

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_empty_username_is_rejected() {
        let h = harness(CacheConfig::default());
        let outcome = h.cache.authenticate("", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
        assert_eq!(h.cache.store("", UserRecord::new("", "x")).await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_then_authenticate_misses() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        cache.store("alice", alice(cache, PASSWORD)).await;

        cache.invalidate("alice").await;
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::CacheMiss));
        assert!(h.l2.is_empty());
        assert!(h.l3.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_covers_unreachable_tier() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        cache.store("alice", alice(cache, PASSWORD)).await;

        h.l3.set_available(false);
        cache.invalidate("alice").await;
        h.l3.set_available(true);
        assert!(h.l3.raw_get("user:alice").is_some());

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.failure, Some(FailureReason::CacheMiss));
        assert!(h.l3.raw_get("user:alice").is_none());
    }

    #[tokio::test]
    async fn test_store_after_invalidate_is_visible() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        cache.store("alice", alice(cache, "old-password")).await;
        cache.invalidate("alice").await;

        cache.store("alice", alice(cache, PASSWORD)).await;
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_load() {
        let h = harness(CacheConfig::default());
        let cache = h.cache.clone();
        let loader = Arc::new(CountingLoader {
            record: Some(alice(&cache, PASSWORD)),
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let loader = Arc::clone(&loader);
                tokio::spawn(async move {
                    cache
                        .authenticate_or_load("alice", PASSWORD, loader.as_ref())
                        .await
                })
            })
            .collect();

        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(outcome.success);
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.statistics().loads, 1);
        assert!(cache.l1().contains("alice"));
        assert!(cache.inner.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_for_unknown_user_is_invalid_credentials() {
        let h = harness(CacheConfig::default());
        let loader = CountingLoader {
            record: None,
            loads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        };
        let outcome = h
            .cache
            .authenticate_or_load("mallory", PASSWORD, &loader)
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
        assert!(!h.cache.l1().contains("mallory"));
    }

    #[tokio::test]
    async fn test_loaded_record_checks_callers_password() {
        let h = harness(CacheConfig::default());
        let loader = CountingLoader {
            record: Some(alice(&h.cache, PASSWORD)),
            loads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        };
        let outcome = h
            .cache
            .authenticate_or_load("alice", "wrong", &loader)
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::InvalidCredentials));
        // The directory's record is still cached for the next caller
        assert!(h.cache.l1().contains("alice"));

        let outcome = h
            .cache
            .authenticate_or_load("alice", PASSWORD, &loader)
            .await
            .unwrap();
        assert_eq!(outcome.tier, Some(CacheTier::L1));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    struct InvalidatingLoader {
        cache: AuthCache,
        record: UserRecord,
    }

    #[async_trait]
    impl UserLoader for InvalidatingLoader {
        async fn load(&self, username: &str) -> Result<Option<UserRecord>, BoxError> {
            self.cache.invalidate(username).await;
            Ok(Some(self.record.clone()))
        }
    }

    #[tokio::test]
    async fn test_load_racing_invalidation_is_not_cached() {
        let h = harness(CacheConfig::default());
        let loader = InvalidatingLoader {
            cache: h.cache.clone(),
            record: alice(&h.cache, PASSWORD),
        };

        let outcome = h
            .cache
            .authenticate_or_load("alice", PASSWORD, &loader)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tier, None);
        assert!(!h.cache.l1().contains("alice"));
        assert!(h.l2.is_empty());
    }

    #[tokio::test]
    async fn test_warmup_counts_stored_records() {
        let h = harness(CacheConfig::default());
        let cache = &h.cache;
        let hash = alice(cache, PASSWORD).credential_hash;
        let records = vec![
            UserRecord::new("alice", hash.clone()),
            UserRecord::new("bob", hash.clone()),
            UserRecord::new("", hash),
        ];

        assert_eq!(cache.warmup(records).await, 2);
        assert!(cache.authenticate("bob", PASSWORD).await.success);

        let loader = CountingLoader {
            record: Some(UserRecord::new("carol", alice(cache, PASSWORD).credential_hash)),
            loads: AtomicUsize::new(0),
            delay: Duration::ZERO,
        };
        assert_eq!(cache.warmup_from(&loader, "active").await.unwrap(), 1);
        assert!(cache.l1().contains("carol"));
    }

    #[tokio::test]
    async fn test_lockdown_skips_l1_until_reset() {
        let h = harness(CacheConfig {
            security_violation_threshold: 1,
            ..CacheConfig::default()
        });
        let cache = &h.cache;
        cache.l1().record_security_violation("test");
        assert!(cache.is_locked_down());

        assert_eq!(cache.store("alice", alice(cache, PASSWORD)).await, 2);
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.tier, Some(CacheTier::L2));
        assert!(!cache.l1().contains("alice"));

        cache.reset_security_lockdown();
        cache.authenticate("alice", PASSWORD).await;
        assert!(cache.l1().contains("alice"));
        assert_eq!(cache.statistics().security_violations, 1);
    }

    /// Backend that accepts connections and then never answers
    struct HangingBackend;

    #[async_trait]
    impl ConnectionManager for HangingBackend {
        type Connection = ();

        fn name(&self) -> &str {
            "hanging"
        }

        async fn connect(&self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn ping(&self, _conn: &mut ()) -> Result<(), CacheError> {
            std::future::pending::<Result<(), CacheError>>().await
        }
    }

    #[async_trait]
    impl RecordBackend for HangingBackend {
        async fn fetch(&self, _conn: &mut (), _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            std::future::pending::<Result<Option<Vec<u8>>, CacheError>>().await
        }

        async fn store(
            &self,
            _conn: &mut (),
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            std::future::pending::<Result<(), CacheError>>().await
        }

        async fn delete(&self, _conn: &mut (), _key: &str) -> Result<(), CacheError> {
            std::future::pending::<Result<(), CacheError>>().await
        }
    }

    /// L1, a hanging L2 and a memory L3 already holding alice
    async fn with_hanging_l2(config: CacheConfig, pool: PoolConfig) -> AuthCache {
        let hanging = Arc::new(RemoteTier::new(
            CacheTier::L2,
            ConnectionPool::new(HangingBackend, pool),
            StorageCipher::new("test", [9u8; 32]),
            config.l2_ttl,
            PrefixKeyFormatter::new("user:"),
        ));
        let l3 = MemoryBackend::new("l3");
        let cache = AuthCache::builder(config.clone())
            .hasher(CredentialHasher::new(HashParams::fast()))
            .l2(hanging)
            .l3(remote(CacheTier::L3, &l3, config.l3_ttl))
            .build()
            .unwrap();
        let record = alice(&cache, PASSWORD);
        let l3_tier = &cache.inner.tiers[2];
        l3_tier
            .put(&record.stamped(now_ms(), l3_tier.ttl()))
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_hung_l2_degrades_to_l3() {
        let cache = with_hanging_l2(
            CacheConfig {
                authenticate_timeout: Duration::from_secs(5),
                ..CacheConfig::default()
            },
            PoolConfig {
                failure_threshold: 2,
                op_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        )
        .await;

        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L3));
        assert!(outcome.elapsed < Duration::from_secs(1));
        // The timed-out GET and promotion count against L2
        assert_eq!(
            cache.tier_status(),
            vec![
                (CacheTier::L1, true),
                (CacheTier::L2, false),
                (CacheTier::L3, true)
            ]
        );
        assert!(cache.statistics().tier_errors >= 2);

        cache.l1().clear();
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert_eq!(outcome.tier, Some(CacheTier::L3));
    }

    #[tokio::test]
    async fn test_caller_timeout_bounds_authenticate() {
        let cache = with_hanging_l2(
            CacheConfig {
                authenticate_timeout: Duration::from_secs(5),
                ..CacheConfig::default()
            },
            PoolConfig {
                op_timeout: Duration::from_millis(300),
                ..PoolConfig::default()
            },
        )
        .await;

        let outcome = cache
            .authenticate_with_timeout("alice", PASSWORD, Duration::from_millis(20))
            .await;
        assert_eq!(outcome.failure, Some(FailureReason::Timeout));
        assert!(!cache.l1().contains("alice"));

        // The configured default leaves room for L2 to time out
        let outcome = cache.authenticate("alice", PASSWORD).await;
        assert!(outcome.success);
        assert_eq!(outcome.tier, Some(CacheTier::L3));
    }

    /// Delivers announcements straight to another instance
    struct DirectBus {
        peer: AuthCache,
    }

    #[async_trait]
    impl InvalidationPublisher for DirectBus {
        async fn publish(&self, username: &str) -> Result<(), CacheError> {
            self.peer.revoke_local(username);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_invalidation_rejects_unreachable_copy() {
        let config = CacheConfig::default();
        let l2 = MemoryBackend::new("l2");
        let l3 = MemoryBackend::new("l3");
        let instance = |publisher: Option<Arc<dyn InvalidationPublisher>>| {
            let mut builder = AuthCache::builder(config.clone())
                .hasher(CredentialHasher::new(HashParams::fast()))
                .l2(remote(CacheTier::L2, &l2, config.l2_ttl))
                .l3(remote(CacheTier::L3, &l3, config.l3_ttl));
            if let Some(publisher) = publisher {
                builder = builder.publisher(publisher);
            }
            builder.build().unwrap()
        };
        let b = instance(None);
        let a = instance(Some(Arc::new(DirectBus { peer: b.clone() })));

        a.store("alice", alice(&a, "old-password")).await;
        assert!(b.authenticate("alice", "old-password").await.success);
        assert!(b.l1().contains("alice"));

        l3.set_available(false);
        a.invalidate("alice").await;
        l3.set_available(true);
        assert!(l3.raw_get("user:alice").is_some());
        assert!(!b.l1().contains("alice"));

        let outcome = b.authenticate("alice", "old-password").await;
        assert_eq!(outcome.failure, Some(FailureReason::CacheMiss));
        assert!(!b.l1().contains("alice"));
        assert!(l2.raw_get("user:alice").is_none());
    }

    #[test]
    fn test_builder_rejects_misplaced_tier() {
        let backend = MemoryBackend::new("l3");
        let result = AuthCache::builder(CacheConfig::default())
            .l2(remote(CacheTier::L3, &backend, Duration::from_secs(60)))
            .build();
        assert!(result.is_err());

        let cache = AuthCache::new(CacheConfig::default());
        assert_eq!(cache.tiers().collect::<Vec<_>>(), vec![CacheTier::L1]);
    }

    #[tokio::test]
    async fn test_maintenance_rotates_key_and_prunes_fences() {
        let h = harness(CacheConfig {
            l1_ttl: Duration::ZERO,
            l2_ttl: Duration::ZERO,
            l3_ttl: Duration::ZERO,
            key_rotation_interval: Duration::ZERO,
            maintenance_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        });
        let cache = &h.cache;
        let generation = cache.l1().key_generation();
        cache.invalidate("alice").await;
        assert_eq!(cache.inner.revocations.len(), 1);
        cache.store("bob", UserRecord::new("bob", "x")).await;
        assert_eq!(h.l3.len(), 1);

        cache.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.l1().key_generation() > generation);
        assert!(cache.inner.revocations.is_empty());
        assert!(h.l2.is_empty());
        assert!(h.l3.is_empty());
    }

    #[tokio::test]
    async fn test_tier_status_reflects_outage() {
        let h = harness(CacheConfig {
            l2_pool: PoolConfig {
                failure_threshold: 1,
                ..PoolConfig::default()
            },
            ..CacheConfig::default()
        });
        h.l2.set_available(false);
        let status = h.cache.health_check().await;
        assert_eq!(
            status,
            vec![
                (CacheTier::L1, true),
                (CacheTier::L2, false),
                (CacheTier::L3, true)
            ]
        );
        assert_eq!(h.cache.tier_status(), status);
    }
}
