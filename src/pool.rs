//! Pooled backend connector shared by the L2 and L3 tiers
//!
//! A bounded lease pool over any [`ConnectionManager`]:
//! - `borrow` hands out an idle connection, creates one while below
//!   `max_size`, or waits up to the timeout and fails with [`PoolError::Timeout`]
//! - `return_connection` validates the connection; invalid connections are
//!   closed and never go back to the idle set
//! - `timed` bounds one backend operation by `op_timeout`; an error or a
//!   timeout counts as a backend failure, so a hung backend is taken out of
//!   rotation the same way a refusing one is
//! - `health_check` probes the backend with a fresh connection and flips the
//!   pool's availability flag
//!
//! After `failure_threshold` consecutive failures the pool reports unhealthy
//! and refuses to issue connections. The health monitor keeps probing on
//! `health_check_interval` and the pool resumes as soon as a probe succeeds.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{CacheError, PoolError};

/// Creates, validates and probes connections to one backend
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Name used in log lines
    fn name(&self) -> &str;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection, CacheError>;

    /// Minimal round-trip against the backend
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), CacheError>;

    /// Check a connection being returned to the pool
    async fn validate(&self, conn: &mut Self::Connection) -> bool {
        self.ping(conn).await.is_ok()
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or borrowed
    pub active: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub max_size: usize,
    pub healthy: bool,
}

/// Bounded connection pool with health tracking
pub struct ConnectionPool<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<M::Connection>>,
    permits: Semaphore,
    active: AtomicUsize,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// A leased connection, exclusively owned until returned or dropped
///
/// Dropping without [`ConnectionPool::return_connection`] closes the
/// connection and releases its slot.
pub struct PooledConnection<'a, M: ConnectionManager> {
    pool: &'a ConnectionPool<M>,
    conn: Option<M::Connection>,
    invalid: bool,
    _permit: SemaphorePermit<'a>,
}

impl<M: ConnectionManager> PooledConnection<'_, M> {
    /// Flag the connection as broken so it is closed instead of reused
    pub fn mark_invalid(&mut self) {
        self.invalid = true;
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `return_connection` takes the connection, and it consumes the guard
        self.conn.as_ref().expect("pooled connection already returned")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection already returned")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(
                "Pool {}: connection dropped without return, closing",
                self.pool.manager.name()
            );
            self.pool.discard(conn);
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            manager,
            config: PoolConfig { max_size, ..config },
            idle: Mutex::new(VecDeque::with_capacity(max_size)),
            permits: Semaphore::new(max_size),
            active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            borrowed: self.config.max_size - self.permits.available_permits(),
            max_size: self.config.max_size,
            healthy: self.is_healthy(),
        }
    }

    /// Borrow with the configured default timeout
    pub async fn get(&self) -> Result<PooledConnection<'_, M>, PoolError> {
        self.borrow(self.config.borrow_timeout).await
    }

    /// Lease a connection, waiting at most `timeout` for a free slot
    pub async fn borrow(&self, timeout: Duration) -> Result<PooledConnection<'_, M>, PoolError> {
        if !self.is_healthy() {
            return Err(PoolError::Unhealthy);
        }

        let deadline = Instant::now() + timeout;
        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Unhealthy),
            Err(_) => {
                warn!(
                    "Pool {}: no connection available within {:?}",
                    self.manager.name(),
                    timeout
                );
                return Err(PoolError::Timeout(timeout));
            }
        };

        let idle = self.idle.lock().pop_back();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.manager.connect()).await {
                    Ok(Ok(conn)) => {
                        self.active.fetch_add(1, Ordering::SeqCst);
                        debug!("Pool {}: opened new connection", self.manager.name());
                        conn
                    }
                    Ok(Err(e)) => {
                        warn!("Pool {}: connect failed: {}", self.manager.name(), e);
                        self.record_failure();
                        return Err(PoolError::Connect(e.to_string()));
                    }
                    Err(_) => {
                        warn!("Pool {}: connect timed out", self.manager.name());
                        self.record_failure();
                        return Err(PoolError::Timeout(timeout));
                    }
                }
            }
        };

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            invalid: false,
            _permit: permit,
        })
    }

    /// Run one backend operation, failing it after `op_timeout`
    ///
    /// Errors and timeouts are recorded as consecutive failures.
    pub async fn timed<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.record_failure();
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Pool {}: operation timed out after {:?}",
                    self.manager.name(),
                    self.config.op_timeout
                );
                self.record_failure();
                Err(PoolError::Timeout(self.config.op_timeout).into())
            }
        }
    }

    /// Give a leased connection back
    ///
    /// Valid connections rejoin the idle set while it has room; anything else
    /// is closed. A failed validation counts as a backend failure; recovery is
    /// left to the health monitor.
    pub async fn return_connection(&self, mut pooled: PooledConnection<'_, M>) {
        let Some(mut conn) = pooled.conn.take() else {
            return;
        };
        if pooled.invalid {
            debug!(
                "Pool {}: discarding invalid connection",
                self.manager.name()
            );
            self.discard(conn);
            return;
        }

        let valid = tokio::time::timeout(self.config.op_timeout, self.manager.validate(&mut conn))
            .await
            .unwrap_or(false);
        if valid {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            let mut idle = self.idle.lock();
            if self.is_healthy() && idle.len() < self.config.max_size {
                idle.push_back(conn);
                return;
            }
            drop(idle);
            self.discard(conn);
        } else {
            debug!(
                "Pool {}: connection failed validation, closing",
                self.manager.name()
            );
            self.discard(conn);
            self.record_failure();
        }
    }

    /// Probe the backend with a fresh connection and update the availability flag
    pub async fn health_check(&self) -> bool {
        let probe = async {
            let mut conn = self.manager.connect().await?;
            self.manager.ping(&mut conn).await
        };
        let result = tokio::time::timeout(self.config.probe_timeout, probe).await;

        match result {
            Ok(Ok(())) => self.mark_healthy(),
            Ok(Err(e)) => {
                warn!("Pool {}: health check failed: {}", self.manager.name(), e);
                self.record_failure();
            }
            Err(_) => {
                warn!(
                    "Pool {}: health check timed out after {:?}",
                    self.manager.name(),
                    self.config.probe_timeout
                );
                self.record_failure();
            }
        }
        self.is_healthy()
    }

    /// Spawn a task that probes the backend every `health_check_interval`
    ///
    /// The task holds a weak reference and exits once the pool is dropped.
    pub fn spawn_health_monitor(pool: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(pool);
        let interval = pool.config.health_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.health_check().await;
            }
        })
    }

    fn discard(&self, conn: M::Connection) {
        drop(conn);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn mark_healthy(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !self.healthy.swap(true, Ordering::SeqCst) {
            info!("Pool {}: backend reachable again, resuming", self.manager.name());
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold.max(1)
            && self.healthy.swap(false, Ordering::SeqCst)
        {
            warn!(
                "Pool {}: marked unhealthy after {} consecutive failures",
                self.manager.name(),
                failures
            );
            let stale: Vec<M::Connection> = self.idle.lock().drain(..).collect();
            for conn in stale {
                self.discard(conn);
            }
        }
    }
}
