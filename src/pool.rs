//! Bounded connection pool scoped to one (workload class, replica) pair.
//!
//! A semaphore caps concurrently leased connections at `max_connections`;
//! released native connections go back on an idle stack for reuse. Every
//! lease is a [`ConnectionHandle`], which returns its connection exactly once
//! either through [`ConnectionHandle::release`] or on drop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use crate::balancer::LoadInfo;
use crate::config::PoolConfig;
use crate::error::DbError;
use crate::metrics::{ConnectionCounts, MetricsSnapshot, PoolMetrics};
use crate::udbc::{Connection, Driver, QueryResult, Value};
use crate::workload::PoolId;

/// 单个（负载类别, 副本）的有界连接池
pub struct Pool {
    id: PoolId,
    host: String,
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    total: AtomicUsize,
    active: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
    next_handle: AtomicU64,
    metrics: PoolMetrics,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("driver", &self.driver.name())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pool {
    pub fn new(id: PoolId, host: String, config: PoolConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            id,
            host,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(Vec::with_capacity(config.max_connections)),
            config,
            driver,
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            next_handle: AtomicU64::new(1),
            metrics: PoolMetrics::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn status(&self) -> ConnectionCounts {
        ConnectionCounts {
            total: self.total.load(Ordering::Acquire),
            idle: self.idle_len(),
            active: self.active.load(Ordering::Acquire),
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.id, self.status())
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Leases a connection, waiting at most `timeout` for capacity.
    ///
    /// A waiter that times out leaves the queue without holding a permit.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<ConnectionHandle, DbError> {
        if self.is_closed() {
            return Err(DbError::PoolClosed(self.id));
        }
        let deadline = tokio::time::Instant::now() + timeout;

        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            match timeout_at(deadline, self.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolClosed(self.id)),
                Err(_) => {
                    self.metrics.record_acquire_timeout();
                    return Err(DbError::AcquireTimeout {
                        pool: self.id,
                        timeout,
                    });
                }
            }
        };

        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => match timeout_at(deadline, self.driver.connect()).await {
                Ok(Ok(conn)) => {
                    self.total.fetch_add(1, Ordering::AcqRel);
                    debug!(pool = %self.id, host = %self.host, "opened native connection");
                    conn
                }
                Ok(Err(e)) => {
                    return Err(DbError::Connection(format!("{}: {e}", self.id)));
                }
                Err(_) => {
                    self.metrics.record_acquire_timeout();
                    return Err(DbError::AcquireTimeout {
                        pool: self.id,
                        timeout,
                    });
                }
            },
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(ConnectionHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            pool: self.clone(),
            conn: Some(conn),
            permit: Some(permit),
            acquired_at: Instant::now(),
            queries_executed: 0,
            broken: false,
            in_flight: false,
        })
    }

    /// Opens `min_connections` up front and parks them on the idle stack.
    pub(crate) async fn warm_up(&self) -> Result<(), DbError> {
        while self.total.load(Ordering::Acquire) < self.config.min_connections {
            let conn = self
                .driver
                .connect()
                .await
                .map_err(|e| DbError::Connection(format!("{}: {e}", self.id)))?;
            self.total.fetch_add(1, Ordering::AcqRel);
            if let Ok(mut idle) = self.idle.lock() {
                idle.push(conn);
            }
        }
        Ok(())
    }

    /// Runs `sql` on a dedicated native connection that bypasses the lease
    /// semaphore and is closed afterwards. It never occupies a query slot
    /// and is not counted in `total`.
    pub(crate) async fn probe(&self, sql: &str, limit: Duration) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::PoolClosed(self.id));
        }
        let mut conn = self.driver.connect().await?;
        let result = tokio::time::timeout(limit, conn.query(sql, &[])).await;
        if let Err(e) = conn.release().await {
            debug!(pool = %self.id, error = %e, "probe connection release failed");
        }
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DbError::transient_query(
                self.id,
                format!("probe timed out after {}ms", limit.as_millis()),
            )),
        }
    }

    fn pop_idle(&self) -> Option<Box<dyn Connection>> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    /// Takes a connection back. Returns it when it must be closed instead.
    fn check_in(&self, conn: Box<dyn Connection>, broken: bool) -> Option<Box<dyn Connection>> {
        if broken || self.is_closed() {
            return Some(conn);
        }
        match self.idle.lock() {
            Ok(mut idle) => {
                idle.push(conn);
                None
            }
            Err(_) => Some(conn),
        }
    }

    fn finish_lease(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn discard(&self, mut conn: Box<dyn Connection>) {
        if let Err(e) = conn.release().await {
            warn!(pool = %self.id, error = %e, "native release failed");
        }
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stops new leases, waits up to `grace` for outstanding handles, then
    /// closes idle connections and ends the driver. Returns true when the
    /// grace period ran out with handles still leased.
    pub async fn close(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.permits.close();

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.drained.notified();
                if self.active.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        let forced = drained.is_err();
        if forced {
            warn!(
                pool = %self.id,
                active = self.active.load(Ordering::Acquire),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed with leased connections; forcing close"
            );
        }

        let idle: Vec<_> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for conn in idle {
            self.discard(conn).await;
        }
        if let Err(e) = self.driver.end().await {
            error!(pool = %self.id, error = %e, "driver end failed");
        }
        info!(pool = %self.id, forced, "pool closed");
        forced
    }
}

impl LoadInfo for Pool {
    fn total_connections(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    fn idle_connections(&self) -> usize {
        self.idle_len()
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A single-owner lease on one native connection.
pub struct ConnectionHandle {
    id: u64,
    pool: Arc<Pool>,
    conn: Option<Box<dyn Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
    queries_executed: u64,
    broken: bool,
    in_flight: bool,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("pool", &self.pool.id)
            .field("queries_executed", &self.queries_executed)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn queries_executed(&self) -> u64 {
        self.queries_executed
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Marks the native connection as unusable; it is closed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Runs one statement without touching pool metrics, bounded by `limit`.
    /// A timeout leaves the connection in an unknown state, so it is
    /// marked broken.
    pub(crate) async fn run(
        &mut self,
        sql: &str,
        params: &[Value],
        limit: Duration,
    ) -> Result<QueryResult, DbError> {
        let pool = self.pool.id;
        let conn = self.conn.as_mut().ok_or_else(|| {
            DbError::query(pool, "connection handle used after release")
        })?;
        self.in_flight = true;
        let outcome = tokio::time::timeout(limit, conn.query(sql, params)).await;
        self.in_flight = false;
        self.queries_executed += 1;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                if matches!(e, DbError::Connection(_)) {
                    self.broken = true;
                    Err(DbError::transient_query(pool, e.to_string()))
                } else {
                    Err(DbError::query(pool, e.to_string()))
                }
            }
            Err(_) => {
                self.broken = true;
                Err(DbError::transient_query(
                    pool,
                    format!("statement timed out after {}ms", limit.as_millis()),
                ))
            }
        }
    }

    /// Returns the connection to its pool. A second call is a no-op that
    /// only logs a warning.
    pub async fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            warn!(pool = %self.pool.id, handle = self.id, "connection handle released twice");
            return;
        };
        let broken = self.broken || self.in_flight;
        if let Some(conn) = self.pool.check_in(conn, broken) {
            self.pool.discard(conn).await;
        }
        self.permit.take();
        self.pool.finish_lease();
        debug!(
            pool = %self.pool.id,
            handle = self.id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            queries = self.queries_executed,
            "connection released"
        );
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let broken = self.broken || self.in_flight;
        if let Some(conn) = self.pool.check_in(conn, broken) {
            let pool = self.pool.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move { pool.discard(conn).await });
                }
                Err(_) => {
                    drop(conn);
                    pool.total.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        self.permit.take();
        self.pool.finish_lease();
    }
}
