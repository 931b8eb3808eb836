use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::DbError;
use crate::events::{EventBus, PoolEvent};
use crate::pool::{ConnectionHandle, Pool};
use crate::udbc::{QueryResult, Value};
use crate::workload::PoolId;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Acquire, execute and release around a single pool, with slow-query
/// accounting. The only writer of [`crate::metrics::PoolMetrics`].
pub struct ConnectionLifecycle {
    slow_query_threshold: Duration,
    events: Arc<EventBus>,
}

impl ConnectionLifecycle {
    pub fn new(slow_query_threshold: Duration, events: Arc<EventBus>) -> Self {
        Self {
            slow_query_threshold,
            events,
        }
    }

    pub fn slow_query_threshold(&self) -> Duration {
        self.slow_query_threshold
    }

    pub async fn acquire(
        &self,
        pool: &Arc<Pool>,
        timeout: Duration,
    ) -> Result<ConnectionHandle, DbError> {
        let start = Instant::now();
        let handle = pool.acquire(timeout).await;
        match &handle {
            Ok(h) => debug!(
                pool = %pool.id(),
                handle = h.id(),
                wait_ms = start.elapsed().as_millis() as u64,
                "connection acquired"
            ),
            Err(e) => warn!(pool = %pool.id(), error = %e, "acquire failed"),
        }
        handle
    }

    pub async fn release(&self, handle: &mut ConnectionHandle) {
        handle.release().await;
    }

    /// Runs one statement under the pool's statement timeout and records it.
    pub async fn execute(
        &self,
        handle: &mut ConnectionHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError> {
        let pool = handle.pool().clone();
        let limit = pool.config().statement_timeout;
        let start = Instant::now();
        let result = handle.run(sql, params, limit).await;
        let elapsed = start.elapsed();
        let slow = elapsed > self.slow_query_threshold;
        pool.metrics().record(elapsed, result.is_ok(), slow);

        let elapsed_ms = elapsed.as_millis() as u64;
        if slow {
            warn!(pool = %pool.id(), elapsed_ms, sql, "slow query");
            self.events.emit(PoolEvent::SlowQuery {
                pool: pool.id(),
                elapsed,
            });
        }
        match &result {
            Ok(r) => debug!(
                pool = %pool.id(),
                elapsed_ms,
                rows = r.rows.len(),
                affected = r.affected_rows,
                sql,
                "query"
            ),
            Err(e) => debug!(pool = %pool.id(), elapsed_ms, error = %e, sql, "query failed"),
        }
        result
    }

    /// Acquire, execute, release. The handle goes back on every path.
    pub async fn run_once(
        &self,
        pool: &Arc<Pool>,
        timeout: Duration,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError> {
        let mut handle = self.acquire(pool, timeout).await?;
        let result = self.execute(&mut handle, sql, params).await;
        self.release(&mut handle).await;
        result
    }

    /// BEGIN, run `callback`, then COMMIT on success or ROLLBACK on error.
    /// The handle is released whatever the outcome.
    pub async fn with_transaction<T, F>(
        self: &Arc<Self>,
        pool: &Arc<Pool>,
        timeout: Duration,
        callback: F,
    ) -> Result<T, DbError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, DbError>> + Send,
    {
        let handle = self.acquire(pool, timeout).await?;
        let mut tx = Transaction {
            handle,
            lifecycle: self.clone(),
            finished: false,
        };

        if let Err(e) = tx.control("BEGIN").await {
            tx.finished = true;
            tx.handle.mark_broken();
            tx.handle.release().await;
            return Err(e);
        }

        let outcome = callback(&mut tx).await;
        let result = match outcome {
            Ok(value) => match tx.control("COMMIT").await {
                Ok(()) => Ok(value),
                Err(e) => {
                    error!(pool = %tx.pool_id(), error = %e, "commit failed, rolling back");
                    tx.rollback_quietly().await;
                    Err(e)
                }
            },
            Err(e) => {
                debug!(pool = %tx.pool_id(), error = %e, "transaction callback failed, rolling back");
                tx.rollback_quietly().await;
                Err(e)
            }
        };
        tx.finished = true;
        tx.handle.release().await;
        result
    }
}

/// Connection scoped to one open transaction.
pub struct Transaction {
    handle: ConnectionHandle,
    lifecycle: Arc<ConnectionLifecycle>,
    finished: bool,
}

impl Transaction {
    pub fn pool_id(&self) -> PoolId {
        self.handle.pool_id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.lifecycle.execute(&mut self.handle, sql, params).await
    }

    async fn control(&mut self, sql: &str) -> Result<(), DbError> {
        let limit = self.handle.pool().config().statement_timeout;
        self.handle.run(sql, &[], limit).await.map(|_| ())
    }

    async fn rollback_quietly(&mut self) {
        if let Err(e) = self.control("ROLLBACK").await {
            error!(pool = %self.pool_id(), error = %e, "rollback failed");
            self.handle.mark_broken();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Abandoned mid-transaction: never hand this connection to someone else.
        if !self.finished {
            self.handle.mark_broken();
        }
    }
}
