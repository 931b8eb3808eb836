use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::FailoverConfig;
use crate::error::DbError;
use crate::events::{EventBus, PoolEvent};
use crate::health::HealthMonitor;
use crate::lifecycle::BoxFuture;
use crate::pool::Pool;
use crate::workload::WorkloadClass;

/// 故障转移控制器
/// Retries failed non-write operations against sibling pools of the same class.
pub struct FailoverController {
    config: FailoverConfig,
    health: Option<Arc<HealthMonitor>>,
    events: Arc<EventBus>,
}

impl FailoverController {
    pub fn new(
        config: FailoverConfig,
        health: Option<Arc<HealthMonitor>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            health,
            events,
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Runs `operation` against `pools[primary]`, then against up to
    /// `max_attempts` alternates on retryable failure.
    ///
    /// Write traffic, `allow == false`, or a disabled controller surface the
    /// first error as-is. With no usable alternate the primary error is
    /// returned unwrapped as well.
    pub async fn with_failover<'a, T, F>(
        &self,
        class: WorkloadClass,
        pools: &[Arc<Pool>],
        primary: usize,
        allow: bool,
        mut operation: F,
    ) -> Result<T, DbError>
    where
        F: FnMut(Arc<Pool>) -> BoxFuture<'a, Result<T, DbError>>,
    {
        let origin = pools.get(primary).ok_or(DbError::EmptyPoolSet(class))?;
        let err = match operation(origin.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !class.allows_failover() || !allow || !self.config.enabled || !err.is_retryable() {
            return Err(err);
        }

        let alternates: Vec<&Arc<Pool>> = (1..pools.len())
            .map(|offset| &pools[(primary + offset) % pools.len()])
            .filter(|p| !p.is_closed() && self.is_usable(p))
            .take(self.config.max_attempts as usize)
            .collect();
        if alternates.is_empty() {
            debug!(pool = %origin.id(), "no usable alternate pool; not failing over");
            return Err(err);
        }

        let mut attempts = 1u32;
        let mut last = err;
        for (n, pool) in alternates.into_iter().enumerate() {
            let attempt = n as u32 + 1;
            tokio::time::sleep(self.config.delay_for(attempt)).await;
            warn!(
                class = %class,
                from = %origin.id(),
                to = %pool.id(),
                attempt,
                error = %last,
                "failing over"
            );
            self.events.emit(PoolEvent::Failover {
                class,
                from: origin.id(),
                to: pool.id(),
                attempt,
            });
            attempts += 1;
            match operation(pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(DbError::FailoverExhausted {
            attempts,
            source: Box::new(last),
        })
    }

    fn is_usable(&self, pool: &Pool) -> bool {
        self.health
            .as_ref()
            .is_none_or(|h| h.is_usable(pool.id()))
    }
}
