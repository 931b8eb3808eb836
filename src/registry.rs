use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::PoolConfig;
use crate::error::DbError;
use crate::pool::Pool;
use crate::udbc::{DriverFactory, PoolTarget};
use crate::workload::{PoolId, WorkloadClass};

const CONNECTIVITY_TEST_SQL: &str = "SELECT 1";

/// Owns every physical pool, keyed by class in registration order.
///
/// Populated during initialize and read-only afterwards.
pub struct PoolRegistry {
    factory: Arc<dyn DriverFactory>,
    pools: BTreeMap<WorkloadClass, Vec<Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            pools: BTreeMap::new(),
        }
    }

    /// Opens, warms and connectivity-tests the pool for `replica` of `class`.
    /// Replicas must be registered in order, starting at zero.
    pub async fn create_pool(
        &mut self,
        class: WorkloadClass,
        replica: usize,
        config: &PoolConfig,
    ) -> Result<Arc<Pool>, DbError> {
        config.validate(class)?;
        let expected = self.pools.get(&class).map_or(0, Vec::len);
        if replica != expected {
            return Err(DbError::Configuration(format!(
                "{class}: replica {replica} registered out of order (expected {expected})"
            )));
        }
        let host = config
            .resolved_hosts()
            .get(replica)
            .cloned()
            .ok_or_else(|| {
                DbError::Configuration(format!("{class}: no host configured for replica {replica}"))
            })?;
        let target = PoolTarget {
            id: PoolId::new(class, replica),
            host: host.clone(),
            max_connections: config.max_connections,
        };
        let driver = self.factory.open(&target).await?;
        let pool = Arc::new(Pool::new(target.id, host, config.clone(), driver));

        if let Err(e) = Self::connectivity_test(&pool).await {
            error!(pool = %pool.id(), error = %e, "connectivity test failed");
            pool.close(Duration::ZERO).await;
            return Err(e);
        }
        info!(
            pool = %pool.id(),
            host = %pool.host(),
            min = config.min_connections,
            max = config.max_connections,
            "pool created"
        );
        self.pools.entry(class).or_default().push(pool.clone());
        Ok(pool)
    }

    async fn connectivity_test(pool: &Arc<Pool>) -> Result<(), DbError> {
        pool.warm_up().await?;
        let timeout = pool.config().acquire_timeout;
        let mut handle = pool.acquire(timeout).await?;
        let result = handle
            .run(CONNECTIVITY_TEST_SQL, &[], pool.config().statement_timeout)
            .await;
        handle.release().await;
        result.map(|_| ())
    }

    /// Pools of `class` in registration order; empty when unconfigured.
    pub fn get_pools(&self, class: WorkloadClass) -> &[Arc<Pool>] {
        self.pools.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_pool(&self, id: PoolId) -> Option<&Arc<Pool>> {
        self.get_pools(id.class).get(id.replica)
    }

    pub fn classes(&self) -> impl Iterator<Item = WorkloadClass> + '_ {
        self.pools.keys().copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Pool>> {
        self.pools.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains and closes every pool in parallel, each bounded by `grace`.
    /// Returns each pool with whether it had to be force-closed.
    pub async fn close_all(&self, grace: Duration) -> Vec<(PoolId, bool)> {
        let mut closing = JoinSet::new();
        for pool in self.all() {
            let pool = pool.clone();
            closing.spawn(async move { (pool.id(), pool.close(grace).await) });
        }
        let mut outcomes = Vec::with_capacity(self.len());
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "pool close task failed"),
            }
        }
        outcomes.sort();
        outcomes
    }
}
