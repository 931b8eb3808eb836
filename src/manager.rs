//! Top-level façade composing classification, balancing, lifecycle,
//! health monitoring and failover behind one explicit instance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::balancer::LoadBalancer;
use crate::classifier::classify;
use crate::config::ManagerConfig;
use crate::error::DbError;
use crate::events::{EventBus, PoolEvent, SubscriptionId};
use crate::failover::FailoverController;
use crate::health::{HealthMonitor, HealthReport};
use crate::lifecycle::{BoxFuture, ConnectionLifecycle, Transaction};
use crate::metrics::{ClassMetrics, ConnectionCounts, MetricsReport};
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::udbc::{DriverFactory, QueryResult, Value};
use crate::workload::{PoolId, QueryOptions, WorkloadClass};

struct Running {
    registry: Arc<PoolRegistry>,
    health: Arc<HealthMonitor>,
    failover: FailoverController,
}

/// 工作负载连接池管理器
/// Owns every workload pool. Construct one per process (or per test) and
/// pass it around; there is no global instance.
pub struct PoolManager {
    config: ManagerConfig,
    factory: Arc<dyn DriverFactory>,
    events: Arc<EventBus>,
    lifecycle: Arc<ConnectionLifecycle>,
    balancer: LoadBalancer,
    running: OnceLock<Running>,
    init_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl PoolManager {
    /// 校验配置并创建管理器，此时不建立任何连接
    ///
    /// Validates `config` eagerly; no connection is opened yet.
    pub fn new(config: ManagerConfig, factory: Arc<dyn DriverFactory>) -> Result<Self, DbError> {
        config.validate()?;
        let events = Arc::new(EventBus::new());
        Ok(Self {
            lifecycle: Arc::new(ConnectionLifecycle::new(
                config.slow_query_threshold,
                events.clone(),
            )),
            balancer: LoadBalancer::new(config.strategy),
            config,
            factory,
            events,
            running: OnceLock::new(),
            init_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.running.get().is_some() && !self.is_shut_down()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// 创建并测试所有连接池，然后启动健康检查
    ///
    /// Creates and tests every configured pool, then starts the health
    /// monitor. Calling it again after success is a no-op.
    pub async fn initialize(&self) -> Result<(), DbError> {
        let _guard = self.init_lock.lock().await;
        if self.is_shut_down() {
            return Err(DbError::ShutDown);
        }
        if self.running.get().is_some() {
            return Ok(());
        }

        let mut registry = PoolRegistry::new(self.factory.clone());
        for (class, pool_config) in &self.config.pools {
            for replica in 0..pool_config.resolved_hosts().len() {
                if let Err(e) = registry.create_pool(*class, replica, pool_config).await {
                    warn!(class = %class, replica, error = %e, "initialize aborted");
                    registry.close_all(self.config.shutdown_grace).await;
                    return Err(e);
                }
            }
        }
        let registry = Arc::new(registry);

        let health = Arc::new(HealthMonitor::new(
            self.config.health.clone(),
            registry.all().cloned().collect(),
            self.events.clone(),
        ));
        health.start();
        let failover = FailoverController::new(
            self.config.failover.clone(),
            Some(health.clone()),
            self.events.clone(),
        );
        info!(
            pools = registry.len(),
            strategy = ?self.config.strategy,
            "pool manager initialized"
        );
        let _ = self.running.set(Running {
            registry,
            health,
            failover,
        });
        Ok(())
    }

    fn running(&self) -> Result<&Running, DbError> {
        if self.is_shut_down() {
            return Err(DbError::ShutDown);
        }
        self.running.get().ok_or(DbError::NotInitialized)
    }

    /// Class whose pools serve `class`, falling back when it is unconfigured:
    /// analytics to read, read and background to write.
    fn route(registry: &PoolRegistry, class: WorkloadClass) -> WorkloadClass {
        let mut current = class;
        loop {
            if !registry.get_pools(current).is_empty() {
                return current;
            }
            current = match current {
                WorkloadClass::Analytics => WorkloadClass::Read,
                WorkloadClass::Read | WorkloadClass::Background => WorkloadClass::Write,
                WorkloadClass::Write => return class,
            };
        }
    }

    /// Picks the serving pool for `class`, preferring pools not marked
    /// unhealthy. Returns the class's pools and the chosen index.
    fn pick<'r>(
        &self,
        running: &'r Running,
        class: WorkloadClass,
    ) -> Result<(&'r [Arc<Pool>], usize), DbError> {
        let pools = running.registry.get_pools(Self::route(&running.registry, class));
        let usable: Vec<Arc<Pool>> = pools
            .iter()
            .filter(|p| running.health.is_usable(p.id()))
            .cloned()
            .collect();
        let candidates = if usable.is_empty() { pools } else { &usable[..] };
        let chosen = self.balancer.select(class, candidates)?;
        let index = pools
            .iter()
            .position(|p| Arc::ptr_eq(p, chosen))
            .ok_or(DbError::EmptyPoolSet(class))?;
        Ok((pools, index))
    }

    /// 分类、路由并执行一条 SQL
    ///
    /// Classifies, routes and runs one statement. Non-write traffic may fail
    /// over to sibling pools on transient failures; write failures surface
    /// immediately.
    ///
    /// # 参数
    /// * `sql` - 要执行的语句
    /// * `params` - 位置参数
    /// * `options` - 分类提示与故障转移开关；`read_only` 与写语句同时出现时返回
    ///   [`DbError::Configuration`]
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        options: QueryOptions,
    ) -> Result<QueryResult, DbError> {
        let running = self.running()?;
        let class = classify(sql, &options);
        if options.read_only && options.query_type.is_none() && class == WorkloadClass::Write {
            return Err(DbError::Configuration(format!(
                "read-only query starts with a write verb: {sql}"
            )));
        }
        let (pools, primary) = self.pick(running, class)?;

        if !class.allows_failover() {
            let pool = &pools[primary];
            return self
                .lifecycle
                .run_once(pool, pool.config().acquire_timeout, sql, params)
                .await;
        }

        let lifecycle = &self.lifecycle;
        running
            .failover
            .with_failover(
                class,
                pools,
                primary,
                options.failover_allowed(),
                |pool: Arc<Pool>| {
                    Box::pin(async move {
                        lifecycle
                            .run_once(&pool, pool.config().acquire_timeout, sql, params)
                            .await
                    }) as BoxFuture<'_, Result<QueryResult, DbError>>
                },
            )
            .await
    }

    /// 在事务中执行回调
    ///
    /// Runs `callback` inside BEGIN/COMMIT on one pool of the requested class
    /// (write by default). An error from the callback rolls back. The
    /// connection goes back to its pool on every path. Transactions never
    /// fail over.
    pub async fn transaction<T, F>(&self, callback: F, options: QueryOptions) -> Result<T, DbError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, DbError>> + Send,
    {
        let running = self.running()?;
        let class = options.query_type.unwrap_or(WorkloadClass::Write);
        let (pools, index) = self.pick(running, class)?;
        let pool = &pools[index];
        self.lifecycle
            .with_transaction(pool, pool.config().acquire_timeout, callback)
            .await
    }

    /// 获取指定负载类别的一个连接池（手动使用）
    ///
    /// One pool of `class`, chosen by the load balancer, for manual use.
    pub fn get_pool(&self, class: WorkloadClass) -> Result<Arc<Pool>, DbError> {
        let running = self.running()?;
        let (pools, index) = self.pick(running, class)?;
        Ok(pools[index].clone())
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }

    /// 获取所有连接池的健康状态
    ///
    /// Health of every pool. Still answers after shutdown.
    pub fn get_health(&self) -> HealthReport {
        self.running
            .get()
            .map(|r| r.health.report())
            .unwrap_or_default()
    }

    /// 获取所有连接池的指标
    ///
    /// Metrics of every pool. Still answers after shutdown.
    pub fn get_metrics(&self) -> MetricsReport {
        let Some(running) = self.running.get() else {
            return MetricsReport::new();
        };
        running
            .registry
            .classes()
            .map(|class| {
                let pools = running
                    .registry
                    .get_pools(class)
                    .iter()
                    .map(|p| p.metrics_snapshot())
                    .collect();
                (class, ClassMetrics::new(pools))
            })
            .collect()
    }

    /// Connection counts of every pool. Empty before initialize.
    pub fn pool_status(&self) -> BTreeMap<PoolId, ConnectionCounts> {
        self.running
            .get()
            .map(|r| r.registry.all().map(|p| (p.id(), p.status())).collect())
            .unwrap_or_default()
    }

    /// Runs one probe round immediately, outside the timer.
    pub async fn check_health(&self) -> Result<HealthReport, DbError> {
        let running = self.running()?;
        running.health.check_all().await;
        Ok(running.health.report())
    }

    /// 订阅连接池事件
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// 关闭所有连接池
    ///
    /// Stops the health monitor, drains leased handles (bounded by
    /// `shutdown_grace`) and closes every pool. Idempotent.
    pub async fn shutdown(&self) -> Result<(), DbError> {
        let _guard = self.init_lock.lock().await;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(running) = self.running.get() else {
            info!("pool manager shut down before initialize");
            return Ok(());
        };
        running.health.stop().await;
        let outcomes = running.registry.close_all(self.config.shutdown_grace).await;
        let forced = outcomes.iter().filter(|(_, forced)| *forced).count();
        for (pool, was_forced) in outcomes {
            self.events.emit(PoolEvent::PoolClosed {
                pool,
                forced: was_forced,
            });
        }
        if forced > 0 {
            warn!(forced, "pool manager shut down with leaked connections");
        } else {
            info!("pool manager shut down");
        }
        self.events.clear();
        Ok(())
    }
}
