//! Background probing of every pool and the per-pool health state machine.
//!
//! `healthy -> degraded -> unhealthy` on consecutive failed probes,
//! back to `healthy` once `recovery_threshold` consecutive probes succeed.
//! The monitor is the only writer of health records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::DbError;
use crate::events::{EventBus, PoolEvent};
use crate::metrics::ConnectionCounts;
use crate::pool::Pool;
use crate::workload::{PoolId, WorkloadClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

impl HealthRecord {
    /// Folds one probe result in. Returns the transition, if any.
    pub fn apply(
        &mut self,
        outcome: &Result<Duration, DbError>,
        failure_threshold: u32,
        recovery_threshold: u32,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let before = self.status;
        self.last_check = Some(Utc::now());
        match outcome {
            Ok(latency) => {
                self.last_latency_ms = Some(latency.as_secs_f64() * 1000.0);
                self.last_error = None;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
                if self.consecutive_successes >= recovery_threshold {
                    self.status = HealthStatus::Healthy;
                }
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
                self.status = if self.consecutive_failures >= failure_threshold {
                    HealthStatus::Unhealthy
                } else if before == HealthStatus::Unhealthy {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }
        }
        (before != self.status).then_some((before, self.status))
    }
}

/// Health of one pool as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub pool: PoolId,
    pub host: String,
    #[serde(flatten)]
    pub record: HealthRecord,
    pub connections: ConnectionCounts,
}

pub type HealthReport = BTreeMap<WorkloadClass, Vec<PoolHealth>>;

/// 后台健康检查器
/// Probes every pool on a timer and owns the health records.
pub struct HealthMonitor {
    config: HealthConfig,
    pools: Vec<Arc<Pool>>,
    records: DashMap<PoolId, HealthRecord>,
    events: Arc<EventBus>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, pools: Vec<Arc<Pool>>, events: Arc<EventBus>) -> Self {
        let records = pools
            .iter()
            .map(|p| (p.id(), HealthRecord::default()))
            .collect();
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            pools,
            records,
            events,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Spawns the recurring probe loop. A second call is ignored.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("health monitor disabled; pools stay healthy unless probed manually");
            return;
        }
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let monitor = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; pools were just tested by initialize.
            ticker.tick().await;
            info!(
                interval_ms = monitor.config.interval.as_millis() as u64,
                pools = monitor.pools.len(),
                "health monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        monitor.check_all().await;
                        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "health check cycle completed");
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        }));
    }

    /// Stops the probe loop and waits for it to exit.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.effective_probe_timeout() * 2, task)
                .await
                .is_err()
            {
                warn!("health monitor did not stop in time; aborting");
                abort.abort();
            }
        }
    }

    /// Probes every pool concurrently and folds the results in.
    pub async fn check_all(self: &Arc<Self>) {
        let mut probes = JoinSet::new();
        for pool in &self.pools {
            let monitor = self.clone();
            let pool = pool.clone();
            probes.spawn(async move {
                let outcome = monitor.probe(&pool).await;
                monitor.record(pool.id(), outcome);
            });
        }
        while probes.join_next().await.is_some() {}
    }

    /// Probes one pool and records the result.
    pub async fn check_pool(&self, id: PoolId) -> Result<HealthStatus, DbError> {
        let pool = self
            .pools
            .iter()
            .find(|p| p.id() == id)
            .ok_or(DbError::UnknownPool(id))?;
        let outcome = self.probe(pool).await;
        Ok(self.record(id, outcome))
    }

    async fn probe(&self, pool: &Arc<Pool>) -> Result<Duration, DbError> {
        let limit = self.config.effective_probe_timeout();
        let start = Instant::now();
        match tokio::time::timeout(limit, pool.probe(&self.config.probe_sql, limit)).await {
            Ok(Ok(_)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(DbError::HealthCheck {
                pool: pool.id(),
                message: e.to_string(),
            }),
            Err(_) => Err(DbError::HealthCheck {
                pool: pool.id(),
                message: format!("probe timed out after {}ms", limit.as_millis()),
            }),
        }
    }

    fn record(&self, id: PoolId, outcome: Result<Duration, DbError>) -> HealthStatus {
        let (transition, status) = {
            let mut record = self.records.entry(id).or_default();
            let transition = record.apply(
                &outcome,
                self.config.failure_threshold,
                self.config.recovery_threshold,
            );
            (transition, record.status)
        };
        if let Err(e) = &outcome {
            warn!(pool = %id, error = %e, "health probe failed");
        }
        if let Some((from, to)) = transition {
            info!(pool = %id, from = from.as_str(), to = to.as_str(), "pool health changed");
            self.events.emit(PoolEvent::HealthChanged { pool: id, from, to });
        }
        status
    }

    pub fn status(&self, id: PoolId) -> Option<HealthStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    /// Pools never probed count as usable.
    pub fn is_usable(&self, id: PoolId) -> bool {
        self.status(id) != Some(HealthStatus::Unhealthy)
    }

    pub fn record_of(&self, id: PoolId) -> Option<HealthRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn report(&self) -> HealthReport {
        let mut report = HealthReport::new();
        for pool in &self.pools {
            report.entry(pool.id().class).or_default().push(PoolHealth {
                pool: pool.id(),
                host: pool.host().to_string(),
                record: self.record_of(pool.id()).unwrap_or_default(),
                connections: pool.status(),
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> Result<Duration, DbError> {
        Err(DbError::HealthCheck {
            pool: PoolId::new(WorkloadClass::Read, 0),
            message: "down".into(),
        })
    }

    fn ok() -> Result<Duration, DbError> {
        Ok(Duration::from_millis(3))
    }

    #[test]
    fn test_unhealthy_after_threshold_failures() {
        let mut r = HealthRecord::default();
        assert_eq!(
            r.apply(&fail(), 3, 1),
            Some((HealthStatus::Healthy, HealthStatus::Degraded))
        );
        assert_eq!(r.apply(&fail(), 3, 1), None);
        assert_eq!(r.status, HealthStatus::Degraded);
        assert_eq!(
            r.apply(&fail(), 3, 1),
            Some((HealthStatus::Degraded, HealthStatus::Unhealthy))
        );
        assert_eq!(r.consecutive_failures, 3);
        assert_eq!(r.consecutive_successes, 0);
        assert!(r.last_error.is_some());
    }

    #[test]
    fn test_single_success_recovers() {
        let mut r = HealthRecord::default();
        for _ in 0..3 {
            r.apply(&fail(), 3, 1);
        }
        assert_eq!(
            r.apply(&ok(), 3, 1),
            Some((HealthStatus::Unhealthy, HealthStatus::Healthy))
        );
        assert_eq!(r.consecutive_failures, 0);
        assert_eq!(r.consecutive_successes, 1);
        assert!(r.last_latency_ms.is_some());
        assert!(r.last_error.is_none());
    }

    #[test]
    fn test_recovery_threshold_holds_status() {
        let mut r = HealthRecord::default();
        for _ in 0..2 {
            r.apply(&fail(), 2, 2);
        }
        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert_eq!(r.apply(&ok(), 2, 2), None);
        assert_eq!(r.status, HealthStatus::Unhealthy);
        // A failure in between restarts the count.
        r.apply(&fail(), 2, 2);
        assert_eq!(r.apply(&ok(), 2, 2), None);
        assert_eq!(
            r.apply(&ok(), 2, 2),
            Some((HealthStatus::Unhealthy, HealthStatus::Healthy))
        );
    }

    #[test]
    fn test_threshold_of_one_skips_degraded() {
        let mut r = HealthRecord::default();
        assert_eq!(
            r.apply(&fail(), 1, 1),
            Some((HealthStatus::Healthy, HealthStatus::Unhealthy))
        );
    }
}
