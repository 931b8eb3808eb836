use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::workload::{PoolId, WorkloadClass};

/// Monotonic per-pool counters. Only the lifecycle code running against the
/// owning pool increments them.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    total_queries: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    slow_queries: AtomicU64,
    total_exec_time_us: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, elapsed: Duration, ok: bool, slow: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_exec_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pool: PoolId, connections: ConnectionCounts) -> MetricsSnapshot {
        MetricsSnapshot::from_counters(
            Some(pool),
            Counters {
                total_queries: self.total_queries.load(Ordering::Relaxed),
                successful: self.successful.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
                slow_queries: self.slow_queries.load(Ordering::Relaxed),
                total_exec_time_us: self.total_exec_time_us.load(Ordering::Relaxed),
                acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            },
            connections,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
}

impl ConnectionCounts {
    fn merge(self, other: ConnectionCounts) -> Self {
        Self {
            total: self.total + other.total,
            idle: self.idle + other.idle,
            active: self.active + other.active,
            waiting: self.waiting + other.waiting,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total_queries: u64,
    successful: u64,
    failed: u64,
    slow_queries: u64,
    total_exec_time_us: u64,
    acquire_timeouts: u64,
}

/// Point-in-time view of one pool, or of a whole class when `pool` is `None`.
/// Rates and averages are derived here and never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub pool: Option<PoolId>,
    pub total_queries: u64,
    pub successful: u64,
    pub failed: u64,
    pub slow_queries: u64,
    pub acquire_timeouts: u64,
    pub total_exec_time_ms: f64,
    pub avg_exec_time_ms: f64,
    pub success_rate: f64,
    pub slow_query_rate: f64,
    pub connections: ConnectionCounts,
}

impl MetricsSnapshot {
    fn from_counters(pool: Option<PoolId>, c: Counters, connections: ConnectionCounts) -> Self {
        let total_exec_time_ms = c.total_exec_time_us as f64 / 1000.0;
        let ratio = |n: u64| {
            if c.total_queries == 0 {
                0.0
            } else {
                n as f64 / c.total_queries as f64
            }
        };
        Self {
            pool,
            total_queries: c.total_queries,
            successful: c.successful,
            failed: c.failed,
            slow_queries: c.slow_queries,
            acquire_timeouts: c.acquire_timeouts,
            total_exec_time_ms,
            avg_exec_time_ms: if c.total_queries == 0 {
                0.0
            } else {
                total_exec_time_ms / c.total_queries as f64
            },
            success_rate: if c.total_queries == 0 {
                1.0
            } else {
                ratio(c.successful)
            },
            slow_query_rate: ratio(c.slow_queries),
            connections,
        }
    }

    fn counters(&self) -> Counters {
        Counters {
            total_queries: self.total_queries,
            successful: self.successful,
            failed: self.failed,
            slow_queries: self.slow_queries,
            total_exec_time_us: (self.total_exec_time_ms * 1000.0).round() as u64,
            acquire_timeouts: self.acquire_timeouts,
        }
    }

    /// Sums several pool snapshots into one class-wide snapshot.
    pub fn combine<'a>(snapshots: impl IntoIterator<Item = &'a MetricsSnapshot>) -> Self {
        let mut acc = Counters::default();
        let mut connections = ConnectionCounts::default();
        for s in snapshots {
            let c = s.counters();
            acc.total_queries += c.total_queries;
            acc.successful += c.successful;
            acc.failed += c.failed;
            acc.slow_queries += c.slow_queries;
            acc.total_exec_time_us += c.total_exec_time_us;
            acc.acquire_timeouts += c.acquire_timeouts;
            connections = connections.merge(s.connections);
        }
        Self::from_counters(None, acc, connections)
    }
}

/// Metrics of every pool in one workload class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub combined: MetricsSnapshot,
    pub pools: Vec<MetricsSnapshot>,
}

impl ClassMetrics {
    pub fn new(pools: Vec<MetricsSnapshot>) -> Self {
        Self {
            combined: MetricsSnapshot::combine(&pools),
            pools,
        }
    }
}

pub type MetricsReport = BTreeMap<WorkloadClass, ClassMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values_computed_at_snapshot() {
        let m = PoolMetrics::new();
        m.record(Duration::from_millis(10), true, false);
        m.record(Duration::from_millis(30), false, true);
        let s = m.snapshot(
            PoolId::new(WorkloadClass::Read, 0),
            ConnectionCounts::default(),
        );
        assert_eq!(s.total_queries, 2);
        assert_eq!(s.successful, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.slow_queries, 1);
        assert!((s.total_exec_time_ms - 40.0).abs() < 1e-6);
        assert!((s.avg_exec_time_ms - 20.0).abs() < 1e-6);
        assert!((s.success_rate - 0.5).abs() < 1e-9);
        assert!((s.slow_query_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot_has_no_nan() {
        let s = PoolMetrics::new().snapshot(
            PoolId::new(WorkloadClass::Write, 0),
            ConnectionCounts::default(),
        );
        assert_eq!(s.avg_exec_time_ms, 0.0);
        assert_eq!(s.success_rate, 1.0);
        assert_eq!(s.slow_query_rate, 0.0);
    }

    #[test]
    fn test_combine_sums_pools() {
        let a = PoolMetrics::new();
        let b = PoolMetrics::new();
        a.record(Duration::from_millis(5), true, false);
        b.record(Duration::from_millis(15), true, false);
        b.record(Duration::from_millis(2000), false, true);
        let counts = ConnectionCounts {
            total: 2,
            idle: 1,
            active: 1,
            waiting: 0,
        };
        let class = ClassMetrics::new(vec![
            a.snapshot(PoolId::new(WorkloadClass::Read, 0), counts),
            b.snapshot(PoolId::new(WorkloadClass::Read, 1), counts),
        ]);
        assert_eq!(class.combined.pool, None);
        assert_eq!(class.combined.total_queries, 3);
        assert_eq!(class.combined.failed, 1);
        assert_eq!(class.combined.connections.total, 4);
        assert_eq!(class.combined.connections.active, 2);
    }
}
