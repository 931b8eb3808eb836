use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::DbError;
use crate::workload::WorkloadClass;

/// Load balancing algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Strict cyclic order per workload class
    RoundRobin,
    /// Fewest busy connections, first registered wins ties
    LeastConnections,
    /// Uniform random pick
    Random,
}

impl FromStr for Strategy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least_connections" | "least-connections" => Ok(Strategy::LeastConnections),
            "random" => Ok(Strategy::Random),
            other => Err(DbError::Configuration(format!(
                "unknown load balancing strategy: {other}"
            ))),
        }
    }
}

/// Occupancy figures a candidate exposes to the balancer.
pub trait LoadInfo {
    fn total_connections(&self) -> usize;
    fn idle_connections(&self) -> usize;

    fn busy_connections(&self) -> usize {
        self.total_connections()
            .saturating_sub(self.idle_connections())
    }
}

impl<T: LoadInfo + ?Sized> LoadInfo for std::sync::Arc<T> {
    fn total_connections(&self) -> usize {
        (**self).total_connections()
    }

    fn idle_connections(&self) -> usize {
        (**self).idle_connections()
    }
}

/// Picks one pool among the candidates of a class.
///
/// Round-robin state is one counter per workload class, so traffic on one
/// class never perturbs the rotation of another.
pub struct LoadBalancer {
    strategy: Strategy,
    counters: [AtomicUsize; 4],
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counters: Default::default(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select with the configured strategy.
    pub fn select<'a, T: LoadInfo>(
        &self,
        class: WorkloadClass,
        pools: &'a [T],
    ) -> Result<&'a T, DbError> {
        self.select_with(self.strategy, class, pools)
    }

    pub fn select_with<'a, T: LoadInfo>(
        &self,
        strategy: Strategy,
        class: WorkloadClass,
        pools: &'a [T],
    ) -> Result<&'a T, DbError> {
        match pools {
            [] => Err(DbError::EmptyPoolSet(class)),
            [only] => Ok(only),
            _ => {
                let index = match strategy {
                    Strategy::RoundRobin => self.next_round_robin(class, pools.len()),
                    Strategy::LeastConnections => least_connections(pools),
                    Strategy::Random => rand::thread_rng().gen_range(0..pools.len()),
                };
                Ok(&pools[index])
            }
        }
    }

    fn next_round_robin(&self, class: WorkloadClass, len: usize) -> usize {
        self.counters[class_slot(class)].fetch_add(1, Ordering::Relaxed) % len
    }
}

fn least_connections<T: LoadInfo>(pools: &[T]) -> usize {
    // min_by_key keeps the first minimum, so ties go to registration order.
    pools
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| p.busy_connections())
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn class_slot(class: WorkloadClass) -> usize {
    match class {
        WorkloadClass::Write => 0,
        WorkloadClass::Read => 1,
        WorkloadClass::Analytics => 2,
        WorkloadClass::Background => 3,
    }
}
