//! Workload-aware connection pool manager.
//!
//! Queries are classified into a [`WorkloadClass`], routed to that class's
//! pools, balanced across replicas and, for non-write traffic, failed over to
//! sibling pools when the first choice cannot serve them. A background
//! [`health::HealthMonitor`] probes every pool; per-pool metrics are exposed
//! as snapshots.

pub mod balancer;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod udbc;
#[cfg(feature = "mysql")]
pub mod udbc_mysql;
pub mod workload;

pub use balancer::Strategy;
pub use config::{DatabaseUrl, FailoverConfig, HealthConfig, ManagerConfig, PoolConfig};
pub use error::DbError;
pub use events::{PoolEvent, SubscriptionId};
pub use health::HealthStatus;
pub use lifecycle::{BoxFuture, Transaction};
pub use manager::PoolManager;
pub use udbc::{QueryResult, Value};
pub use workload::{PoolId, QueryOptions, WorkloadClass};
