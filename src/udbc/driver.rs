use crate::error::DbError;
use crate::udbc::connection::Connection;
use crate::workload::PoolId;
use async_trait::async_trait;
use std::sync::Arc;

/// Native pool/driver for one backing host.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
    async fn end(&self) -> Result<(), DbError>;
}

/// Where a pool points: its identity plus the host it was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTarget {
    pub id: PoolId,
    pub host: String,
    pub max_connections: usize,
}

/// Opens a driver per pool. Host resolution belongs to the implementor.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self, target: &PoolTarget) -> Result<Arc<dyn Driver>, DbError>;
}
