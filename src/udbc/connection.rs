use crate::error::DbError;
use crate::udbc::value::{QueryResult, Value};
use async_trait::async_trait;

/// One native connection leased from a driver.
#[async_trait]
pub trait Connection: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError>;

    /// Hands the native connection back to the driver for good.
    async fn release(&mut self) -> Result<(), DbError>;
}
