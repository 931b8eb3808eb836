use std::time::Duration;

use thiserror::Error;

use crate::workload::{PoolId, WorkloadClass};

/// Errors surfaced by the pool manager and its driver seam.
///
/// Callers can tell "no capacity" ([`DbError::AcquireTimeout`]) apart from
/// "operation failed" ([`DbError::QueryExecution`]) and "exhausted
/// alternatives" ([`DbError::FailoverExhausted`]).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No pools configured for workload class {0}")]
    EmptyPoolSet(WorkloadClass),
    #[error("Timed out after {}ms acquiring a connection from {pool}", timeout.as_millis())]
    AcquireTimeout { pool: PoolId, timeout: Duration },
    /// `transient` is set when the connection itself failed or timed out,
    /// so the same statement may succeed on another pool.
    #[error("Query failed on {pool}: {message}")]
    QueryExecution {
        pool: PoolId,
        message: String,
        transient: bool,
    },
    #[error("Health check failed on {pool}: {message}")]
    HealthCheck { pool: PoolId, message: String },
    #[error("Failover exhausted after {attempts} attempts: {source}")]
    FailoverExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Value error: {0}")]
    Value(String),
    #[error("Pool {0} is closed")]
    PoolClosed(PoolId),
    #[error("Unknown pool {0}")]
    UnknownPool(PoolId),
    #[error("Pool manager is not initialized")]
    NotInitialized,
    #[error("Pool manager has been shut down")]
    ShutDown,
}

impl DbError {
    pub(crate) fn query(pool: PoolId, message: impl Into<String>) -> Self {
        DbError::QueryExecution {
            pool,
            message: message.into(),
            transient: false,
        }
    }

    pub(crate) fn transient_query(pool: PoolId, message: impl Into<String>) -> Self {
        DbError::QueryExecution {
            pool,
            message: message.into(),
            transient: true,
        }
    }

    /// True when the failure may succeed against another pool or a later retry.
    /// Statements the database itself rejected are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::QueryExecution { transient, .. } => *transient,
            DbError::AcquireTimeout { .. } | DbError::Connection(_) | DbError::PoolClosed(_) => {
                true
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DbError::AcquireTimeout { .. })
    }

    /// Error at the root of a failover chain.
    pub fn last_cause(&self) -> &DbError {
        match self {
            DbError::FailoverExhausted { source, .. } => source.last_cause(),
            other => other,
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for DbError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
                DbError::Connection(e.to_string())
            }
            _ => DbError::Driver(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let pool = PoolId::new(WorkloadClass::Read, 0);
        assert!(
            DbError::AcquireTimeout {
                pool,
                timeout: Duration::from_millis(5)
            }
            .is_retryable()
        );
        assert!(DbError::transient_query(pool, "connection reset").is_retryable());
        assert!(!DbError::query(pool, "syntax error near FORM").is_retryable());
        assert!(!DbError::Driver("unknown column".into()).is_retryable());
        assert!(!DbError::Configuration("bad".into()).is_retryable());
        assert!(!DbError::EmptyPoolSet(WorkloadClass::Read).is_retryable());
    }

    #[test]
    fn test_failover_exhausted_unwraps_to_last_cause() {
        let pool = PoolId::new(WorkloadClass::Read, 2);
        let err = DbError::FailoverExhausted {
            attempts: 3,
            source: Box::new(DbError::transient_query(pool, "replica down")),
        };
        assert!(matches!(err.last_cause(), DbError::QueryExecution { .. }));
        assert!(err.to_string().contains("3 attempts"));
    }
}
