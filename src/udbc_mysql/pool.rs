use crate::config::DatabaseUrl;
use crate::error::DbError;
use crate::udbc::connection::Connection;
use crate::udbc::driver::{Driver, DriverFactory, PoolTarget};
use crate::udbc_mysql::connection::MysqlConnection;
use async_trait::async_trait;
use mysql_async::Pool as MySqlPoolInternal;
use mysql_async::{Opts, OptsBuilder, PoolConstraints, PoolOpts};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// mysql_async pool backing one workload pool.
pub struct MysqlDriver {
    name: String,
    pool: MySqlPoolInternal,
}

impl MysqlDriver {
    pub fn build(
        name: impl Into<String>,
        url: &str,
        max_connections: usize,
        inactive_ttl: Option<Duration>,
    ) -> Result<Self, DbError> {
        let opts = Opts::from_url(url).map_err(|e| DbError::Configuration(e.to_string()))?;
        let constraints = PoolConstraints::new(0, max_connections.max(1)).ok_or_else(|| {
            DbError::Configuration("Invalid pool constraints: min > max".to_string())
        })?;
        let mut pool_opts = PoolOpts::default().with_constraints(constraints);
        if let Some(ttl) = inactive_ttl {
            pool_opts = pool_opts.with_inactive_connection_ttl(ttl);
        }
        let builder = OptsBuilder::from_opts(opts).pool_opts(pool_opts);
        Ok(Self {
            name: name.into(),
            pool: MySqlPoolInternal::new(builder),
        })
    }
}

#[async_trait]
impl Driver for MysqlDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;
        Ok(Box::new(MysqlConnection::new(conn)))
    }

    async fn end(&self) -> Result<(), DbError> {
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

/// Opens one [`MysqlDriver`] per pool target, rendering the URL per host.
pub struct MysqlDriverFactory {
    url: DatabaseUrl,
    inactive_ttl: Option<Duration>,
}

impl MysqlDriverFactory {
    pub fn new(url: DatabaseUrl) -> Self {
        Self {
            url,
            inactive_ttl: Some(Duration::from_secs(30 * 60)),
        }
    }

    pub fn inactive_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.inactive_ttl = ttl;
        self
    }
}

#[async_trait]
impl DriverFactory for MysqlDriverFactory {
    async fn open(&self, target: &PoolTarget) -> Result<Arc<dyn Driver>, DbError> {
        let url = self.url.for_host(&target.host);
        debug!(pool = %target.id, host = %target.host, "opening mysql driver");
        // One native slot above the lease cap is kept for health probes.
        let driver = MysqlDriver::build(
            target.id.to_string(),
            &url,
            target.max_connections + 1,
            self.inactive_ttl,
        )?;
        Ok(Arc::new(driver))
    }
}
