use std::sync::Arc;

use poolwise::udbc_mysql::MysqlDriverFactory;
use poolwise::{DatabaseUrl, ManagerConfig, PoolManager, QueryOptions, Value};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ManagerConfig::from_env()?;
    let factory = Arc::new(MysqlDriverFactory::new(DatabaseUrl::from_env()?));
    let manager = PoolManager::new(config, factory)?;
    manager.initialize().await?;

    manager.subscribe(|event| info!(?event, "pool event"));

    let sql = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "SELECT 1 AS one".to_string());
    let params: Vec<Value> = std::env::args().skip(2).map(Value::from).collect();
    match manager.query(&sql, &params, QueryOptions::new()).await {
        Ok(result) => info!(rows = result.rows.len(), affected = result.affected_rows, "{:?}", result.rows),
        Err(e) => tracing::error!(error = %e, "query failed"),
    }

    for (class, metrics) in manager.get_metrics() {
        info!(%class, combined = ?metrics.combined, "metrics");
    }
    for (class, pools) in manager.get_health() {
        for pool in pools {
            info!(%class, pool = %pool.pool, status = pool.record.status.as_str(), "health");
        }
    }

    manager.shutdown().await?;
    Ok(())
}
