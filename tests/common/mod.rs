#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use poolwise::config::{FailoverConfig, HealthConfig, ManagerConfig, PoolConfig};
use poolwise::udbc::{Connection, Driver, DriverFactory, PoolTarget, QueryResult, Row, Value};
use poolwise::{DbError, PoolEvent, PoolManager, WorkloadClass};

/// Scripted stand-in for one database host.
#[derive(Default)]
pub struct MockBackend {
    pub host: String,
    /// Connection-level failure: the host is unreachable.
    pub fail_queries: AtomicBool,
    /// Statement rejected by the database, e.g. a syntax error.
    pub reject_queries: AtomicBool,
    pub fail_connect: AtomicBool,
    pub latency_ms: AtomicU64,
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,
    pub ended: AtomicBool,
    log: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn set_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.reject_queries.store(rejecting, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Statements other than the probe/connectivity check.
    pub fn workload_statements(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s != "SELECT 1")
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct MockFactory {
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn backend(&self, host: &str) -> Arc<MockBackend> {
        self.backends
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(MockBackend {
                    host: host.to_string(),
                    ..MockBackend::default()
                })
            })
            .clone()
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn open(&self, target: &PoolTarget) -> Result<Arc<dyn Driver>, DbError> {
        Ok(Arc::new(MockDriver {
            name: target.id.to_string(),
            backend: self.backend(&target.host),
        }))
    }
}

struct MockDriver {
    name: String,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::Connection(format!("{} refused", self.backend.host)));
        }
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            backend: self.backend.clone(),
        }))
    }

    async fn end(&self) -> Result<(), DbError> {
        self.backend.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockConnection {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult, DbError> {
        self.backend.log.lock().unwrap().push(sql.to_string());
        let latency = self.backend.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.backend.fail_queries.load(Ordering::SeqCst) {
            return Err(DbError::Connection(format!("{} unavailable", self.backend.host)));
        }
        if self.backend.reject_queries.load(Ordering::SeqCst) {
            return Err(DbError::Driver(format!("syntax error near {sql:?}")));
        }
        let mut row = Row::new();
        row.insert("host".into(), Value::Str(self.backend.host.clone()));
        Ok(QueryResult {
            rows: vec![row],
            affected_rows: 1,
        })
    }

    async fn release(&mut self) -> Result<(), DbError> {
        self.backend.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn served_by(result: &QueryResult) -> String {
    result
        .first("host")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Write pool on `w0`, read pools on the given hosts, timer-driven health
/// checks off and no failover delay.
pub fn test_config(read_hosts: &[&str]) -> ManagerConfig {
    let write = PoolConfig::new(1, 4)
        .host("w0")
        .acquire_timeout(Duration::from_millis(200));
    let mut cfg = ManagerConfig::write_only(write)
        .health(HealthConfig {
            enabled: false,
            interval: Duration::from_millis(200),
            ..HealthConfig::default()
        })
        .failover(FailoverConfig {
            delay: Duration::ZERO,
            ..FailoverConfig::default()
        })
        .shutdown_grace(Duration::from_millis(500));
    if !read_hosts.is_empty() {
        cfg = cfg.pool(
            WorkloadClass::Read,
            PoolConfig::new(0, 4)
                .hosts(read_hosts.iter().copied())
                .acquire_timeout(Duration::from_millis(200)),
        );
    }
    cfg
}

pub async fn started(config: ManagerConfig) -> (PoolManager, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let manager = PoolManager::new(config, factory.clone()).expect("valid config");
    manager.initialize().await.expect("initialize");
    (manager, factory)
}

pub fn record_events(manager: &PoolManager) -> Arc<Mutex<Vec<PoolEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    seen
}
