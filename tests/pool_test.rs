mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{record_events, started, test_config};
use poolwise::config::PoolConfig;
use poolwise::{DbError, PoolEvent, QueryOptions, WorkloadClass};

#[tokio::test]
async fn test_acquire_times_out_without_reserving_a_slot() {
    let cfg = test_config(&[]).pool(
        WorkloadClass::Write,
        PoolConfig::new(0, 1).host("w0").acquire_timeout(Duration::from_millis(50)),
    );
    let (manager, _factory) = started(cfg).await;
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();

    let mut held = pool.acquire(Duration::from_millis(50)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(pool.status().waiting, 0);
    assert_eq!(pool.metrics_snapshot().acquire_timeouts, 1);

    held.release().await;
    let again = pool.acquire(Duration::from_millis(30)).await;
    assert!(again.is_ok());
    drop(again);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_reports_timeout_distinctly() {
    let cfg = test_config(&[]).pool(
        WorkloadClass::Write,
        PoolConfig::new(0, 1).host("w0").acquire_timeout(Duration::from_millis(40)),
    );
    let (manager, _factory) = started(cfg).await;
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();
    let _held = pool.acquire(Duration::from_millis(40)).await.unwrap();

    let err = manager
        .query("DELETE FROM t", &[], QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::AcquireTimeout { .. }));
}

#[tokio::test]
async fn test_double_release_is_a_noop() {
    let (manager, _factory) = started(test_config(&[])).await;
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();

    let mut handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
    assert_eq!(pool.status().active, 1);
    handle.release().await;
    assert!(handle.is_released());
    handle.release().await;
    assert_eq!(pool.status().active, 0);
    drop(handle);
    assert_eq!(pool.status().active, 0);

    // The slot is free again.
    let mut next = pool.acquire(Duration::from_millis(50)).await.unwrap();
    assert!(manager.lifecycle().execute(&mut next, "SELECT 2", &[]).await.is_ok());
    next.release().await;
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_execute_after_release_fails_cleanly() {
    let (manager, _factory) = started(test_config(&[])).await;
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();
    let lifecycle = manager.lifecycle();

    let mut handle = lifecycle.acquire(&pool, Duration::from_millis(50)).await.unwrap();
    lifecycle.release(&mut handle).await;
    let err = lifecycle.execute(&mut handle, "SELECT 2", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::QueryExecution { .. }));
    manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_never_exceed_max() {
    const MAX: usize = 3;
    let cfg = test_config(&[]).pool(
        WorkloadClass::Write,
        PoolConfig::new(0, MAX).host("w0").acquire_timeout(Duration::from_secs(5)),
    );
    let (manager, factory) = started(cfg).await;
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..24 {
        let pool = pool.clone();
        let current = current.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = pool.acquire(Duration::from_secs(5)).await.unwrap();
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.status().active <= MAX);
            tokio::time::sleep(Duration::from_millis(5)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            handle.release().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(pool.status().active, 0);
    assert!(factory.backend("w0").connects.load(Ordering::SeqCst) <= MAX);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_queries_are_counted_and_announced() {
    let (manager, factory) = started(
        test_config(&[]).slow_query_threshold(Duration::from_millis(10)),
    )
    .await;
    let events = record_events(&manager);
    factory.backend("w0").set_latency(Duration::from_millis(30));

    manager
        .query("INSERT INTO t VALUES (1)", &[], QueryOptions::new())
        .await
        .unwrap();

    let metrics = manager.get_metrics();
    let write = &metrics[&WorkloadClass::Write].combined;
    assert_eq!(write.total_queries, 1);
    assert_eq!(write.slow_queries, 1);
    assert!(write.total_exec_time_ms >= 30.0);
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PoolEvent::SlowQuery { .. }))
    );
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_statement_timeout_discards_connection() {
    let cfg = test_config(&[]).pool(
        WorkloadClass::Write,
        PoolConfig::new(0, 2)
            .host("w0")
            .acquire_timeout(Duration::from_millis(100))
            .statement_timeout(Duration::from_millis(20)),
    );
    let (manager, factory) = started(cfg).await;
    let backend = factory.backend("w0");
    let pool = manager.get_pool(WorkloadClass::Write).unwrap();
    let total_before = pool.status().total;
    backend.set_latency(Duration::from_millis(200));

    let err = manager
        .query("UPDATE t SET x = 1", &[], QueryOptions::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().total, total_before - 1);
    assert_eq!(pool.status().active, 0);
    assert_eq!(pool.metrics_snapshot().failed, 1);

    backend.set_latency(Duration::ZERO);
    manager.shutdown().await.unwrap();
}
