//! Resource monitor collection tests.

use std::time::Duration;

use warren::container::{AcquireOptions, ContainerPool};
use warren::db::Database;
use warren::monitor::{
    AlertThresholds, MetricsRepository, MonitorConfig, ResourceMonitor, record_kind,
};
use warren::session::{SessionManager, SessionRepository};

mod common;
use common::{FakeRuntime, test_pool_config, test_session_config};

async fn test_monitor() -> (ResourceMonitor, ContainerPool) {
    let runtime = FakeRuntime::new();
    let db = Database::in_memory().await.unwrap();

    let pool = ContainerPool::new(runtime.clone(), test_pool_config());
    let sessions = SessionManager::new(
        SessionRepository::new(db.pool().clone()),
        pool.clone(),
        runtime.clone(),
        test_session_config(),
    );

    let monitor = ResourceMonitor::new(
        runtime,
        pool.clone(),
        sessions,
        MetricsRepository::new(db.pool().clone()),
        MonitorConfig {
            interval: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            disk_path: "/".to_string(),
            thresholds: AlertThresholds::default(),
        },
    );
    (monitor, pool)
}

/// One tick writes a record for every collector kind.
#[tokio::test]
async fn test_tick_writes_all_record_kinds() {
    let (monitor, pool) = test_monitor().await;
    pool.acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();

    monitor.tick().await;

    let repo = monitor.repository();
    for kind in [
        record_kind::SYSTEM,
        record_kind::CONTAINERS,
        record_kind::POOL,
        record_kind::SESSIONS,
    ] {
        let latest = repo.latest(kind).await.unwrap();
        assert!(latest.is_some(), "missing record for kind {kind}");
    }
}

/// Pool stats reflect leased containers.
#[tokio::test]
async fn test_pool_record_counts_leases() {
    let (monitor, pool) = test_monitor().await;
    pool.acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();

    monitor.tick().await;

    let (_, payload) = monitor
        .repository()
        .latest(record_kind::POOL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["leased"], 1);
}

/// Retention removes old records; a fresh tick's records survive.
#[tokio::test]
async fn test_retention_keeps_fresh_records() {
    let (monitor, _pool) = test_monitor().await;

    monitor.tick().await;
    let removed = monitor
        .repository()
        .delete_older_than(chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let latest = monitor
        .repository()
        .latest(record_kind::SYSTEM)
        .await
        .unwrap();
    assert!(latest.is_some());
}
