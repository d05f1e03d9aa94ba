//! Pool and session lifecycle tests against the scripted runtime.

use std::sync::atomic::Ordering;
use std::time::Duration;

use warren::container::{AcquireOptions, ContainerRuntimeApi, ContainerState, ReleaseMode};
use warren::session::{SessionStart, SessionStatus};

mod common;
use common::{FakeRuntime, test_services, test_session_config};

/// A pooled container is never handed to two acquires.
#[tokio::test]
async fn test_acquire_never_double_leases() {
    let runtime = FakeRuntime::new();
    let (pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    pool.warmup("ssh-terminal", 2).await;
    assert_eq!(pool.pooled_count("ssh-terminal").await, 2);

    let first = pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    let second = pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
}

/// Maintenance converges an empty pool to min_pool_size healthy entries.
#[tokio::test]
async fn test_maintain_tops_up_empty_pool() {
    let runtime = FakeRuntime::new();
    let (pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    pool.warmup("ssh-terminal", 1).await;
    assert_eq!(pool.pooled_count("ssh-terminal").await, 1);

    pool.maintain().await;
    assert_eq!(pool.pooled_count("ssh-terminal").await, 2);
}

/// Acquire on an empty pool provisions synchronously; a later maintenance
/// pass brings the pool back up.
#[tokio::test]
async fn test_acquire_empty_pool_provisions_then_maintain_refills() {
    let runtime = FakeRuntime::new();
    let (pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    let handle = pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    assert!(runtime.container_exists(&handle.id).await);

    // Let the post-acquire background replenishment settle, then maintain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.maintain().await;
    assert_eq!(pool.pooled_count("ssh-terminal").await, 2);
}

/// Maintenance evicts dead pooled entries before topping up.
#[tokio::test]
async fn test_maintain_evicts_dead_entries() {
    let runtime = FakeRuntime::new();
    let (pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    pool.warmup("ssh-terminal", 2).await;
    let victim = pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    pool.release(&victim.id, ReleaseMode::Reuse).await;
    runtime.set_state(&victim.id, ContainerState::Exited).await;

    // Let the post-acquire background replenishment settle first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.maintain().await;
    assert!(!runtime.container_exists(&victim.id).await);
    assert_eq!(pool.pooled_count("ssh-terminal").await, 2);
}

/// Creation failures surface to the acquire caller as a definitive error.
#[tokio::test]
async fn test_acquire_propagates_creation_failure() {
    let runtime = FakeRuntime::new();
    let (pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    runtime.set_fail_create(true);
    let result = pool.acquire("ssh-terminal", AcquireOptions::default()).await;
    assert!(result.is_err());
}

/// Orphan reaping destroys managed containers from a previous process,
/// keeping the ones restorable sessions still reference.
#[tokio::test]
async fn test_reap_orphans_keeps_restorable_containers() {
    let runtime = FakeRuntime::new();
    let (old_pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;

    let kept = old_pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    let orphan = old_pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();

    // Fresh process: new pool over the same runtime.
    let (new_pool, _sessions) = test_services(runtime.clone(), test_session_config()).await;
    let keep: std::collections::HashSet<String> = [kept.id.clone()].into_iter().collect();
    new_pool.reap_orphans(&keep).await;

    assert!(runtime.container_exists(&kept.id).await);
    assert!(!runtime.container_exists(&orphan.id).await);
}

/// Helper: create a session and attach a freshly leased container.
async fn started_session(
    pool: &warren::container::ContainerPool,
    sessions: &warren::session::SessionManager,
    connection_id: &str,
    user_id: &str,
) -> (warren::session::Session, String) {
    let start = sessions
        .create_session(connection_id, "sandbox", user_id)
        .await
        .unwrap();
    let SessionStart::Created(_) = start else {
        panic!("expected a fresh session");
    };

    let container = pool
        .acquire("ssh-terminal", AcquireOptions::default())
        .await
        .unwrap();
    let session = sessions
        .attach_container(connection_id, &container)
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    (session, container.id)
}

/// Disconnected session with a running container restores onto a new
/// connection, bound to the same container.
#[tokio::test]
async fn test_restore_rebinds_same_container() {
    let runtime = FakeRuntime::new();
    let (pool, sessions) = test_services(runtime.clone(), test_session_config()).await;

    let (session, container_id) = started_session(&pool, &sessions, "conn-1", "alice").await;
    sessions.disconnect_session("conn-1").await;

    let start = sessions
        .create_session("conn-2", "sandbox", "alice")
        .await
        .unwrap();
    match start {
        SessionStart::Restored(restored) => {
            assert_eq!(restored.id, session.id);
            assert_eq!(restored.container_id.as_deref(), Some(container_id.as_str()));
            assert_eq!(restored.status, SessionStatus::Active);
        }
        SessionStart::Created(_) => panic!("expected restore"),
    }
}

/// A dead container never yields a stale restore: the record terminates and
/// the caller gets a fresh session.
#[tokio::test]
async fn test_restore_dead_container_terminates_record() {
    let runtime = FakeRuntime::new();
    let (pool, sessions) = test_services(runtime.clone(), test_session_config()).await;

    let (old_session, container_id) = started_session(&pool, &sessions, "conn-1", "alice").await;
    sessions.disconnect_session("conn-1").await;
    runtime.set_state(&container_id, ContainerState::Exited).await;

    let start = sessions
        .create_session("conn-2", "sandbox", "alice")
        .await
        .unwrap();
    let SessionStart::Created(fresh) = start else {
        panic!("expected a fresh session after failed restore");
    };
    assert_ne!(fresh.id, old_session.id);

    let all = sessions.list_sessions().await.unwrap();
    let old = all.iter().find(|s| s.id == old_session.id).unwrap();
    assert_eq!(old.status, SessionStatus::Terminated);
}

/// Restore keys are one-time: a successful restore rotates the key.
#[tokio::test]
async fn test_restore_key_rotates_on_use() {
    let runtime = FakeRuntime::new();
    let (pool, sessions) = test_services(runtime.clone(), test_session_config()).await;

    let (session, _) = started_session(&pool, &sessions, "conn-1", "alice").await;
    sessions.disconnect_session("conn-1").await;

    let restored = sessions
        .restore_by_key("conn-2", &session.restore_key)
        .await
        .unwrap()
        .expect("restore should succeed");
    assert_ne!(restored.restore_key, session.restore_key);

    // The old key no longer matches anything.
    let stale = sessions
        .restore_by_key("conn-3", &session.restore_key)
        .await
        .unwrap();
    assert!(stale.is_none());
}

/// Double cleanup performs exactly one container termination.
#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let runtime = FakeRuntime::new();
    let (pool, sessions) = test_services(runtime.clone(), test_session_config()).await;

    let (session, container_id) = started_session(&pool, &sessions, "conn-1", "alice").await;
    let removed_before = runtime.removed.load(Ordering::SeqCst);

    sessions.cleanup_session("conn-1").await.unwrap();
    sessions.cleanup_session("conn-1").await.unwrap();

    assert_eq!(runtime.removed.load(Ordering::SeqCst), removed_before + 1);
    assert!(!runtime.container_exists(&container_id).await);

    let all = sessions.list_sessions().await.unwrap();
    let finalized = all.iter().find(|s| s.id == session.id).unwrap();
    assert_eq!(finalized.status, SessionStatus::Terminated);
    assert!(finalized.terminated_at.is_some());
}

/// Idle timeout demotes to disconnected without touching the container.
#[tokio::test]
async fn test_idle_timeout_demotes_but_retains_container() {
    let runtime = FakeRuntime::new();
    let mut config = test_session_config();
    config.idle_timeout = Duration::from_millis(20);
    let (pool, sessions) = test_services(runtime.clone(), config).await;

    let (session, container_id) = started_session(&pool, &sessions, "conn-1", "alice").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    sessions.sweep().await;

    let all = sessions.list_sessions().await.unwrap();
    let demoted = all.iter().find(|s| s.id == session.id).unwrap();
    assert_eq!(demoted.status, SessionStatus::Disconnected);

    // The container survived and is still inspectable.
    assert!(runtime.container_exists(&container_id).await);
    let info = runtime.inspect(&container_id).await.unwrap().unwrap();
    assert!(info.state.is_running());
}

/// Expiry is an absolute ceiling: the sweep terminates expired sessions and
/// releases their containers.
#[tokio::test]
async fn test_expiry_sweep_terminates_session() {
    let runtime = FakeRuntime::new();
    let mut config = test_session_config();
    config.session_ttl = Duration::ZERO;
    let (pool, sessions) = test_services(runtime.clone(), config).await;

    let (session, container_id) = started_session(&pool, &sessions, "conn-1", "alice").await;

    sessions.sweep().await;

    let all = sessions.list_sessions().await.unwrap();
    let expired = all.iter().find(|s| s.id == session.id).unwrap();
    assert_eq!(expired.status, SessionStatus::Expired);
    assert!(!runtime.container_exists(&container_id).await);
}

/// Startup reconciliation demotes running-container sessions and terminates
/// the rest.
#[tokio::test]
async fn test_startup_reconcile() {
    let runtime = FakeRuntime::new();
    let (pool, sessions) = test_services(runtime.clone(), test_session_config()).await;

    let (kept, kept_container) = started_session(&pool, &sessions, "conn-1", "alice").await;
    let (lost, lost_container) = started_session(&pool, &sessions, "conn-2", "bob").await;
    runtime.set_state(&lost_container, ContainerState::Dead).await;

    sessions.startup_reconcile().await.unwrap();

    let all = sessions.list_sessions().await.unwrap();
    let kept_row = all.iter().find(|s| s.id == kept.id).unwrap();
    let lost_row = all.iter().find(|s| s.id == lost.id).unwrap();
    assert_eq!(kept_row.status, SessionStatus::Disconnected);
    assert_eq!(lost_row.status, SessionStatus::Terminated);
    assert!(runtime.container_exists(&kept_container).await);
}
