//! Test utilities and common setup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::sync::Mutex;

use warren::api;
use warren::container::{
    ContainerError, ContainerInfo, ContainerPool, ContainerResult, ContainerRuntimeApi,
    ContainerSpec, ContainerState, ContainerStatsSample, HealthState, PoolConfig,
};
use warren::db::Database;
use warren::monitor::{MetricsRepository, MonitorConfig, ResourceMonitor};
use warren::session::{SessionManager, SessionManagerConfig, SessionRepository};

/// A scripted in-memory container runtime.
///
/// Containers live in a map; tests flip their states to simulate crashes and
/// stopped sandboxes. Endpoint probes always succeed.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    fail_create: AtomicBool,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    state: ContainerState,
    labels: HashMap<String, String>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Force a container into a specific state.
    pub async fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(container) = self.containers.lock().await.get_mut(id) {
            container.state = state;
        }
    }

    /// Make subsequent create calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub async fn container_exists(&self, id: &str) -> bool {
        self.containers.lock().await.contains_key(id)
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed(
                "scripted create failure".to_string(),
            ));
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone().unwrap_or_else(|| id.clone()),
                state: ContainerState::Created,
                labels: spec.labels.clone(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &str) -> ContainerResult<()> {
        match self.containers.lock().await.get_mut(id) {
            Some(container) => {
                container.state = ContainerState::Running;
                Ok(())
            }
            None => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str, _timeout_secs: u32) -> ContainerResult<()> {
        match self.containers.lock().await.get_mut(id) {
            Some(container) => {
                container.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str, _force: bool) -> ContainerResult<()> {
        match self.containers.lock().await.remove(id) {
            Some(_) => {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    async fn inspect(&self, id: &str) -> ContainerResult<Option<ContainerInfo>> {
        Ok(self.containers.lock().await.get(id).map(|c| ContainerInfo {
            id: id.to_string(),
            names: vec![c.name.clone()],
            image: "fake:latest".to_string(),
            state: c.state,
            status: c.state.to_string(),
            health: HealthState::None,
            labels: c.labels.clone(),
        }))
    }

    async fn list(&self, label: &str) -> ContainerResult<Vec<ContainerInfo>> {
        let key = label.split('=').next().unwrap_or(label);
        Ok(self
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.labels.contains_key(key))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                names: vec![c.name.clone()],
                image: "fake:latest".to_string(),
                state: c.state,
                status: c.state.to_string(),
                health: HealthState::None,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn stats(&self) -> ContainerResult<Vec<ContainerStatsSample>> {
        Ok(self
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.state.is_running())
            .map(|(id, c)| ContainerStatsSample {
                container_id: id.clone(),
                name: c.name.clone(),
                cpu_percent: "1.00%".to_string(),
                mem_usage: "64MiB / 512MiB".to_string(),
                mem_percent: "12.50%".to_string(),
                pids: "4".to_string(),
            })
            .collect())
    }

    async fn exec(&self, id: &str, _command: &str) -> ContainerResult<String> {
        if self.containers.lock().await.contains_key(id) {
            Ok(String::new())
        } else {
            Err(ContainerError::NotFound(id.to_string()))
        }
    }

    async fn build_image(&self, _context_dir: &Path, _tag: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn ping(&self) -> ContainerResult<()> {
        Ok(())
    }

    async fn probe_endpoint(&self, _host: &str, _port: u16) -> bool {
        true
    }
}

/// Pool config sized for tests: min 2, fast timeouts, no real eviction.
pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        min_pool_size: 2,
        max_pool_size: 4,
        idle_eviction: Duration::from_secs(600),
        ready_timeout: Duration::from_secs(2),
        stop_timeout_secs: 1,
        host: "127.0.0.1".to_string(),
        base_port: 42100,
        default_image: "fake:latest".to_string(),
        profile_images: HashMap::new(),
    }
}

/// Session config sized for tests.
pub fn test_session_config() -> SessionManagerConfig {
    SessionManagerConfig {
        idle_timeout: Duration::from_secs(1800),
        session_ttl: Duration::from_secs(3600),
        activity_persist_interval: Duration::from_secs(300),
        sweep_interval: Duration::from_secs(60),
    }
}

/// Pool + session manager over a fresh in-memory database.
pub async fn test_services(
    runtime: Arc<FakeRuntime>,
    session_config: SessionManagerConfig,
) -> (ContainerPool, SessionManager) {
    let db = Database::in_memory().await.unwrap();
    let pool = ContainerPool::new(runtime.clone(), test_pool_config());
    let repo = SessionRepository::new(db.pool().clone());
    let sessions = SessionManager::new(repo, pool.clone(), runtime, session_config);
    (pool, sessions)
}

/// Full application router over fake runtime and in-memory database.
pub async fn test_app() -> Router {
    let runtime = FakeRuntime::new();
    let db = Database::in_memory().await.unwrap();

    let pool = ContainerPool::new(runtime.clone(), test_pool_config());
    let session_repo = SessionRepository::new(db.pool().clone());
    let sessions = SessionManager::new(
        session_repo,
        pool.clone(),
        runtime.clone(),
        test_session_config(),
    );

    let metrics_repo = MetricsRepository::new(db.pool().clone());
    let monitor = ResourceMonitor::new(
        runtime.clone(),
        pool.clone(),
        sessions.clone(),
        metrics_repo,
        MonitorConfig::default(),
    );

    let state = api::AppState::new(
        pool,
        sessions,
        runtime,
        monitor,
        "ssh-terminal".to_string(),
    );
    api::create_router(state)
}
