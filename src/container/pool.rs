//! Warm container pool.
//!
//! Keeps per-profile queues of provisioned containers ready to lease, tops
//! them back up in the background, and owns every container's teardown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::container::{ContainerHandle, ContainerSpec};
use super::error::{ContainerError, ContainerResult};
use super::runtime::ContainerRuntimeApi;

/// Label identifying containers owned by this service.
pub const MANAGED_LABEL: &str = "warren.managed";

/// Label carrying the profile a container was provisioned for.
pub const PROFILE_LABEL: &str = "warren.profile";

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries each profile is topped up to by maintenance.
    pub min_pool_size: usize,
    /// Entries a profile may hold; reuse beyond this terminates instead.
    pub max_pool_size: usize,
    /// Pooled (unleased) containers older than this are evicted and
    /// re-provisioned fresh.
    pub idle_eviction: Duration,
    /// How long to wait for a new container to report running and accept
    /// TCP on its SSH port.
    pub ready_timeout: Duration,
    /// Grace period passed to the runtime when stopping containers.
    pub stop_timeout_secs: u32,
    /// Host the published SSH ports are reachable on.
    pub host: String,
    /// First host port handed out to containers.
    pub base_port: u16,
    /// Image used when a profile has no explicit mapping.
    pub default_image: String,
    /// Profile name -> image.
    pub profile_images: HashMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 5,
            idle_eviction: Duration::from_secs(30 * 60),
            ready_timeout: Duration::from_secs(30),
            stop_timeout_secs: 10,
            host: "127.0.0.1".to_string(),
            base_port: 42100,
            default_image: "warren-sandbox:latest".to_string(),
            profile_images: HashMap::new(),
        }
    }
}

/// Caller overrides for a single acquisition.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct AcquireOptions {
    pub image: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub env: HashMap<String, String>,
}

/// What to do with a released container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Stop and remove the container.
    Terminate,
    /// Reset it in place and re-queue if the pool has room.
    Reuse,
}

/// A pooled, unleased container.
#[derive(Debug, Clone)]
struct PooledContainer {
    handle: ContainerHandle,
    pooled_at: Instant,
}

/// A container visible to the HTTP layer, pooled or leased.
#[derive(Debug, Clone, Serialize)]
pub struct PoolContainerView {
    #[serde(flatten)]
    pub handle: ContainerHandle,
    pub leased: bool,
}

/// Per-profile pool counts for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pooled: HashMap<String, usize>,
    pub leased: usize,
}

/// Warm pool of sandbox containers, one queue per profile.
#[derive(Clone)]
pub struct ContainerPool {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: PoolConfig,
    pools: Arc<Mutex<HashMap<String, VecDeque<PooledContainer>>>>,
    leased: Arc<Mutex<HashMap<String, ContainerHandle>>>,
    replenishing: Arc<Mutex<HashSet<String>>>,
    next_port: Arc<AtomicU16>,
}

impl ContainerPool {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: PoolConfig) -> Self {
        let base_port = config.base_port;
        Self {
            runtime,
            config,
            pools: Arc::new(Mutex::new(HashMap::new())),
            leased: Arc::new(Mutex::new(HashMap::new())),
            replenishing: Arc::new(Mutex::new(HashSet::new())),
            next_port: Arc::new(AtomicU16::new(base_port)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a healthy container of the given profile.
    ///
    /// Scans the profile's queue front to back, evicting unhealthy entries in
    /// the same pass. Falls through to synchronous provisioning when the
    /// queue has no healthy candidate, so the caller always gets a ready
    /// container or a definitive error.
    pub async fn acquire(
        &self,
        profile: &str,
        options: AcquireOptions,
    ) -> ContainerResult<ContainerHandle> {
        if profile.is_empty() {
            return Err(ContainerError::InvalidInput(
                "container profile cannot be empty".to_string(),
            ));
        }
        if let Some(ref image) = options.image {
            super::container::validate_image_name(image)?;
        }

        loop {
            let candidate = {
                let mut pools = self.pools.lock().await;
                pools.get_mut(profile).and_then(VecDeque::pop_front)
            };

            let Some(entry) = candidate else { break };

            match self.runtime.inspect(&entry.handle.id).await {
                Ok(Some(info)) if info.is_healthy() => {
                    self.leased
                        .lock()
                        .await
                        .insert(entry.handle.id.clone(), entry.handle.clone());
                    self.schedule_replenish(profile);
                    debug!(
                        "leased pooled container {} for profile '{}'",
                        entry.handle.id, profile
                    );
                    return Ok(entry.handle);
                }
                Ok(_) => {
                    info!(
                        "evicting unhealthy pooled container {} (profile '{}')",
                        entry.handle.id, profile
                    );
                    self.destroy_container(&entry.handle.id).await;
                }
                Err(e) => {
                    warn!(
                        "inspect failed for pooled container {}: {e}; evicting",
                        entry.handle.id
                    );
                    self.destroy_container(&entry.handle.id).await;
                }
            }
        }

        // Pool exhausted: provision on demand. Errors propagate to the caller.
        let handle = self
            .provision(profile, &options)
            .await
            .map_err(|e| ContainerError::ProvisionFailed {
                profile: profile.to_string(),
                reason: e.to_string(),
            })?;

        self.leased
            .lock()
            .await
            .insert(handle.id.clone(), handle.clone());
        self.schedule_replenish(profile);
        Ok(handle)
    }

    /// Release a leased container.
    pub async fn release(&self, container_id: &str, mode: ReleaseMode) {
        let handle = self.leased.lock().await.remove(container_id);

        match mode {
            ReleaseMode::Terminate => {
                self.destroy_container(container_id).await;
            }
            ReleaseMode::Reuse => {
                let Some(handle) = handle else {
                    // Unknown lease; nothing to re-queue, just tear it down.
                    self.destroy_container(container_id).await;
                    return;
                };

                if let Err(e) = self.reset_container(container_id).await {
                    warn!("reset of {container_id} failed ({e}); terminating instead");
                    self.destroy_container(container_id).await;
                    return;
                }

                let mut pools = self.pools.lock().await;
                let queue = pools.entry(handle.profile.clone()).or_default();
                if queue.len() < self.config.max_pool_size {
                    info!(
                        "re-queued container {} into pool '{}'",
                        container_id, handle.profile
                    );
                    queue.push_back(PooledContainer {
                        handle,
                        pooled_at: Instant::now(),
                    });
                } else {
                    drop(pools);
                    debug!("pool '{}' full; terminating {container_id}", handle.profile);
                    self.destroy_container(container_id).await;
                }
            }
        }
    }

    /// Provision `count` containers for a profile in parallel, best effort.
    ///
    /// A creation failure does not abort sibling creations; each failure is
    /// logged and the rest of the batch proceeds.
    pub async fn warmup(&self, profile: &str, count: usize) {
        let options = AcquireOptions::default();
        let tasks = (0..count).map(|_| self.provision(profile, &options));
        let results = join_all(tasks).await;

        let mut pools = self.pools.lock().await;
        let queue = pools.entry(profile.to_string()).or_default();
        for result in results {
            match result {
                Ok(handle) => {
                    if queue.len() < self.config.max_pool_size {
                        queue.push_back(PooledContainer {
                            handle,
                            pooled_at: Instant::now(),
                        });
                    } else {
                        let id = handle.id.clone();
                        let pool = self.clone();
                        tokio::spawn(async move { pool.destroy_container(&id).await });
                    }
                }
                Err(e) => warn!("warmup provisioning for profile '{profile}' failed: {e}"),
            }
        }
        info!(
            "warmup complete for profile '{profile}': {} pooled",
            queue.len()
        );
    }

    /// Periodic pool maintenance: evict dead or idle entries, then top every
    /// known profile back up to `min_pool_size`.
    ///
    /// Failures here only ever remove entries; they never propagate.
    pub async fn maintain(&self) {
        let profiles: HashSet<String> = {
            let pools = self.pools.lock().await;
            pools
                .keys()
                .cloned()
                .chain(self.config.profile_images.keys().cloned())
                .collect()
        };

        for profile in profiles {
            self.scan_profile(&profile).await;

            let deficit = {
                let pools = self.pools.lock().await;
                let pooled = pools.get(&profile).map(VecDeque::len).unwrap_or(0);
                self.config.min_pool_size.saturating_sub(pooled)
            };
            if deficit > 0 {
                debug!("topping up pool '{profile}' by {deficit}");
                self.warmup(&profile, deficit).await;
            }
        }
    }

    /// Health-scan one profile's queue, evicting entries whose runtime state
    /// is not running, is unhealthy, or whose idle age exceeds the limit.
    async fn scan_profile(&self, profile: &str) {
        let entries: Vec<PooledContainer> = {
            let mut pools = self.pools.lock().await;
            match pools.get_mut(profile) {
                Some(queue) => queue.drain(..).collect(),
                None => return,
            }
        };

        let mut kept = VecDeque::new();
        for entry in entries {
            if entry.pooled_at.elapsed() > self.config.idle_eviction {
                info!(
                    "evicting idle pooled container {} (profile '{profile}')",
                    entry.handle.id
                );
                self.destroy_container(&entry.handle.id).await;
                continue;
            }

            match self.runtime.inspect(&entry.handle.id).await {
                Ok(Some(info)) if info.is_healthy() => kept.push_back(entry),
                Ok(_) => {
                    info!(
                        "evicting dead pooled container {} (profile '{profile}')",
                        entry.handle.id
                    );
                    self.destroy_container(&entry.handle.id).await;
                }
                Err(e) => {
                    warn!(
                        "health check of {} failed: {e}; evicting",
                        entry.handle.id
                    );
                    self.destroy_container(&entry.handle.id).await;
                }
            }
        }

        let mut pools = self.pools.lock().await;
        let queue = pools.entry(profile.to_string()).or_default();
        // Keep anything a concurrent warmup queued while we scanned.
        for entry in kept.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    /// Destroy managed containers left behind by a previous process, keeping
    /// the ones whose sessions are still restorable.
    pub async fn reap_orphans(&self, keep: &HashSet<String>) {
        let label = format!("{MANAGED_LABEL}=true");
        let known = match self.runtime.list(&label).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("orphan scan failed: {e}");
                return;
            }
        };

        for container in known {
            if keep.contains(&container.id) {
                continue;
            }
            info!("reaping orphan container {} ({:?})", container.id, container.names);
            self.destroy_container(&container.id).await;
        }
    }

    /// Destroy every pooled and leased container.
    pub async fn shutdown(&self) {
        let pooled: Vec<String> = {
            let mut pools = self.pools.lock().await;
            pools
                .drain()
                .flat_map(|(_, queue)| queue.into_iter().map(|e| e.handle.id))
                .collect()
        };
        let leased: Vec<String> = self.leased.lock().await.drain().map(|(id, _)| id).collect();

        let total = pooled.len() + leased.len();
        if total == 0 {
            return;
        }
        info!("pool shutdown: destroying {total} container(s)");

        let tasks = pooled
            .iter()
            .chain(leased.iter())
            .map(|id| self.destroy_container(id));
        join_all(tasks).await;
    }

    /// Current pooled/leased counts.
    pub async fn stats(&self) -> PoolStats {
        let pools = self.pools.lock().await;
        let pooled = pools
            .iter()
            .map(|(profile, queue)| (profile.clone(), queue.len()))
            .collect();
        let leased = self.leased.lock().await.len();
        PoolStats { pooled, leased }
    }

    /// Every container the pool currently owns or has leased out.
    pub async fn list_containers(&self) -> Vec<PoolContainerView> {
        let mut out = Vec::new();
        for entry in self.pools.lock().await.values().flatten() {
            out.push(PoolContainerView {
                handle: entry.handle.clone(),
                leased: false,
            });
        }
        for handle in self.leased.lock().await.values() {
            out.push(PoolContainerView {
                handle: handle.clone(),
                leased: true,
            });
        }
        out
    }

    /// Number of pooled entries for a profile (test hook and monitor detail).
    pub async fn pooled_count(&self, profile: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(profile)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Kick off a background top-up for a profile after an acquisition.
    fn schedule_replenish(&self, profile: &str) {
        let pool = self.clone();
        let profile = profile.to_string();
        tokio::spawn(async move {
            {
                let mut inflight = pool.replenishing.lock().await;
                if !inflight.insert(profile.clone()) {
                    return;
                }
            }

            let deficit = {
                let pools = pool.pools.lock().await;
                let pooled = pools.get(&profile).map(VecDeque::len).unwrap_or(0);
                pool.config.min_pool_size.saturating_sub(pooled)
            };
            if deficit > 0 {
                pool.warmup(&profile, deficit).await;
            }

            pool.replenishing.lock().await.remove(&profile);
        });
    }

    /// Create, start and wait for one container. Blocks the caller; acquire
    /// must hand back a ready container or a definitive error.
    async fn provision(
        &self,
        profile: &str,
        options: &AcquireOptions,
    ) -> ContainerResult<ContainerHandle> {
        let image = options
            .image
            .clone()
            .or_else(|| self.config.profile_images.get(profile).cloned())
            .unwrap_or_else(|| self.config.default_image.clone());

        let uuid = Uuid::new_v4().simple().to_string();
        let name = format!("warren-{profile}-{}", &uuid[..8]);
        let ssh_port = self.allocate_port();

        let mut spec = ContainerSpec::new(image)
            .name(&name)
            .ssh_host_port(ssh_port)
            .label(MANAGED_LABEL, "true")
            .label(PROFILE_LABEL, profile);
        if let Some(limit) = options.memory_limit_mb {
            spec = spec.memory_limit_mb(limit);
        }
        if let Some(shares) = options.cpu_shares {
            spec = spec.cpu_shares(shares);
        }
        for (key, value) in &options.env {
            spec = spec.env(key, value);
        }

        let id = self.runtime.create(&spec).await?;
        if let Err(e) = self.runtime.start(&id).await {
            self.destroy_container(&id).await;
            return Err(e);
        }

        if let Err(e) = self.wait_ready(&id, ssh_port).await {
            self.destroy_container(&id).await;
            return Err(e);
        }

        info!("provisioned container {name} ({id}) on port {ssh_port}");
        Ok(ContainerHandle {
            id,
            name,
            profile: profile.to_string(),
            host: self.config.host.clone(),
            ssh_port,
            created_at: Utc::now(),
        })
    }

    /// Poll until the runtime reports running and the SSH port accepts a TCP
    /// connection, bounded by `ready_timeout`.
    async fn wait_ready(&self, id: &str, ssh_port: u16) -> ContainerResult<()> {
        let start = Instant::now();
        loop {
            let running = matches!(
                self.runtime.inspect(id).await,
                Ok(Some(info)) if info.is_healthy()
            );
            if running && self.runtime.probe_endpoint(&self.config.host, ssh_port).await {
                return Ok(());
            }

            if start.elapsed() >= self.config.ready_timeout {
                return Err(ContainerError::ReadyTimeout {
                    id: id.to_string(),
                    waited_secs: self.config.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// In-place reset for reuse: kill residual user processes and clear
    /// shell history.
    async fn reset_container(&self, id: &str) -> ContainerResult<()> {
        self.runtime
            .exec(
                id,
                "pkill -u sandbox || true; rm -f /home/sandbox/.bash_history /home/sandbox/.ash_history",
            )
            .await
            .map(|_| ())
    }

    /// Stop and remove, falling back to a forced remove. Failures are logged
    /// and swallowed so pool bookkeeping always proceeds.
    async fn destroy_container(&self, id: &str) {
        if let Err(e) = self.runtime.stop(id, self.config.stop_timeout_secs).await {
            debug!("stop of {id} failed: {e}; forcing removal");
        }
        match self.runtime.remove(id, true).await {
            Ok(()) => debug!("removed container {id}"),
            Err(ContainerError::NotFound(_)) => {}
            Err(e) => warn!("failed to remove container {id}: {e}"),
        }
    }

    fn allocate_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            if port >= self.config.base_port && port < 65000 {
                return port;
            }
            // Wrapped or exhausted the range; start over from the base.
            self.next_port.store(self.config.base_port, Ordering::SeqCst);
        }
    }
}
