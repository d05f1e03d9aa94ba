//! Resource monitor: periodic collectors, alerting, and metric retention.

mod alerts;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use sqlx::SqlitePool;

use crate::container::{ContainerPool, ContainerRuntimeApi};
use crate::session::SessionManager;

pub use alerts::{Alert, AlertEngine, AlertInputs, AlertKind, AlertLevel, AlertThresholds};
pub use metrics::{
    ContainerMetrics, ContainerMetricsAggregate, CpuTimes, HostMetrics,
    derive_container_metrics, read_host_metrics,
};

/// Record kinds written by the collectors.
pub mod record_kind {
    pub const SYSTEM: &str = "system";
    pub const CONTAINERS: &str = "containers";
    pub const POOL: &str = "pool";
    pub const SESSIONS: &str = "sessions";
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Collection tick interval.
    pub interval: Duration,
    /// Metric records older than this are deleted.
    pub retention: Duration,
    /// Filesystem whose usage feeds the disk alert.
    pub disk_path: String,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
            disk_path: "/".to_string(),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Repository for timestamped, type-tagged metric records.
#[derive(Debug, Clone)]
pub struct MetricsRepository {
    pool: SqlitePool,
}

impl MetricsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one record.
    pub async fn insert(&self, kind: &str, payload: &serde_json::Value) -> Result<()> {
        sqlx::query("INSERT INTO metric_records (kind, recorded_at, payload) VALUES (?, ?, ?)")
            .bind(kind)
            .bind(crate::db::now_timestamp())
            .bind(payload.to_string())
            .execute(&self.pool)
            .await
            .context("inserting metric record")?;
        Ok(())
    }

    /// The most recent record of a kind.
    pub async fn latest(&self, kind: &str) -> Result<Option<(String, serde_json::Value)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT recorded_at, payload FROM metric_records WHERE kind = ? ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await
        .context("fetching latest metric record")?;

        match row {
            Some((at, payload)) => {
                let value = serde_json::from_str(&payload).context("parsing metric payload")?;
                Ok(Some((at, value)))
            }
            None => Ok(None),
        }
    }

    /// Delete records older than the cutoff. Returns how many were removed.
    pub async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metric_records WHERE recorded_at < ?")
            .bind(crate::db::timestamp(cutoff))
            .execute(&self.pool)
            .await
            .context("deleting expired metric records")?;
        Ok(result.rows_affected())
    }
}

/// Periodic collector/alerting loop over pool, session, host and container
/// state. Every collector isolates its own failures; one bad tick never
/// stops subsequent ticks.
#[derive(Clone)]
pub struct ResourceMonitor {
    runtime: Arc<dyn ContainerRuntimeApi>,
    pool: ContainerPool,
    sessions: SessionManager,
    repo: MetricsRepository,
    config: MonitorConfig,
    alerts: Arc<std::sync::Mutex<AlertEngine>>,
    prev_cpu: Arc<tokio::sync::Mutex<Option<CpuTimes>>>,
}

impl ResourceMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        pool: ContainerPool,
        sessions: SessionManager,
        repo: MetricsRepository,
        config: MonitorConfig,
    ) -> Self {
        let thresholds = config.thresholds.clone();
        Self {
            runtime,
            pool,
            sessions,
            repo,
            config,
            alerts: Arc::new(std::sync::Mutex::new(AlertEngine::new(thresholds))),
            prev_cpu: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn repository(&self) -> &MetricsRepository {
        &self.repo
    }

    /// Currently standing alerts.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.active()).unwrap_or_default()
    }

    /// Bounded alert history.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.recent()).unwrap_or_default()
    }

    /// Spawn the collection loop.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.tick().await;
            }
        })
    }

    /// One collection pass. Each collector catches and logs its own failure.
    pub async fn tick(&self) {
        let host = match self.collect_host().await {
            Ok(host) => Some(host),
            Err(e) => {
                warn!("host metric collection failed: {e:#}");
                None
            }
        };

        let containers = match self.collect_containers().await {
            Ok(agg) => Some(agg),
            Err(e) => {
                warn!("container metric collection failed: {e:#}");
                None
            }
        };

        if let Err(e) = self.collect_pool().await {
            warn!("pool stat collection failed: {e:#}");
        }

        if let Err(e) = self.collect_sessions().await {
            warn!("session stat collection failed: {e:#}");
        }

        if let (Some(host), Some(containers)) = (&host, &containers) {
            let inputs = AlertInputs {
                cpu_percent: host.cpu_percent,
                memory_percent: host.mem_percent,
                disk_percent: host.disk_percent,
                container_count: containers.container_count,
            };
            let triggered = self
                .alerts
                .lock()
                .map(|mut engine| engine.evaluate(inputs))
                .unwrap_or_default();
            for alert in &triggered {
                warn!("alert [{:?}] {}", alert.level, alert.message);
            }
        }

        if let Err(e) = self.sweep_retention().await {
            warn!("metric retention sweep failed: {e:#}");
        }
    }

    async fn collect_host(&self) -> Result<HostMetrics> {
        let prev = self.prev_cpu.lock().await.clone();
        let (host, cpu) = read_host_metrics(prev, &self.config.disk_path).await?;
        *self.prev_cpu.lock().await = Some(cpu);

        self.repo
            .insert(record_kind::SYSTEM, &serde_json::to_value(&host)?)
            .await?;
        Ok(host)
    }

    async fn collect_containers(&self) -> Result<ContainerMetricsAggregate> {
        let samples = self
            .runtime
            .stats()
            .await
            .map_err(|e| anyhow::anyhow!("runtime stats: {e}"))?;
        let aggregate = derive_container_metrics(&samples);

        self.repo
            .insert(record_kind::CONTAINERS, &serde_json::to_value(&aggregate)?)
            .await?;
        Ok(aggregate)
    }

    async fn collect_pool(&self) -> Result<()> {
        let stats = self.pool.stats().await;
        self.repo
            .insert(record_kind::POOL, &serde_json::to_value(&stats)?)
            .await
    }

    async fn collect_sessions(&self) -> Result<()> {
        let counts = self.sessions.status_counts().await?;
        self.repo
            .insert(record_kind::SESSIONS, &serde_json::to_value(&counts)?)
            .await
    }

    async fn sweep_retention(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.retention)?;
        let removed = self.repo.delete_older_than(cutoff).await?;
        if removed > 0 {
            debug!("retention sweep removed {removed} metric record(s)");
        }
        Ok(())
    }
}
