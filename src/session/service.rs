//! Session manager - the session state machine and its persistence.
//!
//! Owns the in-memory mirror of live connections and every status
//! transition. The relay and HTTP layers never mutate session state
//! directly; they call through here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::RngCore;
use tokio::time::Instant;
use uuid::Uuid;

use crate::container::{ContainerHandle, ContainerPool, ContainerRuntimeApi, ReleaseMode};

use super::models::{Session, SessionLogEntry, SessionStatus, SessionSummary};
use super::repository::SessionRepository;

/// User id recorded when the transport presents no identity.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Inactivity after which an active session is demoted to disconnected.
    pub idle_timeout: Duration,
    /// Absolute session lifetime; the restore window never outlives this.
    pub session_ttl: Duration,
    /// Minimum spacing between persisted activity bumps.
    pub activity_persist_interval: Duration,
    /// Interval of the idle/expiry sweep task.
    pub sweep_interval: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            activity_persist_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// In-memory mirror of a session bound to a live connection.
struct ActiveSession {
    session_id: String,
    last_activity: Instant,
    last_persisted: Instant,
    cleaned_up: Arc<AtomicBool>,
}

/// Result of a connection asking for a session.
#[derive(Debug, Clone)]
pub enum SessionStart {
    /// A fresh session was created.
    Created(Session),
    /// An existing session was rebound to this connection.
    Restored(Session),
}

impl SessionStart {
    pub fn session(&self) -> &Session {
        match self {
            SessionStart::Created(s) | SessionStart::Restored(s) => s,
        }
    }
}

/// Service owning the session state machine.
#[derive(Clone)]
pub struct SessionManager {
    repo: SessionRepository,
    pool: ContainerPool,
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: SessionManagerConfig,
    active: Arc<DashMap<String, ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        repo: SessionRepository,
        pool: ContainerPool,
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            repo,
            pool,
            runtime,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// Create a session for a connection, restoring the user's most recent
    /// restorable session when one exists.
    pub async fn create_session(
        &self,
        connection_id: &str,
        ssh_username: &str,
        user_id: &str,
    ) -> Result<SessionStart> {
        if user_id != ANONYMOUS_USER {
            if let Some(persisted) = self.repo.find_restorable(user_id, Utc::now()).await? {
                debug!(
                    "found restorable session {} for user {user_id}",
                    persisted.id
                );
                if let Some(restored) = self.restore_session(connection_id, persisted).await? {
                    return Ok(SessionStart::Restored(restored));
                }
                // Restore resolved to a dead container; fall through to a
                // fresh session.
            }
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            connection_id: Some(connection_id.to_string()),
            user_id: user_id.to_string(),
            container_id: None,
            container_name: None,
            ssh_host: None,
            ssh_port: None,
            ssh_username: Some(ssh_username.to_string()),
            restore_key: generate_restore_key(),
            status: SessionStatus::Creating,
            created_at: crate::db::timestamp(now),
            last_activity: crate::db::timestamp(now),
            expires_at: crate::db::timestamp(now + chrono::Duration::from_std(self.config.session_ttl)?),
            terminated_at: None,
            error_message: None,
        };

        self.repo.create(&session).await?;
        self.insert_active(connection_id, &session.id);

        info!("created session {} for user {user_id}", session.id);
        Ok(SessionStart::Created(session))
    }

    /// Record the leased container on a session and mark it active.
    ///
    /// Called exactly once per session's active container, after acquire and
    /// before the relay opens its channel.
    pub async fn attach_container(
        &self,
        connection_id: &str,
        container: &ContainerHandle,
    ) -> Result<Session> {
        let session_id = self
            .session_id_for_connection(connection_id)
            .context("no session bound to connection")?;
        let username = self
            .repo
            .get(&session_id)
            .await?
            .context("session record missing")?
            .ssh_username;

        self.repo
            .attach_container(
                &session_id,
                &container.id,
                &container.name,
                &container.host,
                container.ssh_port as i64,
                username.as_deref().unwrap_or_default(),
            )
            .await?;

        if let Some(mut entry) = self.active.get_mut(connection_id) {
            entry.last_activity = Instant::now();
        }

        info!(
            "attached container {} to session {session_id}",
            container.id
        );
        self.repo
            .get(&session_id)
            .await?
            .context("session record missing after attach")
    }

    /// Rebind a persisted session to a new connection.
    ///
    /// Verifies via the runtime that the referenced container is still
    /// running. A dead or missing container deterministically resolves to a
    /// terminated record and `None`; callers must then create a fresh
    /// session.
    pub async fn restore_session(
        &self,
        new_connection_id: &str,
        persisted: Session,
    ) -> Result<Option<Session>> {
        let Some(ref container_id) = persisted.container_id else {
            self.repo
                .finalize(&persisted.id, SessionStatus::Terminated, None)
                .await?;
            return Ok(None);
        };

        self.repo
            .update_status(&persisted.id, SessionStatus::Restoring)
            .await?;

        let running = matches!(
            self.runtime.inspect(container_id).await,
            Ok(Some(info)) if info.state.is_running()
        );

        if !running {
            info!(
                "container {container_id} for session {} is gone; terminating record",
                persisted.id
            );
            self.pool.release(container_id, ReleaseMode::Terminate).await;
            self.repo
                .finalize(&persisted.id, SessionStatus::Terminated, None)
                .await?;
            return Ok(None);
        }

        // One-time key: a successful restore rotates it.
        self.repo
            .rotate_restore_key(&persisted.id, &generate_restore_key())
            .await?;
        self.repo
            .bind_connection(&persisted.id, new_connection_id)
            .await?;
        self.insert_active(new_connection_id, &persisted.id);

        info!(
            "restored session {} onto connection {new_connection_id}",
            persisted.id
        );
        self.repo.get(&persisted.id).await
    }

    /// Restore by one-time key (the HTTP restore path).
    pub async fn restore_by_key(
        &self,
        new_connection_id: &str,
        restore_key: &str,
    ) -> Result<Option<Session>> {
        let Some(persisted) = self.repo.get_by_restore_key(restore_key).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if persisted.is_expired(now) {
            if !persisted.status.is_terminal() {
                self.terminate(&persisted, SessionStatus::Expired, None).await;
            }
            return Ok(None);
        }
        if !persisted.is_restorable(now) {
            return Ok(None);
        }

        self.restore_session(new_connection_id, persisted).await
    }

    /// Bump activity. Always updates memory; persists at most once per
    /// configured interval to avoid write amplification. Persistence
    /// failures are logged, never surfaced.
    pub async fn update_activity(&self, connection_id: &str) {
        let persist = {
            let Some(mut entry) = self.active.get_mut(connection_id) else {
                return;
            };
            entry.last_activity = Instant::now();
            if entry.last_persisted.elapsed() >= self.config.activity_persist_interval {
                entry.last_persisted = Instant::now();
                Some(entry.session_id.clone())
            } else {
                None
            }
        };

        if let Some(session_id) = persist {
            if let Err(e) = self.repo.touch_activity(&session_id, Utc::now()).await {
                warn!("persisting activity for session {session_id} failed: {e:#}");
            }
        }
    }

    /// Transport dropped: demote to disconnected, retaining the container so
    /// the session stays restorable until it expires.
    pub async fn disconnect_session(&self, connection_id: &str) {
        let Some((_, entry)) = self.active.remove(connection_id) else {
            return;
        };
        if entry.cleaned_up.load(Ordering::SeqCst) {
            return;
        }

        match self.repo.get(&entry.session_id).await {
            Ok(Some(session)) if !session.status.is_terminal() => {
                if let Err(e) = self.repo.mark_disconnected(&session.id).await {
                    warn!("marking session {} disconnected failed: {e:#}", session.id);
                } else {
                    info!(
                        "session {} disconnected; container retained for restore",
                        session.id
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!("disconnect lookup failed: {e:#}"),
        }
    }

    /// Terminate the session bound to a connection: release its container,
    /// finalize the record, clear in-memory state.
    ///
    /// Idempotent — the first caller wins, repeated calls are no-ops.
    pub async fn cleanup_session(&self, connection_id: &str) -> Result<()> {
        let Some((_, entry)) = self.active.remove(connection_id) else {
            return Ok(());
        };
        if entry.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(session) = self.repo.get(&entry.session_id).await? else {
            return Ok(());
        };
        if session.status.is_terminal() {
            return Ok(());
        }

        self.terminate(&session, SessionStatus::Terminated, None).await;
        Ok(())
    }

    /// Record an unrecoverable failure: release the container, mark the
    /// session `error`.
    pub async fn fail_session(&self, connection_id: &str, message: &str) {
        let Some((_, entry)) = self.active.remove(connection_id) else {
            return;
        };
        if entry.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.repo.get(&entry.session_id).await {
            Ok(Some(session)) if !session.status.is_terminal() => {
                self.terminate(&session, SessionStatus::Error, Some(message)).await;
            }
            Ok(_) => {}
            Err(e) => warn!("fail_session lookup failed: {e:#}"),
        }
    }

    /// Session id currently bound to a connection.
    pub fn session_id_for_connection(&self, connection_id: &str) -> Option<String> {
        self.active
            .get(connection_id)
            .map(|entry| entry.session_id.clone())
    }

    /// Live sessions for one user, for the transport's session listing.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        let sessions = self.repo.list_live_by_user(user_id).await?;
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }

    /// All sessions (HTTP listing).
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.repo.list().await
    }

    /// Counts by status for the monitor.
    pub async fn status_counts(&self) -> Result<std::collections::HashMap<String, usize>> {
        let sessions = self.repo.list().await?;
        let mut counts = std::collections::HashMap::new();
        for session in &sessions {
            *counts.entry(session.status.to_string()).or_insert(0) += 1;
        }
        counts.insert("connected".to_string(), self.active.len());
        Ok(counts)
    }

    /// The persisted audit-log tail for a session.
    pub async fn session_logs(&self, session_id: &str) -> Result<Vec<SessionLogEntry>> {
        self.repo.list_log_entries(session_id).await
    }

    /// Persist the redacted tail of a relay's log ring buffer.
    pub async fn record_session_logs(&self, entries: Vec<SessionLogEntry>) {
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.repo.insert_log_entries(&entries).await {
            warn!("persisting session log tail failed: {e:#}");
        }
    }

    /// One pass of the idle/expiry sweep.
    ///
    /// Idle demotion never touches the container; expiry terminates. The two
    /// are independent: activity never extends the absolute expiry.
    pub async fn sweep(&self) {
        // Idle: active connections without recent activity.
        let idle: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.last_activity.elapsed() >= self.config.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for connection_id in idle {
            info!("connection {connection_id} idle past timeout; demoting session");
            self.disconnect_session(&connection_id).await;
        }

        // Expiry: absolute ceiling over every open session.
        let open = match self.repo.list_open().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("expiry sweep query failed: {e:#}");
                return;
            }
        };

        let now = Utc::now();
        for session in open {
            if session.is_expired(now) {
                info!("session {} expired; terminating", session.id);
                if let Some(connection_id) = session.connection_id.clone() {
                    self.active.remove(&connection_id);
                }
                self.terminate(&session, SessionStatus::Expired, None).await;
            }
        }
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        })
    }

    /// Startup reconciliation: probe every open persisted session against
    /// the runtime. Running containers are demoted to disconnected
    /// (restorable); everything else is terminated.
    pub async fn startup_reconcile(&self) -> Result<()> {
        let open = self.repo.list_open().await?;
        if open.is_empty() {
            return Ok(());
        }
        info!("reconciling {} persisted session(s)", open.len());

        let now = Utc::now();
        for session in open {
            if session.is_expired(now) {
                self.terminate(&session, SessionStatus::Expired, None).await;
                continue;
            }

            let Some(ref container_id) = session.container_id else {
                self.repo
                    .finalize(&session.id, SessionStatus::Terminated, None)
                    .await
                    .ok();
                continue;
            };

            let running = matches!(
                self.runtime.inspect(container_id).await,
                Ok(Some(info)) if info.state.is_running()
            );
            if running {
                debug!(
                    "session {} container {container_id} still running; restorable",
                    session.id
                );
                if let Err(e) = self.repo.mark_disconnected(&session.id).await {
                    warn!("demoting session {} failed: {e:#}", session.id);
                }
            } else {
                self.terminate(&session, SessionStatus::Terminated, None).await;
            }
        }

        Ok(())
    }

    /// Container ids still referenced by restorable sessions, for orphan
    /// reaping after reconciliation.
    pub async fn restorable_container_ids(&self) -> Result<std::collections::HashSet<String>> {
        let open = self.repo.list_open().await?;
        Ok(open
            .into_iter()
            .filter(|s| s.status.is_restorable())
            .filter_map(|s| s.container_id)
            .collect())
    }

    /// Terminate every open session (graceful shutdown).
    pub async fn shutdown(&self) {
        let open = match self.repo.list_open().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("shutdown session listing failed: {e:#}");
                return;
            }
        };
        for session in open {
            self.terminate(&session, SessionStatus::Terminated, None).await;
        }
        self.active.clear();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn insert_active(&self, connection_id: &str, session_id: &str) {
        self.active.insert(
            connection_id.to_string(),
            ActiveSession {
                session_id: session_id.to_string(),
                last_activity: Instant::now(),
                last_persisted: Instant::now(),
                cleaned_up: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    /// Release the container and finalize the record. Failures are logged;
    /// bookkeeping proceeds regardless.
    async fn terminate(&self, session: &Session, status: SessionStatus, error: Option<&str>) {
        if let Some(ref container_id) = session.container_id {
            self.pool.release(container_id, ReleaseMode::Terminate).await;
        }
        if let Err(e) = self.repo.finalize(&session.id, status, error).await {
            warn!("finalizing session {} failed: {e:#}", session.id);
        }
    }
}

fn generate_restore_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_restore_key_shape() {
        let key = generate_restore_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_restore_key());
    }
}
