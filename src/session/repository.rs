//! Session database repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{Session, SessionLogEntry, SessionStatus};

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new session.
    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, connection_id, user_id, container_id, container_name,
                ssh_host, ssh_port, ssh_username, restore_key,
                status, created_at, last_activity, expires_at, terminated_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.connection_id)
        .bind(&session.user_id)
        .bind(&session.container_id)
        .bind(&session.container_name)
        .bind(&session.ssh_host)
        .bind(session.ssh_port)
        .bind(&session.ssh_username)
        .bind(&session.restore_key)
        .bind(session.status.to_string())
        .bind(&session.created_at)
        .bind(&session.last_activity)
        .bind(&session.expires_at)
        .bind(&session.terminated_at)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// Get a session by its restore key.
    pub async fn get_by_restore_key(&self, restore_key: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            WHERE restore_key = ?
            "#,
        )
        .bind(restore_key)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session by restore key")?;

        Ok(session)
    }

    /// Most recent restorable session for a user: status active/disconnected,
    /// unexpired, with a container reference.
    pub async fn find_restorable(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            WHERE user_id = ?
              AND status IN ('active', 'disconnected')
              AND expires_at > ?
              AND container_id IS NOT NULL
            ORDER BY last_activity DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(crate::db::timestamp(now))
        .fetch_optional(&self.pool)
        .await
        .context("finding restorable session")?;

        Ok(session)
    }

    /// Sessions a user can see as live: active or disconnected-but-restorable.
    pub async fn list_live_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            WHERE user_id = ? AND status IN ('creating', 'active', 'disconnected', 'restoring')
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing live sessions by user")?;

        Ok(sessions)
    }

    /// All non-terminal sessions (startup reconciliation, sweeps).
    pub async fn list_open(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            WHERE status IN ('creating', 'active', 'disconnected', 'restoring')
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing open sessions")?;

        Ok(sessions)
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, connection_id, user_id, container_id, container_name,
                   ssh_host, ssh_port, ssh_username, restore_key,
                   status, created_at, last_activity, expires_at, terminated_at, error_message
            FROM sessions
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// Update session status.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// Attach container fields and mark the session active.
    pub async fn attach_container(
        &self,
        id: &str,
        container_id: &str,
        container_name: &str,
        ssh_host: &str,
        ssh_port: i64,
        ssh_username: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET container_id = ?, container_name = ?, ssh_host = ?, ssh_port = ?,
                ssh_username = ?, status = 'active'
            WHERE id = ?
            "#,
        )
        .bind(container_id)
        .bind(container_name)
        .bind(ssh_host)
        .bind(ssh_port)
        .bind(ssh_username)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("attaching container to session")?;

        Ok(())
    }

    /// Rebind a session to a new transport connection and mark it active.
    pub async fn bind_connection(&self, id: &str, connection_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET connection_id = ?, status = 'active', last_activity = ? WHERE id = ?",
        )
        .bind(connection_id)
        .bind(crate::db::now_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("binding session connection")?;

        Ok(())
    }

    /// Persist an activity bump.
    pub async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = ? WHERE id = ?")
            .bind(crate::db::timestamp(at))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session activity")?;

        Ok(())
    }

    /// Demote to disconnected, clearing the bound connection.
    pub async fn mark_disconnected(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'disconnected', connection_id = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking session disconnected")?;

        Ok(())
    }

    /// Finalize a session into a terminal status.
    pub async fn finalize(&self, id: &str, status: SessionStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, terminated_at = ?, connection_id = NULL, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(crate::db::now_timestamp())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("finalizing session")?;

        Ok(())
    }

    /// Replace the restore key (one-time semantics: rotated on use).
    pub async fn rotate_restore_key(&self, id: &str, new_key: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET restore_key = ? WHERE id = ?")
            .bind(new_key)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("rotating restore key")?;

        Ok(())
    }

    /// Append audit-log entries for a session.
    pub async fn insert_log_entries(&self, entries: &[SessionLogEntry]) -> Result<()> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO session_logs (session_id, recorded_at, stream, summary) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.session_id)
            .bind(&entry.recorded_at)
            .bind(&entry.stream)
            .bind(&entry.summary)
            .execute(&self.pool)
            .await
            .context("inserting session log entry")?;
        }

        Ok(())
    }

    /// Log tail for a session, oldest first.
    pub async fn list_log_entries(&self, session_id: &str) -> Result<Vec<SessionLogEntry>> {
        let entries = sqlx::query_as::<_, SessionLogEntry>(
            r#"
            SELECT session_id, recorded_at, stream, summary
            FROM session_logs
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing session log entries")?;

        Ok(entries)
    }
}
