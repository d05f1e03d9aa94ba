//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session lifecycle status.
///
/// ```text
/// creating -> active -> disconnected -> restoring -> active
///                 \           \             \
///                  +-----------+-------------+--> terminated | expired
/// ```
///
/// `error` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Record persisted, container not yet attached.
    Creating,
    /// Bound to a live connection with an attached container.
    Active,
    /// Connection gone; container retained for restore.
    Disconnected,
    /// A new connection is rebinding to this session.
    Restoring,
    /// Ended: container released, record finalized.
    Terminated,
    /// Absolute lifetime exceeded.
    Expired,
    /// Unrecoverable failure.
    Error,
}

impl SessionStatus {
    /// Terminal states can never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Expired | SessionStatus::Error
        )
    }

    /// States a session can be restored from.
    pub fn is_restorable(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Disconnected)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Restoring => "restoring",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Expired => "expired",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(SessionStatus::Creating),
            "active" => Ok(SessionStatus::Active),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "restoring" => Ok(SessionStatus::Restoring),
            "terminated" => Ok(SessionStatus::Terminated),
            "expired" => Ok(SessionStatus::Expired),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A shell session.
///
/// Credentials are sanitized before this struct exists: the SSH username and
/// endpoint are kept for restore, the secret never leaves the relay.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Internal session id.
    pub id: String,
    /// Transport connection currently bound to this session, if any.
    pub connection_id: Option<String>,
    /// Owning user ("anonymous" when the transport carries no identity).
    pub user_id: String,
    /// Attached container id (set by attach).
    pub container_id: Option<String>,
    /// Attached container name.
    pub container_name: Option<String>,
    /// SSH endpoint host of the attached container.
    pub ssh_host: Option<String>,
    /// SSH endpoint port of the attached container.
    pub ssh_port: Option<i64>,
    /// Username used for the SSH channel.
    pub ssh_username: Option<String>,
    /// One-time secret that rebinds a disconnected session.
    #[serde(skip_serializing)]
    pub restore_key: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub created_at: String,
    pub last_activity: String,
    pub expires_at: String,
    pub terminated_at: Option<String>,
    pub error_message: Option<String>,
}

impl Session {
    /// Whether the absolute expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(expires) => expires.with_timezone(&Utc) <= now,
            Err(_) => true,
        }
    }

    /// Restorable: non-terminal restorable status, unexpired, has a container.
    pub fn is_restorable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_restorable() && !self.is_expired(now) && self.container_id.is_some()
    }
}

/// One persisted line of a session's audit-log tail.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionLogEntry {
    pub session_id: String,
    pub recorded_at: String,
    pub stream: String,
    pub summary: String,
}

/// Session summary sent over the transport for `get_active_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub container_name: Option<String>,
    pub created_at: String,
    pub last_activity: String,
    pub expires_at: String,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            status: session.status,
            container_name: session.container_name.clone(),
            created_at: session.created_at.clone(),
            last_activity: session.last_activity.clone(),
            expires_at: session.expires_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_session(status: SessionStatus, expires_at: DateTime<Utc>) -> Session {
        Session {
            id: "s1".into(),
            connection_id: Some("c1".into()),
            user_id: "alice".into(),
            container_id: Some("abc".into()),
            container_name: Some("warren-ssh-terminal-1".into()),
            ssh_host: Some("127.0.0.1".into()),
            ssh_port: Some(42101),
            ssh_username: Some("sandbox".into()),
            restore_key: "deadbeef".into(),
            status,
            created_at: Utc::now().to_rfc3339(),
            last_activity: Utc::now().to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
            terminated_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Creating,
            SessionStatus::Active,
            SessionStatus::Disconnected,
            SessionStatus::Restoring,
            SessionStatus::Terminated,
            SessionStatus::Expired,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_restorable() {
        let now = Utc::now();
        let future = now + Duration::hours(1);

        assert!(sample_session(SessionStatus::Disconnected, future).is_restorable(now));
        assert!(sample_session(SessionStatus::Active, future).is_restorable(now));
        assert!(!sample_session(SessionStatus::Terminated, future).is_restorable(now));

        // Expired sessions are never restorable regardless of status.
        let past = now - Duration::hours(1);
        assert!(!sample_session(SessionStatus::Disconnected, past).is_restorable(now));

        // No container reference, nothing to rebind to.
        let mut detached = sample_session(SessionStatus::Disconnected, future);
        detached.container_id = None;
        assert!(!detached.is_restorable(now));
    }

    #[test]
    fn test_restore_key_not_serialized() {
        let session = sample_session(SessionStatus::Active, Utc::now());
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("deadbeef"));
    }
}
