//! WebSocket message types for the terminal protocol.
//!
//! These types define the wire protocol between the browser terminal and the
//! backend. Commands and events are JSON-tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::relay::SshCredentials;
use crate::session::SessionSummary;

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Events sent from the backend to the terminal client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// WebSocket connection established.
    Connected,

    /// Heartbeat/keepalive ping.
    Ping,

    /// Terminal output bytes (stderr chunks carry a visual marker).
    Output { data: String },

    /// The SSH shell is open and ready for input.
    SshConnected {
        session_id: String,
        container_name: Option<String>,
        restored: bool,
        /// One-time key for rebinding after a dropped connection.
        restore_key: String,
    },

    /// Human-readable failure. Sent for validation and connection errors.
    Error { message: String },

    /// The caller's live sessions.
    ActiveSessions { sessions: Vec<SessionSummary> },

    /// The bridge closed (shell exit, explicit end, or transport loss).
    SessionClosed { reason: String },
}

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Commands sent from the terminal client to the backend.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    /// Pong response to ping.
    Pong,

    /// Bind this connection to a session and open its shell.
    StartSession {
        /// Container profile to lease; the configured default when omitted.
        #[serde(default)]
        profile: Option<String>,
        credentials: SshCredentials,
    },

    /// Keystrokes for the shell.
    Input { data: String },

    /// Terminal geometry change.
    Resize { cols: u32, rows: u32 },

    /// Explicitly end the session, terminating its container.
    EndSession,

    /// List the caller's live sessions.
    GetActiveSessions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_session_wire_format() {
        let json = r#"{
            "type": "start_session",
            "profile": "ssh-terminal",
            "credentials": {
                "host": "127.0.0.1",
                "port": 42101,
                "username": "sandbox",
                "password": "pw"
            }
        }"#;
        let cmd: WsCommand = serde_json::from_str(json).unwrap();
        match cmd {
            WsCommand::StartSession { profile, credentials } => {
                assert_eq!(profile.as_deref(), Some("ssh-terminal"));
                assert!(credentials.validate().is_ok());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_input_and_end() {
        let input: WsCommand = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(input, WsCommand::Input { .. }));

        let end: WsCommand = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert!(matches!(end, WsCommand::EndSession));
    }

    #[test]
    fn test_event_serialization() {
        let event = WsEvent::SshConnected {
            session_id: "s1".into(),
            container_name: Some("warren-ssh-terminal-1".into()),
            restored: false,
            restore_key: "abc123".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ssh_connected\""));
        assert!(json.contains("restore_key"));
    }
}
