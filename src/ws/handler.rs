//! WebSocket handler for terminal connections.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::AppState;
use crate::container::AcquireOptions;
use crate::relay::{
    OutputStream, RelayEvent, RelayInput, STDERR_MARKER, SshCredentials, TerminalRelay, open_shell,
};
use crate::session::{ANONYMOUS_USER, SessionStart};

use super::types::{WsCommand, WsEvent};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Size of the per-connection event buffer.
const EVENT_BUFFER_SIZE: usize = 256;

/// Size of the relay input buffer.
const INPUT_BUFFER_SIZE: usize = 64;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Identity is established by the fronting auth layer; we only read the
    // header it sets.
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string();

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user_id))
}

/// Drive one WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, state: AppState, user_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    info!("connection {connection_id} opened for user {user_id}");

    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<WsEvent>(EVENT_BUFFER_SIZE);

    // Outbound pump: events plus periodic pings.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize event: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    let Ok(json) = serde_json::to_string(&WsEvent::Ping) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    if event_tx.send(WsEvent::Connected).await.is_err() {
        send_task.abort();
        return;
    }

    // Inbound loop. `relay_input` is the live bridge, if any.
    let mut relay_input: Option<mpsc::Sender<RelayInput>> = None;

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<WsCommand>(text.as_str()) {
                    Ok(cmd) => {
                        handle_command(&state, &connection_id, &user_id, cmd, &event_tx, &mut relay_input)
                            .await;
                    }
                    Err(e) => {
                        debug!("unparsable command from {connection_id}: {e}");
                        let _ = event_tx
                            .send(WsEvent::Error {
                                message: format!("unrecognized command: {e}"),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                // Raw keystroke bytes, bypassing the JSON envelope.
                if let Some(ref input) = relay_input {
                    let _ = input.send(RelayInput::Data(data.to_vec())).await;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("connection {connection_id} closed by client");
                break;
            }
            Err(e) => {
                debug!("websocket error on {connection_id}: {e}");
                break;
            }
        }
    }

    // Transport gone. Dropping the input sender is the relay's disconnect
    // signal; it demotes the session instead of terminating it.
    drop(relay_input);
    send_task.abort();
    info!("connection {connection_id} finished");
}

/// Dispatch one command from the client.
async fn handle_command(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
    cmd: WsCommand,
    event_tx: &mpsc::Sender<WsEvent>,
    relay_input: &mut Option<mpsc::Sender<RelayInput>>,
) {
    match cmd {
        WsCommand::Pong => {}

        WsCommand::StartSession {
            profile,
            credentials,
        } => {
            let live = relay_input.as_ref().is_some_and(|tx| !tx.is_closed());
            if live {
                let _ = event_tx
                    .send(WsEvent::Error {
                        message: "a session is already active on this connection".to_string(),
                    })
                    .await;
                return;
            }

            *relay_input =
                start_session(state, connection_id, user_id, profile, credentials, event_tx).await;
        }

        WsCommand::Input { data } => match relay_input {
            Some(input) if !input.is_closed() => {
                let _ = input.send(RelayInput::Data(data.into_bytes())).await;
            }
            _ => {
                let _ = event_tx
                    .send(WsEvent::Error {
                        message: "no active session".to_string(),
                    })
                    .await;
            }
        },

        WsCommand::Resize { cols, rows } => {
            if let Some(input) = relay_input {
                let _ = input.send(RelayInput::Resize { cols, rows }).await;
            }
        }

        WsCommand::EndSession => {
            if let Some(input) = relay_input.take() {
                let _ = input.send(RelayInput::End).await;
            }
        }

        WsCommand::GetActiveSessions => {
            match state.sessions.list_for_user(user_id).await {
                Ok(sessions) => {
                    let _ = event_tx.send(WsEvent::ActiveSessions { sessions }).await;
                }
                Err(e) => {
                    let _ = event_tx
                        .send(WsEvent::Error {
                            message: format!("listing sessions failed: {e}"),
                        })
                        .await;
                }
            }
        }
    }
}

/// Full session start: validate, create-or-restore, lease + attach, open the
/// shell, and wire the bridge. Any failure is reported over the transport;
/// validation failures leave no state behind.
async fn start_session(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
    profile: Option<String>,
    credentials: SshCredentials,
    event_tx: &mpsc::Sender<WsEvent>,
) -> Option<mpsc::Sender<RelayInput>> {
    if let Err(e) = credentials.validate() {
        let _ = event_tx
            .send(WsEvent::Error {
                message: e.to_string(),
            })
            .await;
        return None;
    }
    let auth = match credentials.auth_method() {
        Ok(auth) => auth,
        Err(e) => {
            let _ = event_tx
                .send(WsEvent::Error {
                    message: e.to_string(),
                })
                .await;
            return None;
        }
    };

    let start = match state
        .sessions
        .create_session(connection_id, &credentials.username, user_id)
        .await
    {
        Ok(start) => start,
        Err(e) => {
            let _ = event_tx
                .send(WsEvent::Error {
                    message: format!("creating session failed: {e}"),
                })
                .await;
            return None;
        }
    };
    let restored = matches!(start, SessionStart::Restored(_));

    let (session, host, port) = match start {
        SessionStart::Created(_) => {
            let profile = profile.unwrap_or_else(|| state.default_profile.clone());
            let container = match state.pool.acquire(&profile, AcquireOptions::default()).await {
                Ok(container) => container,
                Err(e) => {
                    let _ = event_tx
                        .send(WsEvent::Error {
                            message: format!("no sandbox available: {e}"),
                        })
                        .await;
                    state
                        .sessions
                        .fail_session(connection_id, &e.to_string())
                        .await;
                    return None;
                }
            };

            match state.sessions.attach_container(connection_id, &container).await {
                Ok(session) => {
                    let host = container.host.clone();
                    let port = container.ssh_port;
                    (session, host, port)
                }
                Err(e) => {
                    state
                        .pool
                        .release(&container.id, crate::container::ReleaseMode::Terminate)
                        .await;
                    state
                        .sessions
                        .fail_session(connection_id, &e.to_string())
                        .await;
                    let _ = event_tx
                        .send(WsEvent::Error {
                            message: format!("attaching container failed: {e}"),
                        })
                        .await;
                    return None;
                }
            }
        }
        SessionStart::Restored(session) => {
            let host = session.ssh_host.clone().unwrap_or_default();
            let port = session.ssh_port.unwrap_or_default() as u16;
            (session, host, port)
        }
    };

    let shell = match open_shell(&host, port, &credentials.username, auth, &state.ssh_settings).await
    {
        Ok(shell) => shell,
        Err(e) => {
            let _ = event_tx
                .send(WsEvent::Error {
                    message: format!("SSH connection failed: {e}"),
                })
                .await;
            state
                .sessions
                .fail_session(connection_id, &e.to_string())
                .await;
            return None;
        }
    };

    let (relay_event_tx, mut relay_event_rx) = mpsc::channel::<RelayEvent>(EVENT_BUFFER_SIZE);
    let (input_tx, input_rx) = mpsc::channel::<RelayInput>(INPUT_BUFFER_SIZE);

    let relay = TerminalRelay::new(
        connection_id.to_string(),
        session.id.clone(),
        state.sessions.clone(),
        relay_event_tx,
    );
    tokio::spawn(relay.run(shell, input_rx));

    // Translate relay events into transport events.
    let event_tx_out = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = relay_event_rx.recv().await {
            let mapped = match event {
                RelayEvent::Output { data, stream } => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    let data = match stream {
                        OutputStream::Stdout => text,
                        OutputStream::Stderr => format!("{STDERR_MARKER}{text}\x1b[0m"),
                    };
                    WsEvent::Output { data }
                }
                RelayEvent::Closed { reason } => WsEvent::SessionClosed {
                    reason: reason.to_string(),
                },
            };
            if event_tx_out.send(mapped).await.is_err() {
                break;
            }
        }
    });

    let _ = event_tx
        .send(WsEvent::SshConnected {
            session_id: session.id.clone(),
            container_name: session.container_name.clone(),
            restored,
            restore_key: session.restore_key.clone(),
        })
        .await;

    info!(
        "session {} bridged on connection {connection_id} (restored: {restored})",
        session.id
    );
    Some(input_tx)
}
