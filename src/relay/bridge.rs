//! Per-session terminal bridge.
//!
//! Pumps bytes between the transport and the session's SSH shell channel,
//! keeps a redacted ring-buffer log, and funnels all three termination
//! triggers through one guarded teardown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::session::{SessionLogEntry, SessionManager};

use super::ssh::SshShell;

/// Ring-buffer capacity for in-memory log entries.
const LOG_CAPACITY: usize = 1000;

/// How many entries are persisted when the session ends.
const LOG_PERSIST_TAIL: usize = 50;

/// Marker prefixed to stderr output sent over the transport.
pub const STDERR_MARKER: &str = "\x1b[31m";

/// Input from the transport into the bridge.
#[derive(Debug)]
pub enum RelayInput {
    /// Keystroke bytes for the shell.
    Data(Vec<u8>),
    /// Terminal geometry change.
    Resize { cols: u32, rows: u32 },
    /// Explicit end request from the caller.
    End,
}

/// Which remote stream produced a chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events from the bridge toward the transport.
#[derive(Debug)]
pub enum RelayEvent {
    Output { data: Vec<u8>, stream: OutputStream },
    Closed { reason: &'static str },
}

/// What ended the session. All three converge on the same teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    EndRequested,
    TransportClosed,
    ShellClosed,
}

/// Redacted session log: payload sizes and lifecycle markers, never content.
pub struct RelayLog {
    entries: VecDeque<(String, String, String)>,
    capacity: usize,
}

impl RelayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, stream: &str, summary: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries
            .push_back((crate::db::now_timestamp(), stream.to_string(), summary));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `n` entries as persistable rows.
    pub fn tail(&self, session_id: &str, n: usize) -> Vec<SessionLogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries
            .iter()
            .skip(skip)
            .map(|(at, stream, summary)| SessionLogEntry {
                session_id: session_id.to_string(),
                recorded_at: at.clone(),
                stream: stream.clone(),
                summary: summary.clone(),
            })
            .collect()
    }
}

/// The per-session bridge between transport and SSH channel.
pub struct TerminalRelay {
    connection_id: String,
    session_id: String,
    sessions: SessionManager,
    events: mpsc::Sender<RelayEvent>,
    log: RelayLog,
    finished: Arc<AtomicBool>,
    started: Instant,
}

impl TerminalRelay {
    pub fn new(
        connection_id: String,
        session_id: String,
        sessions: SessionManager,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        let mut log = RelayLog::new(LOG_CAPACITY);
        log.push("event", "ssh connected".to_string());
        Self {
            connection_id,
            session_id,
            sessions,
            events,
            log,
            finished: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        }
    }

    /// Pump until one of the three termination triggers fires, then tear
    /// down exactly once.
    pub async fn run(mut self, shell: SshShell, mut input: mpsc::Receiver<RelayInput>) {
        let mut shell = shell;
        let trigger;

        loop {
            tokio::select! {
                cmd = input.recv() => match cmd {
                    Some(RelayInput::Data(bytes)) => {
                        self.sessions.update_activity(&self.connection_id).await;
                        self.log.push("input", format!("{} bytes", bytes.len()));
                        if let Err(e) = shell.channel.data(&bytes[..]).await {
                            debug!("shell write failed: {e}");
                            trigger = Trigger::ShellClosed;
                            break;
                        }
                    }
                    Some(RelayInput::Resize { cols, rows }) => {
                        self.log.push("event", format!("resize {cols}x{rows}"));
                        if let Err(e) = shell.channel.window_change(cols, rows, 0, 0).await {
                            debug!("window change failed: {e}");
                        }
                    }
                    Some(RelayInput::End) => {
                        trigger = Trigger::EndRequested;
                        break;
                    }
                    None => {
                        trigger = Trigger::TransportClosed;
                        break;
                    }
                },

                msg = shell.channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        self.log.push("output", format!("{} bytes", data.len()));
                        if self.emit(RelayEvent::Output {
                            data: data.to_vec(),
                            stream: OutputStream::Stdout,
                        })
                        .await
                        .is_err()
                        {
                            trigger = Trigger::TransportClosed;
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                        self.log.push("stderr", format!("{} bytes", data.len()));
                        if self.emit(RelayEvent::Output {
                            data: data.to_vec(),
                            stream: OutputStream::Stderr,
                        })
                        .await
                        .is_err()
                        {
                            trigger = Trigger::TransportClosed;
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.log.push("event", format!("shell exit status {exit_status}"));
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        trigger = Trigger::ShellClosed;
                        break;
                    }
                    Some(_) => {}
                },
            }
        }

        self.finish(trigger).await;
        shell.disconnect().await;
    }

    async fn emit(&self, event: RelayEvent) -> Result<(), ()> {
        self.events.send(event).await.map_err(|_| ())
    }

    /// Guarded teardown: only the first trigger acts. Persists the log tail,
    /// records duration, and hands the state transition to the session
    /// manager — terminate for explicit end and shell close, retain for a
    /// dropped transport so the session stays restorable.
    async fn finish(&mut self, trigger: Trigger) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let duration = self.started.elapsed();
        let reason = match trigger {
            Trigger::EndRequested => "end requested",
            Trigger::TransportClosed => "transport disconnected",
            Trigger::ShellClosed => "shell closed",
        };
        info!(
            "session {} relay finished after {}s ({reason})",
            self.session_id,
            duration.as_secs()
        );
        self.log
            .push("event", format!("session ended after {}s: {reason}", duration.as_secs()));

        let tail = self.log.tail(&self.session_id, LOG_PERSIST_TAIL);
        self.sessions.record_session_logs(tail).await;

        match trigger {
            Trigger::EndRequested | Trigger::ShellClosed => {
                if let Err(e) = self.sessions.cleanup_session(&self.connection_id).await {
                    warn!("cleanup of session {} failed: {e:#}", self.session_id);
                }
            }
            Trigger::TransportClosed => {
                self.sessions.disconnect_session(&self.connection_id).await;
            }
        }

        let _ = self.emit(RelayEvent::Closed { reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_caps_entries() {
        let mut log = RelayLog::new(10);
        for i in 0..25 {
            log.push("output", format!("{i} bytes"));
        }
        assert_eq!(log.len(), 10);

        let tail = log.tail("s1", 3);
        assert_eq!(tail.len(), 3);
        // Oldest entries fell off the front; the tail is the newest three.
        assert_eq!(tail[2].summary, "24 bytes");
        assert_eq!(tail[0].summary, "22 bytes");
    }

    #[test]
    fn test_tail_shorter_than_requested() {
        let mut log = RelayLog::new(100);
        log.push("input", "3 bytes".into());
        let tail = log.tail("s1", 50);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].session_id, "s1");
        assert_eq!(tail[0].stream, "input");
    }
}
