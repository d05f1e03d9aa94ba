//! Terminal relay: the bridge between the real-time transport and a
//! session's SSH shell channel.

mod bridge;
mod credentials;
mod ssh;

use thiserror::Error;

pub use bridge::{OutputStream, RelayEvent, RelayInput, RelayLog, STDERR_MARKER, TerminalRelay};
pub use credentials::{AuthMethod, SshCredentials};
pub use ssh::{SshSettings, SshShell, open_shell};

/// Relay failures, split by how they surface to the caller.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Rejected before any state was created.
    #[error("{0}")]
    Validation(String),

    /// SSH connect/auth failure; recorded as session status `error`.
    #[error("{0}")]
    Connection(String),

    /// Channel-level failure after the connection was up.
    #[error("{0}")]
    Channel(String),
}
