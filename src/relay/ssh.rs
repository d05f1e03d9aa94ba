//! SSH client wrapper around russh.
//!
//! Opens an authenticated connection and an interactive shell channel with
//! bounded timeouts; the bridge pumps bytes through the returned shell.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use russh::client::{self, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key;

use super::RelayError;
use super::credentials::AuthMethod;

/// Settings for opening a shell.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Bound on TCP connect + handshake + auth.
    pub connect_timeout: Duration,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            term: "xterm-256color".to_string(),
            cols: 120,
            rows: 40,
        }
    }
}

/// An authenticated connection with an open interactive shell channel.
pub struct SshShell {
    handle: client::Handle<AcceptingHandler>,
    pub channel: Channel<Msg>,
}

impl SshShell {
    /// Best-effort orderly disconnect.
    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "session ended", "en")
            .await;
    }
}

/// Sandbox containers are disposable and get fresh host keys every lease,
/// so there is no persistent known-hosts set to verify against.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connect, authenticate with the single validated method, and open an
/// interactive PTY + shell channel.
pub async fn open_shell(
    host: &str,
    port: u16,
    username: &str,
    auth: AuthMethod,
    settings: &SshSettings,
) -> Result<SshShell, RelayError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });

    let connect = client::connect(config, (host, port), AcceptingHandler);
    let mut handle = tokio::time::timeout(settings.connect_timeout, connect)
        .await
        .map_err(|_| {
            RelayError::Connection(format!(
                "connection to {host}:{port} timed out after {}s",
                settings.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| RelayError::Connection(format!("could not reach {host}:{port}: {e}")))?;

    let authenticated = match auth {
        AuthMethod::Password(password) => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| RelayError::Connection(format!("authentication error: {e}")))?,
        AuthMethod::PrivateKey { pem, passphrase } => {
            let keypair = russh_keys::decode_secret_key(&pem, passphrase.as_deref())
                .map_err(|e| RelayError::Connection(format!("invalid private key: {e}")))?;
            handle
                .authenticate_publickey(username, Arc::new(keypair))
                .await
                .map_err(|e| RelayError::Connection(format!("authentication error: {e}")))?
        }
    };

    if !authenticated {
        return Err(RelayError::Connection(format!(
            "authentication failed for {username}@{host}:{port}"
        )));
    }

    debug!("ssh authenticated as {username}@{host}:{port}");

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| RelayError::Channel(format!("opening session channel: {e}")))?;

    channel
        .request_pty(
            false,
            &settings.term,
            settings.cols,
            settings.rows,
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| RelayError::Channel(format!("requesting pty: {e}")))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| RelayError::Channel(format!("starting shell: {e}")))?;

    Ok(SshShell { handle, channel })
}
