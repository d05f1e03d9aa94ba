//! Container subsystem errors.

use thiserror::Error;

/// Errors from the container runtime and pool.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Input failed validation before any runtime call was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The runtime binary could not be invoked.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime ran but reported a failure.
    #[error("container runtime command failed: {0}")]
    CommandFailed(String),

    /// Runtime output could not be parsed.
    #[error("unexpected runtime output: {0}")]
    UnexpectedOutput(String),

    /// No container with the given id exists.
    #[error("container not found: {0}")]
    NotFound(String),

    /// A container did not become ready within the allowed window.
    #[error("container {id} not ready after {waited_secs}s")]
    ReadyTimeout { id: String, waited_secs: u64 },

    /// Provisioning for an acquire call failed.
    #[error("failed to provision container for profile '{profile}': {reason}")]
    ProvisionFailed { profile: String, reason: String },
}

pub type ContainerResult<T> = std::result::Result<T, ContainerError>;
