//! Application state shared across handlers.

use std::sync::Arc;

use crate::container::{ContainerPool, ContainerRuntimeApi};
use crate::monitor::ResourceMonitor;
use crate::relay::SshSettings;
use crate::session::SessionManager;

/// Application state shared across all handlers.
///
/// Pool and session manager are constructed once in `main` and passed here
/// by value; nothing reaches their internal maps except through their
/// published operations.
#[derive(Clone)]
pub struct AppState {
    /// Container pool for lease/release and warm inventory.
    pub pool: ContainerPool,
    /// Session state machine and persistence.
    pub sessions: SessionManager,
    /// Runtime handle for the image-import endpoint.
    pub runtime: Arc<dyn ContainerRuntimeApi>,
    /// Resource monitor, for alert and metric queries.
    pub monitor: ResourceMonitor,
    /// Profile leased when `start_session` names none.
    pub default_profile: String,
    /// Relay SSH settings.
    pub ssh_settings: SshSettings,
}

impl AppState {
    pub fn new(
        pool: ContainerPool,
        sessions: SessionManager,
        runtime: Arc<dyn ContainerRuntimeApi>,
        monitor: ResourceMonitor,
        default_profile: String,
    ) -> Self {
        Self {
            pool,
            sessions,
            runtime,
            monitor,
            default_profile,
            ssh_settings: SshSettings::default(),
        }
    }
}
