//! Session management module.
//!
//! The session state machine, its persisted representation, and the
//! reconnection/restore flow.

mod models;
mod repository;
mod service;

pub use models::{Session, SessionLogEntry, SessionStatus, SessionSummary};
pub use repository::SessionRepository;
pub use service::{ANONYMOUS_USER, SessionManager, SessionManagerConfig, SessionStart};
