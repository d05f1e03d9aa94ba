//! Warren Library
//!
//! Core components of the Warren sandbox shell platform: the container
//! pool, the session state machine, the terminal relay, and the resource
//! monitor.

pub mod api;
pub mod container;
pub mod db;
pub mod monitor;
pub mod relay;
pub mod session;
pub mod ws;
