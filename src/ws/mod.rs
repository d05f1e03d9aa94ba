//! Real-time transport: the WebSocket endpoint terminal clients connect to.
//!
//! One connection drives at most one session at a time. The handler
//! validates credentials, binds the connection to a session through the
//! session manager, and wires a terminal relay between the socket and the
//! session's SSH channel.

mod handler;
mod types;

pub use handler::ws_handler;
pub use types::{WsCommand, WsEvent};
