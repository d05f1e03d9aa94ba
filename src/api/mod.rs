//! HTTP API module.
//!
//! Thin wrappers over the pool and session manager, plus the WebSocket
//! upgrade route. No session or container logic lives here.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
