//! API request handlers.
//!
//! Each handler is a thin wrapper over one pool or session-manager
//! operation plus response serialization.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::container::{AcquireOptions, ContainerHandle, PoolContainerView, ReleaseMode};
use crate::monitor::{Alert, record_kind};
use crate::session::{Session, SessionLogEntry};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Containers
// ============================================================================

/// Request to lease a container.
#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    /// Container profile; the configured default when omitted.
    #[serde(default)]
    pub profile: Option<String>,
    /// Image/resource overrides for this lease.
    #[serde(default)]
    pub options: AcquireOptions,
}

/// Lease a container from the pool (provisioning on demand if empty).
#[instrument(skip(state, request))]
pub async fn create_container(
    State(state): State<AppState>,
    Json(request): Json<CreateContainerRequest>,
) -> ApiResult<Json<ContainerHandle>> {
    let profile = request
        .profile
        .unwrap_or_else(|| state.default_profile.clone());
    let handle = state.pool.acquire(&profile, request.options).await?;
    info!(container = %handle.id, %profile, "leased container");
    Ok(Json(handle))
}

/// Terminate a container.
#[instrument(skip(state))]
pub async fn stop_container(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.pool.release(&container_id, ReleaseMode::Terminate).await;
    info!(container = %container_id, "released container");
    Ok(StatusCode::NO_CONTENT)
}

/// List pooled and leased containers.
#[instrument(skip(state))]
pub async fn list_containers(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PoolContainerView>>> {
    Ok(Json(state.pool.list_containers().await))
}

// ============================================================================
// Image import
// ============================================================================

/// Response from an image build.
#[derive(Debug, Serialize)]
pub struct ImportImageResponse {
    pub tag: String,
}

/// Build a user-supplied container definition into an image.
///
/// Multipart form: `tag` (text) and `dockerfile` (file).
#[instrument(skip(state, multipart))]
pub async fn import_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ImportImageResponse>> {
    let mut tag: Option<String> = None;
    let mut dockerfile: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("reading upload: {e}")))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("tag") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("reading tag: {e}")))?;
                tag = Some(value);
            }
            Some("dockerfile") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("reading dockerfile: {e}")))?;
                dockerfile = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let tag = tag.ok_or_else(|| ApiError::bad_request("missing 'tag' field"))?;
    let dockerfile = dockerfile.ok_or_else(|| ApiError::bad_request("missing 'dockerfile' field"))?;

    let context_dir = std::env::temp_dir().join(format!("warren-build-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&context_dir)
        .await
        .map_err(|e| ApiError::internal(format!("creating build context: {e}")))?;
    tokio::fs::write(context_dir.join("Dockerfile"), &dockerfile)
        .await
        .map_err(|e| ApiError::internal(format!("writing build context: {e}")))?;

    let result = state.runtime.build_image(&context_dir, &tag).await;
    let _ = tokio::fs::remove_dir_all(&context_dir).await;
    result?;

    info!(%tag, "imported custom image");
    Ok(Json(ImportImageResponse { tag }))
}

// ============================================================================
// Sessions
// ============================================================================

/// Request to restore a session by its one-time key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionRequest {
    pub restore_key: String,
}

/// Restore response: the rebound session plus the rotated restore key.
#[derive(Debug, Serialize)]
pub struct RestoreSessionResponse {
    #[serde(flatten)]
    pub session: Session,
    pub restore_key: String,
}

/// Restore a disconnected session by key.
///
/// A dead container yields 410: the client must reconnect fresh rather than
/// assume the old sandbox survived.
#[instrument(skip(state, request))]
pub async fn restore_session(
    State(state): State<AppState>,
    Json(request): Json<RestoreSessionRequest>,
) -> ApiResult<Json<RestoreSessionResponse>> {
    if request.restore_key.is_empty() {
        return Err(ApiError::bad_request("restore key is required"));
    }

    let connection_id = format!("restore-{}", Uuid::new_v4());
    let restored = state
        .sessions
        .restore_by_key(&connection_id, &request.restore_key)
        .await?;

    match restored {
        Some(session) => {
            info!(session = %session.id, "restored session by key");
            let restore_key = session.restore_key.clone();
            Ok(Json(RestoreSessionResponse {
                session,
                restore_key,
            }))
        }
        None => Err(ApiError::gone(
            "session cannot be restored; please reconnect fresh",
        )),
    }
}

/// List all sessions.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state.sessions.list_sessions().await?;
    Ok(Json(sessions))
}

/// The persisted audit-log tail of a session.
#[instrument(skip(state))]
pub async fn session_logs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<SessionLogEntry>>> {
    let entries = state.sessions.session_logs(&session_id).await?;
    Ok(Json(entries))
}

// ============================================================================
// Monitoring
// ============================================================================

/// Standing and recent alerts.
#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub active: Vec<Alert>,
    pub recent: Vec<Alert>,
}

pub async fn alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    Json(AlertsResponse {
        active: state.monitor.active_alerts(),
        recent: state.monitor.recent_alerts(),
    })
}

/// The latest record of each metric kind.
#[derive(Debug, Serialize)]
pub struct LatestMetricsResponse {
    pub system: Option<serde_json::Value>,
    pub containers: Option<serde_json::Value>,
    pub pool: Option<serde_json::Value>,
    pub sessions: Option<serde_json::Value>,
}

pub async fn latest_metrics(
    State(state): State<AppState>,
) -> ApiResult<Json<LatestMetricsResponse>> {
    let repo = state.monitor.repository();
    let system = repo.latest(record_kind::SYSTEM).await?.map(|(_, v)| v);
    let containers = repo.latest(record_kind::CONTAINERS).await?.map(|(_, v)| v);
    let pool = repo.latest(record_kind::POOL).await?.map(|(_, v)| v);
    let sessions = repo.latest(record_kind::SESSIONS).await?.map(|(_, v)| v);

    Ok(Json(LatestMetricsResponse {
        system,
        containers,
        pool,
        sessions,
    }))
}
