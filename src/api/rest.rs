//! REST API Handlers
//!
//! Exposes the four attachment lifecycle operations and a health probe.
//! Request and response bodies are JSON; connection and detach results are
//! returned exactly as the orchestrator produced them.

use crate::attachment::AttachmentOrchestrator;
use crate::domain::model::{AttachmentRecord, Connector, SnapshotRef, VolumeRef};
use crate::error::{Error, ErrorAction};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Attach a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachRequest {
    /// Array LUN backing the volume
    pub lun_id: String,
    pub connector: Connector,
}

/// Detach a volume; no connector means detach from every host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDetachRequest {
    pub lun_id: String,
    #[serde(default)]
    pub connector: Option<Connector>,
    /// Platform attachments of the volume
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

/// Attach a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotAttachRequest {
    /// Array snapshot id
    pub snap_id: String,
    pub connector: Connector,
}

/// Detach a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDetachRequest {
    pub snap_id: String,
    #[serde(default)]
    pub connector: Option<Connector>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub protocol: String,
    pub version: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::MissingInitiator { .. } => "missing_initiator",
        Error::ApiValidation(_) => "invalid_request",
        Error::ResourceNotFound { .. } => "not_found",
        Error::HostResolution { .. } => "host_resolution_failed",
        Error::Exposure { .. } => "exposure_failed",
        Error::HluNotFound { .. } => "hlu_not_found",
        Error::NoTargetPorts => "no_target_ports",
        Error::NoAccessiblePaths { .. } => "no_accessible_paths",
        Error::ZoneLookup(_) => "zone_lookup_failed",
        Error::ArrayOperation { .. } | Error::Http(_) => "array_error",
        _ => "internal_error",
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::MissingInitiator { .. } | Error::ApiValidation(_) => StatusCode::BAD_REQUEST,
        Error::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
        Error::ArrayOperation { .. }
        | Error::Exposure { .. }
        | Error::HostResolution { .. }
        | Error::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an adapter error into an HTTP response
pub fn error_response(err: &Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }
    (
        status,
        Json(ApiErrorResponse {
            error: error_code(err).into(),
            message: err.to_string(),
            retryable: err.action() == ErrorAction::RetryLater,
        }),
    )
        .into_response()
}

fn require(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::ApiValidation(format!("{} must not be empty", field)));
    }
    Ok(())
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<AttachmentOrchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<AttachmentOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            .route(
                "/v1/volumes/:id/connection",
                post(attach_volume).delete(detach_volume),
            )
            .route(
                "/v1/snapshots/:id/connection",
                post(attach_snapshot).delete(detach_snapshot),
            )
            .route("/healthz", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<AttachmentOrchestrator>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VolumeAttachRequest>,
) -> Response {
    info!("Attaching volume {} to {}", id, request.connector.host);
    if let Err(e) = require("lunId", &request.lun_id) {
        return error_response(&e);
    }

    let volume = VolumeRef::new(id, request.lun_id);
    match state
        .orchestrator
        .initialize_connection(&volume, &request.connector)
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VolumeDetachRequest>,
) -> Response {
    info!("Detaching volume {}", id);
    if let Err(e) = require("lunId", &request.lun_id) {
        return error_response(&e);
    }

    let volume = VolumeRef {
        id,
        lun_id: request.lun_id,
        attachments: request.attachments,
    };
    match state
        .orchestrator
        .terminate_connection(&volume, request.connector.as_ref())
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn attach_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SnapshotAttachRequest>,
) -> Response {
    info!("Attaching snapshot {} to {}", id, request.connector.host);
    if let Err(e) = require("snapId", &request.snap_id) {
        return error_response(&e);
    }

    let snapshot = SnapshotRef::new(id, request.snap_id);
    match state
        .orchestrator
        .initialize_snapshot_connection(&snapshot, &request.connector)
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn detach_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SnapshotDetachRequest>,
) -> Response {
    info!("Detaching snapshot {}", id);
    if let Err(e) = require("snapId", &request.snap_id) {
        return error_response(&e);
    }

    let snapshot = SnapshotRef {
        id,
        snap_id: request.snap_id,
        attachments: request.attachments,
    };
    match state
        .orchestrator
        .terminate_snapshot_connection(&snapshot, request.connector.as_ref())
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            protocol: state.orchestrator.protocol().driver_volume_type().into(),
            version: crate::VERSION.into(),
        }),
    )
}
