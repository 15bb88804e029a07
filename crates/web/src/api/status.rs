//! Status and health check endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use mergeflow_core::errors::{
    ConflictError, CoreError, DatabaseError, LifecycleError, OrchestratorError, SnapshotError,
};
use mergeflow_core::models::LifecycleState;

use crate::api::blocking;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

/// Merge queue overview.
#[derive(Serialize)]
struct StatusResponse {
    project: String,
    open: usize,
    locked: usize,
    pending_merges: usize,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/status/health", get(health_check))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let db = state.db.clone();
    let (open, locked, pending_merges) = blocking(move || {
        Ok((
            db.list_change_requests_in_state(LifecycleState::Open)?.len(),
            db.list_change_requests_in_state(LifecycleState::Locked)?.len(),
            db.list_pending_merges()?.len(),
        ))
    })
    .await?;

    Ok(Json(StatusResponse {
        project: state.config.repository.project.clone(),
        open,
        locked,
        pending_merges,
    }))
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// Simple API error type that converts to an Axum response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    /// The request lost a race or no longer applies to the current state.
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let msg = err.to_string();
        match err {
            CoreError::Access(_) | CoreError::Orchestrator(OrchestratorError::Access(_)) => {
                AppError::Forbidden(msg)
            }
            CoreError::Database(DatabaseError::NotFound { .. })
            | CoreError::Snapshot(SnapshotError::NoSnapshots(_))
            | CoreError::Snapshot(SnapshotError::RefNotFound(_))
            | CoreError::Conflict(ConflictError::RefNotFound(_)) => AppError::NotFound(msg),
            CoreError::Orchestrator(OrchestratorError::DatabaseError(DatabaseError::NotFound {
                ..
            })) => AppError::NotFound(msg),
            CoreError::Lifecycle(LifecycleError::StaleVersion { .. })
            | CoreError::Lifecycle(LifecycleError::InvalidTransition { .. })
            | CoreError::Conflict(ConflictError::AlreadyResolved)
            | CoreError::Conflict(ConflictError::StaleConflictSet { .. }) => AppError::Conflict(msg),
            CoreError::Conflict(ConflictError::MissingResolution(_))
            | CoreError::Conflict(ConflictError::InvalidResolution { .. })
            | CoreError::Conflict(ConflictError::UnresolvableInUi { .. }) => {
                AppError::Unprocessable(msg)
            }
            CoreError::Snapshot(SnapshotError::InvalidSnapshotOrder(_)) => AppError::BadRequest(msg),
            _ => AppError::Internal(msg),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        CoreError::from(err).into()
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = match self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::Conflict(msg)
            | AppError::Unprocessable(msg)
            | AppError::Internal(msg) => msg,
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
