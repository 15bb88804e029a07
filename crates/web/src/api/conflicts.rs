//! Conflict detection and resolution endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use mergeflow_core::conflict::{Detection, FileResolution};
use mergeflow_core::service::ConflictResolution;

use crate::api::status::AppError;
use crate::api::{actor, blocking};
use crate::AppState;

#[derive(Deserialize)]
pub struct ResolveRequest {
    /// Path -> resolution, one per conflicting file.
    pub resolutions: BTreeMap<String, FileResolution>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/change_requests/:id/conflicts", get(list_conflicts))
        .route(
            "/api/change_requests/:id/conflicts/resolve",
            post(resolve_conflicts),
        )
}

async fn list_conflicts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Detection>, AppError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.conflicts(id)).await?))
}

async fn resolve_conflicts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ConflictResolution>, AppError> {
    let actor = actor(&headers)?;
    if req.resolutions.is_empty() {
        return Err(AppError::BadRequest("no resolutions given".into()));
    }

    let service = state.service.clone();
    let resolved = blocking(move || service.resolve_conflicts(&actor, id, &req.resolutions)).await?;
    info!(change_request = id, sha = %resolved.commit_sha, "conflicts resolved via API");
    Ok(Json(resolved))
}
