//! Change request, merge and version endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use mergeflow_core::models::{
    ChangeRequest, DiffSet, DiffSnapshot, FileDiff, MergeCondition, MergeIntent, NewChangeRequest,
};
use mergeflow_core::orchestrator::MergeReport;
use mergeflow_core::service::{ChangeRequestEdit, CiSummary, RefreshOutcome};

use crate::api::status::AppError;
use crate::api::{actor, blocking};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LookupQuery {
    pub project: String,
    pub iid: i64,
}

#[derive(Deserialize)]
pub struct OpenRequest {
    pub source_project: Option<String>,
    pub source_branch: String,
    pub target_project: Option<String>,
    pub target_branch: String,
    pub title: String,
    pub description: Option<String>,
}

/// Body of a lifecycle action: the version the caller last saw.
#[derive(Deserialize)]
pub struct VersionedRequest {
    pub version: i64,
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub version: i64,
    #[serde(flatten)]
    pub edit: ChangeRequestEdit,
}

#[derive(Deserialize)]
pub struct MergeRequest {
    /// Head the caller reviewed; the merge is refused if the source moved.
    pub sha: String,
    #[serde(default)]
    pub merge_when_ci_succeeds: bool,
    #[serde(default)]
    pub should_remove_source_branch: bool,
    pub commit_message: Option<String>,
}

#[derive(Deserialize)]
pub struct CompareQuery {
    /// Earlier version id.
    pub from: Option<i64>,
    /// Head sha of an earlier version.
    pub start_sha: Option<String>,
}

#[derive(Serialize)]
struct VersionView {
    #[serde(flatten)]
    snapshot: DiffSnapshot,
    files: Vec<FileDiff>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/change_requests", get(lookup).post(open))
        .route("/api/change_requests/:id", get(show).put(update))
        .route("/api/change_requests/:id/close", post(close))
        .route("/api/change_requests/:id/reopen", post(reopen))
        .route("/api/change_requests/:id/remove_wip", post(remove_wip))
        .route("/api/change_requests/:id/refresh", post(refresh))
        .route(
            "/api/change_requests/:id/merge",
            post(request_merge).delete(cancel_merge),
        )
        .route("/api/change_requests/:id/ci_status", get(ci_status))
        .route("/api/change_requests/:id/versions", get(list_versions))
        .route("/api/change_requests/:id/versions/:version", get(show_version))
        .route(
            "/api/change_requests/:id/versions/:version/compare",
            get(compare_versions),
        )
}

async fn lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<ChangeRequest>, AppError> {
    let service = state.service.clone();
    let cr = blocking(move || service.find(&query.project, query.iid)).await?;
    Ok(Json(cr))
}

async fn open(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenRequest>,
) -> Result<Json<ChangeRequest>, AppError> {
    let actor = actor(&headers)?;
    if req.source_branch.trim().is_empty() || req.target_branch.trim().is_empty() {
        return Err(AppError::BadRequest("source and target branch are required".into()));
    }

    let project = state.config.repository.project.clone();
    let new = NewChangeRequest {
        source_project: req.source_project.unwrap_or_else(|| project.clone()),
        target_project: req.target_project.unwrap_or(project),
        source_branch: req.source_branch,
        target_branch: req.target_branch,
        title: req.title,
        description: req.description,
    };
    let service = state.service.clone();
    let cr = blocking(move || service.open(&actor, new)).await?;
    info!(change_request = %cr.reference(), "change request opened via API");
    Ok(Json(cr))
}

async fn show(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ChangeRequest>, AppError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.get(id)).await?))
}

async fn update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<ChangeRequest>, AppError> {
    let actor = actor(&headers)?;
    if req.edit.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(AppError::BadRequest("title must not be empty".into()));
    }
    let service = state.service.clone();
    Ok(Json(
        blocking(move || service.update(&actor, id, req.version, req.edit)).await?,
    ))
}

async fn close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<VersionedRequest>,
) -> Result<Json<ChangeRequest>, AppError> {
    let actor = actor(&headers)?;
    let service = state.service.clone();
    Ok(Json(blocking(move || service.close(&actor, id, req.version)).await?))
}

async fn reopen(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<VersionedRequest>,
) -> Result<Json<ChangeRequest>, AppError> {
    let actor = actor(&headers)?;
    let service = state.service.clone();
    Ok(Json(blocking(move || service.reopen(&actor, id, req.version)).await?))
}

async fn remove_wip(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<VersionedRequest>,
) -> Result<Json<ChangeRequest>, AppError> {
    let actor = actor(&headers)?;
    let service = state.service.clone();
    Ok(Json(blocking(move || service.remove_wip(&actor, id, req.version)).await?))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RefreshOutcome>, AppError> {
    let service = state.service.clone();
    let outcome = blocking(move || service.refresh(id)).await?;
    state.publish(outcome.merge_report.clone());
    Ok(Json(outcome))
}

async fn request_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<MergeReport>, AppError> {
    let actor = actor(&headers)?;
    let condition = if req.merge_when_ci_succeeds {
        MergeCondition::WhenCiSucceeds
    } else {
        MergeCondition::Immediate
    };
    let mut intent = MergeIntent::new(id, actor, condition, req.sha)
        .remove_source_branch(req.should_remove_source_branch);
    if let Some(message) = req.commit_message.filter(|m| !m.trim().is_empty()) {
        intent = intent.commit_message(message);
    }

    let service = state.service.clone();
    let report = blocking(move || Ok(service.orchestrator().request_merge(intent)?)).await?;
    state.publish([report.clone()]);
    Ok(Json(report))
}

async fn cancel_merge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<MergeReport>, AppError> {
    let actor = actor(&headers)?;
    let service = state.service.clone();
    let report = blocking(move || Ok(service.orchestrator().cancel_merge(&actor, id)?)).await?;
    state.publish([report.clone()]);
    Ok(Json(report))
}

async fn ci_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CiSummary>, AppError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.ci_status(id)).await?))
}

async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<DiffSnapshot>>, AppError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.versions(id)).await?))
}

async fn show_version(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(i64, i64)>,
) -> Result<Json<VersionView>, AppError> {
    let service = state.service.clone();
    let view = blocking(move || {
        Ok(VersionView {
            snapshot: service.version(id, version)?,
            files: service.version_files(id, version)?,
        })
    })
    .await?;
    Ok(Json(view))
}

async fn compare_versions(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(i64, i64)>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<DiffSet>, AppError> {
    let service = state.service.clone();
    let diff = match (query.from, query.start_sha) {
        (Some(from), None) => blocking(move || service.compare_versions(id, from, version)).await?,
        (None, Some(start_sha)) => {
            blocking(move || service.compare_since(id, version, &start_sha)).await?
        }
        _ => {
            return Err(AppError::BadRequest(
                "exactly one of 'from' or 'start_sha' is required".into(),
            ))
        }
    };
    Ok(Json(diff))
}
