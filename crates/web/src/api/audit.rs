//! Audit log API endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::blocking;
use crate::api::status::AppError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AuditQuery {
    pub limit: Option<u32>,
    pub change_request_id: Option<i64>,
}

#[derive(Serialize)]
struct AuditEntryView {
    id: i64,
    created_at: String,
    action: String,
    change_request_id: Option<i64>,
    actor: Option<String>,
    details: Option<String>,
    success: bool,
}

#[derive(Serialize)]
struct AuditListResponse {
    entries: Vec<AuditEntryView>,
    total: usize,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/audit", get(list_audit))
}

async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditListResponse>, AppError> {
    let limit = query.limit.unwrap_or(50).min(500);

    let db = state.db.clone();
    let entries = blocking(move || {
        Ok(match query.change_request_id {
            Some(id) => db.list_audit_log_for_change_request(id, limit)?,
            None => db.list_audit_log(limit)?,
        })
    })
    .await?;

    let total = entries.len();
    let views: Vec<AuditEntryView> = entries
        .into_iter()
        .map(|e| AuditEntryView {
            id: e.id,
            created_at: e.created_at,
            action: e.action,
            change_request_id: e.change_request_id,
            actor: e.actor,
            details: e.details,
            success: e.success,
        })
        .collect();

    Ok(Json(AuditListResponse {
        entries: views,
        total,
    }))
}
