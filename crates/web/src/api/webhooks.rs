//! Webhook receiver endpoints for source pushes and CI pipeline status.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use mergeflow_core::models::{CiSignal, CiStatus};

use crate::api::blocking;
use crate::api::status::AppError;
use crate::AppState;

/// Header carrying `sha256=<hex>` of the request body.
const SIGNATURE_HEADER: &str = "x-mergeflow-signature";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PushPayload {
    /// Defaults to the configured project.
    project: Option<String>,
    /// `refs/heads/<branch>` or a bare branch name.
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Debug, Deserialize)]
struct CiPayload {
    sha: String,
    status: CiStatus,
    coverage: Option<f64>,
    #[serde(default)]
    has_warnings: bool,
}

#[derive(Serialize)]
struct WebhookResponse {
    ok: bool,
    message: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/push", post(push_webhook))
        .route("/webhook/ci", post(ci_webhook))
}

async fn push_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let payload: PushPayload = verified_payload(&state, &headers, &body)?;
    let branch = payload
        .git_ref
        .strip_prefix("refs/heads/")
        .unwrap_or(&payload.git_ref)
        .to_string();
    let project = payload
        .project
        .unwrap_or_else(|| state.config.repository.project.clone());

    info!(project = %project, branch = %branch, "received push webhook");

    let service = state.service.clone();
    let (p, b) = (project.clone(), branch.clone());
    let outcomes = blocking(move || service.handle_push(&p, &b)).await?;
    let refreshed = outcomes.len();
    state.publish(outcomes.into_iter().filter_map(|o| o.merge_report));

    Ok(Json(WebhookResponse {
        ok: true,
        message: format!(
            "push to {}:{} received, {} change request(s) refreshed",
            project, branch, refreshed
        ),
    }))
}

async fn ci_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let payload: CiPayload = verified_payload(&state, &headers, &body)?;
    let signal = CiSignal {
        sha: payload.sha,
        status: payload.status,
        coverage: payload.coverage,
        has_warnings: payload.has_warnings,
    };

    info!(sha = %signal.sha, status = %signal.status, "received CI webhook");

    let service = state.service.clone();
    let recorded = signal.clone();
    let reports = blocking(move || service.record_ci(&recorded)).await?;
    let evaluated = reports.len();
    state.publish(reports);

    Ok(Json(WebhookResponse {
        ok: true,
        message: format!(
            "CI status {} for {} recorded, {} pending merge(s) re-evaluated",
            signal.status, signal.sha, evaluated
        ),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Check the body signature (when a secret is configured) and parse it.
fn verified_payload<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, AppError> {
    if state.config.web.webhook_secret_env.is_some() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing X-Mergeflow-Signature header".into()))?;

        verify_signature(body, signature, state.config.web.webhook_secret.as_deref())
            .map_err(|e| AppError::Unauthorized(format!("webhook verification failed: {}", e)))?;
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON payload: {}", e)))
}

fn verify_signature(payload: &[u8], signature: &str, secret: Option<&str>) -> Result<(), String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let secret = secret.ok_or("webhook secret not configured")?;

    let sig_hex = signature
        .strip_prefix("sha256=")
        .ok_or("signature must start with sha256=")?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("HMAC init failed: {}", e))?;
    mac.update(payload);

    let expected = hex::decode(sig_hex).map_err(|e| format!("invalid hex in signature: {}", e))?;

    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch".to_string())
}
