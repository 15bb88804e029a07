//! REST API endpoint modules.

pub mod audit;
pub mod change_requests;
pub mod conflicts;
pub mod status;
pub mod webhooks;

use axum::http::HeaderMap;
use mergeflow_core::errors::CoreError;

use crate::api::status::AppError;

/// Header naming the user on whose behalf a request is made. The proxy in
/// front of the API is responsible for authenticating it.
pub const ACTOR_HEADER: &str = "x-mergeflow-actor";

/// The acting user of a request.
pub(crate) fn actor(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthorized("missing X-Mergeflow-Actor header".into()))
}

/// Run blocking core work (git and SQLite) off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("request task failed: {}", e)))?
        .map_err(AppError::from)
}
