//! mergeflow web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Health and queue status endpoints
//! - Change request, merge and version API
//! - Conflict detection and resolution API
//! - Audit log API
//! - Push and CI webhook receivers
//! - WebSocket endpoint streaming merge reports

pub mod api;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use mergeflow_core::config::AppConfig;
use mergeflow_core::db::Database;
use mergeflow_core::orchestrator::MergeReport;
use mergeflow_core::service::ChangeRequestService;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: Arc<Database>,
    pub service: Arc<ChangeRequestService>,
    pub config: AppConfig,
    /// Merge reports, fanned out to WebSocket clients.
    pub reports: broadcast::Sender<MergeReport>,
}

impl AppState {
    /// Publish reports produced while handling a request.
    pub fn publish<I>(&self, reports: I)
    where
        I: IntoIterator<Item = MergeReport>,
    {
        for report in reports {
            // No subscribers is fine.
            let _ = self.reports.send(report);
        }
    }
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        service: Arc<ChangeRequestService>,
        reports: broadcast::Sender<MergeReport>,
    ) -> Self {
        let state = Arc::new(AppState {
            db,
            service,
            config,
            reports,
        });
        Self { state }
    }

    /// The full router, without a listener attached.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static(api::ACTOR_HEADER),
            ]);

        Router::new()
            .merge(api::status::routes())
            .merge(api::change_requests::routes())
            .merge(api::conflicts::routes())
            .merge(api::audit::routes())
            .merge(api::webhooks::routes())
            .merge(ws::routes())
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB max request body
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Start the web server, listening on the given address.
    pub async fn start(self, listen_addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
