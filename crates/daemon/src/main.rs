//! mergeflow daemon entry point.
//!
//! Loads configuration, wires the merge orchestrator, its worker pool and
//! the notification dispatcher, starts the web server and the maintenance
//! scheduler, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mergeflow_core::authz::ConfiguredAuthorizer;
use mergeflow_core::ci::StoredCiSignals;
use mergeflow_core::config::AppConfig;
use mergeflow_core::db::Database;
use mergeflow_core::notify::{self, NotificationQueue, Notifier};
use mergeflow_core::orchestrator::{MergeOrchestrator, MergeQueue, MergeWorkerPool};
use mergeflow_core::service::ChangeRequestService;
use mergeflow_core::vcs::GitRepository;
use mergeflow_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// mergeflow merge orchestration daemon.
#[derive(Parser, Debug)]
#[command(
    name = "mergeflow-daemon",
    version,
    about = "Merge request orchestration daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  mergeflow daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file     : {}", args.config.display());
    info!("Project         : {}", config.repository.project);
    info!("Repository      : {}", config.repository.path.display());
    info!("Merge method    : {}", config.merge.method);
    info!("Merge workers   : {}", config.daemon.merge_workers);
    info!("Recheck interval: {}s", config.daemon.recheck_interval_secs);
    info!("Web listen      : {}", config.web.listen);
    info!("Data dir        : {}", config.daemon.data_dir.display());
    info!("Log level       : {}", log_level);
    info!("========================================");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    // Initialize database
    let db_path = config.daemon.data_dir.join("mergeflow.db");
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    let db = Arc::new(db);
    info!("Database initialized at {}", db_path.display());

    // Open the repository merges are applied to
    let git = Arc::new(
        GitRepository::open(
            &config.repository.path,
            &config.repository.committer_name,
            &config.repository.committer_email,
        )
        .context("failed to open Git repository")?,
    );
    info!("Git repository opened at {}", config.repository.path.display());

    // Notifications: the core enqueues, the dispatcher delivers
    let (notifications, notification_rx) = NotificationQueue::new();
    let notifier = Notifier::new(&config.notifications);
    let dispatcher_handle = tokio::spawn(notify::run_dispatcher(notification_rx, notifier));

    let ci = Arc::new(StoredCiSignals::new(db.clone()));
    let authz = Arc::new(ConfiguredAuthorizer::from_config(&config.access));
    let notifications = Arc::new(notifications);

    // Merge orchestration
    let (queue, jobs) = MergeQueue::new();
    let orchestrator = Arc::new(MergeOrchestrator::new(
        db.clone(),
        git.clone(),
        ci.clone(),
        authz.clone(),
        notifications.clone(),
        queue,
        config.merge.clone(),
    ));
    let service = Arc::new(ChangeRequestService::new(
        db.clone(),
        git,
        ci,
        authz,
        notifications,
        orchestrator.clone(),
    ));
    info!("Merge orchestrator initialized");

    let (reports, _) = broadcast::channel(256);
    let shutdown = Arc::new(Notify::new());

    // Start the merge workers
    let pool = MergeWorkerPool::spawn(
        orchestrator,
        jobs,
        config.daemon.merge_workers,
        reports.clone(),
        shutdown.clone(),
    );

    // Start web server in background
    let web_server = WebServer::new(config.clone(), db, service.clone(), reports.clone());
    let listen_addr = config.web.listen.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start(&listen_addr).await {
            error!("Web server error: {}", e);
        }
    });

    // Create and start the scheduler
    let sched = scheduler::Scheduler::new(
        service,
        Duration::from_secs(config.daemon.recheck_interval_secs),
        chrono::Duration::seconds(i64::try_from(config.merge.lock_timeout_secs).unwrap_or(i64::MAX)),
        reports,
    );
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");

    // Stop accepting new work first
    web_handle.abort();
    shutdown.notify_waiters();

    // Wait for the scheduler to finish its current pass (up to 10s)
    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    // Let running merges finish (up to 30s)
    if tokio::time::timeout(Duration::from_secs(30), pool.join())
        .await
        .is_err()
    {
        warn!("merge workers did not stop within 30s, forcing shutdown");
    }

    dispatcher_handle.abort();

    info!("mergeflow daemon stopped.");
    Ok(())
}
