//! Maintenance scheduler.
//!
//! On every tick it re-checks deferred merges against the stored CI signals
//! (covering webhooks that never arrived) and releases merge locks older
//! than the configured timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time;
use tracing::{error, info, warn};

use mergeflow_core::errors::CoreError;
use mergeflow_core::orchestrator::MergeReport;
use mergeflow_core::service::ChangeRequestService;

/// Tracks aggregate statistics across maintenance passes.
pub struct SchedulerStats {
    pub total_passes: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            total_passes: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
        }
    }
}

/// Result of one maintenance pass.
struct PassSummary {
    reports: Vec<MergeReport>,
    expired_locks: usize,
}

/// The maintenance scheduler.
///
/// If a pass is still running when the next tick fires, the tick is
/// skipped rather than queued.
pub struct Scheduler {
    service: Arc<ChangeRequestService>,
    interval: Duration,
    lock_timeout: chrono::Duration,
    reports: broadcast::Sender<MergeReport>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        service: Arc<ChangeRequestService>,
        interval: Duration,
        lock_timeout: chrono::Duration,
        reports: broadcast::Sender<MergeReport>,
    ) -> Self {
        Self {
            service,
            interval,
            lock_timeout,
            reports,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::new()),
        }
    }

    /// Main scheduler loop. Returns once `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            interval_secs = self.interval.as_secs(),
            lock_timeout_secs = self.lock_timeout.num_seconds(),
            "scheduler started"
        );

        let stop = shutdown.notified();
        tokio::pin!(stop);

        let mut interval = time::interval(self.interval);
        // The first tick fires immediately; consume it so the web server is
        // up before the first pass.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("scheduler stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.maybe_run_pass().await;
                }
            }
        }
    }

    /// Attempt a maintenance pass. If one is already running, skip.
    async fn maybe_run_pass(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("skipping maintenance pass: previous pass still running");
            return;
        }

        let pass = self.stats.total_passes.fetch_add(1, Ordering::SeqCst) + 1;
        let service = self.service.clone();
        let lock_timeout = self.lock_timeout;
        let result = tokio::task::spawn_blocking(move || run_pass(&service, lock_timeout)).await;

        match result {
            Ok(Ok(summary)) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                if !summary.reports.is_empty() || summary.expired_locks > 0 {
                    info!(
                        pass,
                        rechecked = summary.reports.len(),
                        expired_locks = summary.expired_locks,
                        "maintenance pass completed"
                    );
                }
                for report in summary.reports {
                    // No subscribers is fine.
                    let _ = self.reports.send(report);
                }
            }
            Ok(Err(e)) => self.record_error(pass, &e.to_string()),
            Err(e) => self.record_error(pass, &format!("maintenance task panicked: {}", e)),
        }

        self.running.store(false, Ordering::SeqCst);
    }

    fn record_error(&self, pass: u64, detail: &str) {
        let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        error!(
            pass,
            error = detail,
            total_errors = errors,
            consecutive_errors = consecutive,
            "maintenance pass failed"
        );
    }
}

fn run_pass(
    service: &ChangeRequestService,
    lock_timeout: chrono::Duration,
) -> Result<PassSummary, CoreError> {
    let reports = service.orchestrator().recheck_pending()?;
    let expired_locks = service.sweep_stale_locks(lock_timeout)?.len();
    Ok(PassSummary {
        reports,
        expired_locks,
    })
}
