//! Worker pool that runs merge jobs off the request path.
//!
//! Workers share the receiving end of the [`MergeQueue`](super::MergeQueue)
//! channel. Each job runs on tokio's blocking pool because git and SQLite
//! calls block. Finished reports are published on a broadcast channel.
//!
//! Workers stop once the queue closes or `shutdown` is notified; a job
//! already running is finished first.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{MergeJob, MergeOrchestrator, MergeReport};

pub struct MergeWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl MergeWorkerPool {
    /// Spawn `workers` tasks (at least one) on the current runtime.
    pub fn spawn(
        orchestrator: Arc<MergeOrchestrator>,
        jobs: mpsc::UnboundedReceiver<MergeJob>,
        workers: usize,
        reports: broadcast::Sender<MergeReport>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let jobs = Arc::new(Mutex::new(jobs));
        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    orchestrator.clone(),
                    jobs.clone(),
                    reports.clone(),
                    shutdown.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "merge worker pool started");
        Self { handles }
    }

    /// Wait until every worker has exited.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "merge worker panicked");
            }
        }
        info!("merge worker pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    orchestrator: Arc<MergeOrchestrator>,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<MergeJob>>>,
    reports: broadcast::Sender<MergeReport>,
    shutdown: Arc<Notify>,
) {
    let stop = shutdown.notified();
    tokio::pin!(stop);

    loop {
        let job = tokio::select! {
            _ = &mut stop => {
                debug!(worker, "merge worker shutting down");
                return;
            }
            job = async { jobs.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            debug!(worker, "merge queue closed");
            return;
        };

        debug!(worker, job = %job.id, "picked up merge job");
        let orch = orchestrator.clone();
        let change_request_id = job.intent.change_request_id;
        match tokio::task::spawn_blocking(move || orch.execute(&job)).await {
            Ok(Ok(report)) => {
                info!(
                    worker,
                    change_request_id,
                    outcome = ?report.outcome,
                    "merge job finished"
                );
                // No subscribers is fine.
                let _ = reports.send(report);
            }
            Ok(Err(e)) => {
                error!(worker, change_request_id, error = %e, "merge job failed");
            }
            Err(e) => {
                error!(worker, change_request_id, error = %e, "merge job panicked");
            }
        }
    }
}
