//! Merge orchestration.
//!
//! A merge request walks `Idle -> Evaluating`, then either parks in
//! `DeferredPendingCi` (merge when CI succeeds) or is handed to the worker
//! pool as a [`MergeJob`] (`Merging`). A worker runs [`MergeOrchestrator::execute`],
//! which re-evaluates from scratch, takes the exclusive merge token (the
//! `open -> locked` lifecycle compare-and-swap) and integrates. Every entry
//! point returns a [`MergeReport`] naming the states it walked through and
//! how it ended.
//!
//! Nothing here holds a lock across the wait for CI: a deferred intent is a
//! row in `pending_merges`, consumed by whichever trigger gets to it first.

pub mod worker;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::authz::{Action, Authorizer};
use crate::ci::CiSignalSource;
use crate::config::{MergeConfig, MergeMethod};
use crate::conflict::ConflictResolver;
use crate::db::Database;
use crate::errors::{AccessError, LifecycleError, OrchestratorError};
use crate::lifecycle::{ChangeRequestUpdate, LifecycleController, LifecycleEvent};
use crate::mergeability::{BlockReason, CiPolicy, Decision, MergeabilityEvaluator};
use crate::models::{AuditEntry, ChangeRequest, LifecycleState, MergeCondition, MergeIntent};
use crate::notify::{MergeEvent, NotificationSink};
use crate::vcs::{FastForward, MergeCommit, VersionControl};

pub use worker::MergeWorkerPool;

/// Attempts at a lifecycle write that keeps losing to concurrent edits.
const MAX_CAS_ATTEMPTS: usize = 5;

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Idle,
    Evaluating,
    DeferredPendingCi,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Blocked(BlockReason),
    /// CI is still running and the intent was to merge immediately.
    CiPending,
    /// The integration itself failed; recorded as the merge error.
    ExecutionFailed(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked(reason) => write!(f, "{}", reason),
            Self::CiPending => write!(f, "CI is still running"),
            Self::ExecutionFailed(detail) => write!(f, "{}", detail),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// The source branch moved away from the sha the intent was tracking.
    HeadMoved {
        tracked_sha: String,
        current_sha: Option<String>,
    },
    ByUser { actor: String },
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeadMoved { tracked_sha, .. } => {
                write!(f, "source branch moved away from {}", tracked_sha)
            }
            Self::ByUser { actor } => write!(f, "cancelled by {}", actor),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Handed to the worker pool.
    Scheduled,
    /// Waiting for CI.
    Deferred,
    Completed { merge_commit_sha: String },
    Failed { reason: FailureReason },
    Cancelled { reason: CancelReason },
    /// Another trigger is already handling (or has handled) this merge.
    Skipped,
}

/// What one orchestrator call did for one change request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergeReport {
    pub change_request_id: i64,
    pub trail: Vec<MergeState>,
    pub outcome: MergeOutcome,
}

impl MergeReport {
    fn new(change_request_id: i64, start: MergeState) -> Self {
        Self {
            change_request_id,
            trail: vec![start],
            outcome: MergeOutcome::Skipped,
        }
    }

    fn enter(&mut self, state: MergeState) {
        self.trail.push(state);
    }

    fn finish(mut self, state: MergeState, outcome: MergeOutcome) -> Self {
        if self.trail.last() != Some(&state) {
            self.trail.push(state);
        }
        self.outcome = outcome;
        self
    }

    /// The state the change request was left in.
    pub fn state(&self) -> MergeState {
        self.trail.last().copied().unwrap_or(MergeState::Idle)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A unit of merge work for the worker pool.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub id: Uuid,
    pub intent: MergeIntent,
}

/// Sending half of the worker pool's job channel.
#[derive(Clone)]
pub struct MergeQueue {
    tx: mpsc::UnboundedSender<MergeJob>,
}

impl MergeQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MergeJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn dispatch(&self, intent: MergeIntent) -> Result<Uuid, OrchestratorError> {
        let id = Uuid::new_v4();
        let change_request_id = intent.change_request_id;
        self.tx
            .send(MergeJob { id, intent })
            .map_err(|_| OrchestratorError::QueueClosed(change_request_id))?;
        debug!(%id, change_request_id, "dispatched merge job");
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct MergeOrchestrator {
    db: Arc<Database>,
    vcs: Arc<dyn VersionControl>,
    lifecycle: LifecycleController,
    conflicts: ConflictResolver,
    ci: Arc<dyn CiSignalSource>,
    authz: Arc<dyn Authorizer>,
    notifier: Arc<dyn NotificationSink>,
    queue: MergeQueue,
    config: MergeConfig,
}

impl MergeOrchestrator {
    pub fn new(
        db: Arc<Database>,
        vcs: Arc<dyn VersionControl>,
        ci: Arc<dyn CiSignalSource>,
        authz: Arc<dyn Authorizer>,
        notifier: Arc<dyn NotificationSink>,
        queue: MergeQueue,
        config: MergeConfig,
    ) -> Self {
        Self {
            lifecycle: LifecycleController::new(db.clone()),
            conflicts: ConflictResolver::new(vcs.clone()),
            db,
            vcs,
            ci,
            authz,
            notifier,
            queue,
            config,
        }
    }

    /// Start a merge traversal for `intent`.
    ///
    /// Blocked requests come back as a `Failed` report, not an error; the
    /// intent is then discarded and the caller has to ask again.
    #[instrument(skip(self, intent), fields(cr = intent.change_request_id, actor = %intent.actor))]
    pub fn request_merge(&self, intent: MergeIntent) -> Result<MergeReport, OrchestratorError> {
        let cr = self.db.get_change_request(intent.change_request_id)?;
        self.authorize(&intent.actor, Action::Merge, &cr)?;

        let mut report = MergeReport::new(cr.id, MergeState::Idle);
        report.enter(MergeState::Evaluating);
        let decision = self.evaluate(&cr, &intent)?;

        match decision {
            Decision::Mergeable => {
                self.db.delete_pending_merge(cr.id)?;
                let cr = self.clear_merge_error(cr)?;
                self.queue.dispatch(intent.clone())?;
                self.audit(
                    AuditEntry::success("merge_scheduled", &format!("at {}", intent.expected_head_sha))
                        .for_change_request(cr.id)
                        .by(&intent.actor),
                );
                self.notifier.notify(
                    MergeEvent::MergeScheduled {
                        actor: intent.actor.clone(),
                    },
                    &cr,
                );
                Ok(report.finish(MergeState::Merging, MergeOutcome::Scheduled))
            }
            Decision::WaitingOnCi if intent.condition == MergeCondition::WhenCiSucceeds => {
                self.db.upsert_pending_merge(&intent)?;
                let cr = self.clear_merge_error(cr)?;
                info!(sha = %intent.expected_head_sha, "merge deferred until CI succeeds");
                self.audit(
                    AuditEntry::success(
                        "merge_deferred",
                        &format!("waiting for CI on {}", intent.expected_head_sha),
                    )
                    .for_change_request(cr.id)
                    .by(&intent.actor),
                );
                self.notifier.notify(
                    MergeEvent::MergeDeferred {
                        actor: intent.actor.clone(),
                        sha: intent.expected_head_sha.clone(),
                    },
                    &cr,
                );
                Ok(report.finish(MergeState::DeferredPendingCi, MergeOutcome::Deferred))
            }
            Decision::WaitingOnCi => Ok(self.reject(report, &cr, &intent, FailureReason::CiPending)),
            Decision::BlockedBy(reason) => {
                Ok(self.reject(report, &cr, &intent, FailureReason::Blocked(reason)))
            }
        }
    }

    /// React to a CI status change for `sha`.
    pub fn on_ci_status(&self, sha: &str) -> Result<Vec<MergeReport>, OrchestratorError> {
        let intents = self.db.list_pending_merges_for_sha(sha)?;
        debug!(sha, pending = intents.len(), "CI status changed");
        intents
            .into_iter()
            .map(|intent| self.reevaluate_pending(intent))
            .collect()
    }

    /// Cancel a deferred merge whose tracked head is no longer `new_head`.
    pub fn on_source_push(
        &self,
        change_request_id: i64,
        new_head: &str,
    ) -> Result<Option<MergeReport>, OrchestratorError> {
        let Some(intent) = self.db.get_pending_merge(change_request_id)? else {
            return Ok(None);
        };
        if intent.expected_head_sha == new_head {
            return Ok(None);
        }
        let cr = self.db.get_change_request(change_request_id)?;
        let report = MergeReport::new(change_request_id, MergeState::DeferredPendingCi);
        let reason = CancelReason::HeadMoved {
            tracked_sha: intent.expected_head_sha.clone(),
            current_sha: Some(new_head.to_string()),
        };
        Ok(Some(self.cancel_pending(report, &cr, &intent, reason)?))
    }

    /// Explicitly drop the deferred merge of a change request.
    pub fn cancel_merge(
        &self,
        actor: &str,
        change_request_id: i64,
    ) -> Result<MergeReport, OrchestratorError> {
        let cr = self.db.get_change_request(change_request_id)?;
        self.authorize(actor, Action::CancelMerge, &cr)?;

        match self.db.get_pending_merge(change_request_id)? {
            Some(intent) => {
                let report = MergeReport::new(change_request_id, MergeState::DeferredPendingCi);
                let reason = CancelReason::ByUser {
                    actor: actor.to_string(),
                };
                self.cancel_pending(report, &cr, &intent, reason)
            }
            None => {
                debug!(change_request_id, "no pending merge to cancel");
                Ok(MergeReport::new(change_request_id, MergeState::Idle))
            }
        }
    }

    /// Re-evaluate every deferred intent against the stored CI signals.
    ///
    /// Picks up CI results whose webhook never arrived. A failure on one
    /// intent is logged and does not stop the others.
    pub fn recheck_pending(&self) -> Result<Vec<MergeReport>, OrchestratorError> {
        let mut reports = Vec::new();
        for intent in self.db.list_pending_merges()? {
            let id = intent.change_request_id;
            match self.reevaluate_pending(intent) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(change_request_id = id, error = %e, "recheck of pending merge failed"),
            }
        }
        Ok(reports)
    }

    /// Run a merge job. Called on a worker thread.
    #[instrument(skip(self, job), fields(job = %job.id, cr = job.intent.change_request_id))]
    pub fn execute(&self, job: &MergeJob) -> Result<MergeReport, OrchestratorError> {
        let intent = &job.intent;
        let cr = self.db.get_change_request(intent.change_request_id)?;
        let mut report = MergeReport::new(cr.id, MergeState::Merging);

        if matches!(cr.state, LifecycleState::Locked | LifecycleState::Merged) {
            debug!(state = %cr.state, "merge already running or done");
            return Ok(report);
        }

        report.enter(MergeState::Evaluating);
        if !self
            .authz
            .can_perform(&intent.actor, Action::Merge, &cr)
        {
            let detail = format!("{} is no longer allowed to merge", intent.actor);
            return self.fail_execution(report, cr, intent, detail);
        }

        match self.evaluate(&cr, intent)? {
            Decision::Mergeable => {}
            Decision::WaitingOnCi if intent.condition == MergeCondition::WhenCiSucceeds => {
                self.db.upsert_pending_merge(intent)?;
                info!("CI restarted before merge, deferring again");
                return Ok(report.finish(MergeState::DeferredPendingCi, MergeOutcome::Deferred));
            }
            Decision::WaitingOnCi => {
                return Ok(self.reject(report, &cr, intent, FailureReason::CiPending));
            }
            Decision::BlockedBy(BlockReason::ShaMismatch) => {
                let reason = CancelReason::HeadMoved {
                    tracked_sha: intent.expected_head_sha.clone(),
                    current_sha: cr.head_sha.clone(),
                };
                return Ok(self.cancel_dispatched(report, &cr, intent, reason));
            }
            Decision::BlockedBy(reason) => {
                self.notifier.notify(
                    MergeEvent::MergeFailed {
                        reason: reason.to_string(),
                    },
                    &cr,
                );
                return Ok(self.reject(report, &cr, intent, FailureReason::Blocked(reason)));
            }
        }

        report.enter(MergeState::Merging);
        let locked = match self.lifecycle.transition(&cr, LifecycleEvent::LockForMerge) {
            Ok(locked) => locked,
            Err(LifecycleError::StaleVersion { .. } | LifecycleError::InvalidTransition { .. }) => {
                debug!("lost the merge token to a concurrent trigger");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        match self.integrate(&locked, intent) {
            Ok(merge_commit_sha) => self.complete(report, locked, intent, merge_commit_sha),
            Err(detail) => {
                warn!(error = %detail, "merge failed");
                let cr = self.transition_with_retry(
                    locked,
                    LifecycleEvent::Unlock {
                        merge_error: Some(detail.clone()),
                    },
                )?;
                self.audit(
                    AuditEntry::failure("merge_failed", &detail)
                        .for_change_request(cr.id)
                        .by(&intent.actor),
                );
                self.notifier.notify(
                    MergeEvent::MergeFailed {
                        reason: detail.clone(),
                    },
                    &cr,
                );
                Ok(report.finish(
                    MergeState::Failed,
                    MergeOutcome::Failed {
                        reason: FailureReason::ExecutionFailed(detail),
                    },
                ))
            }
        }
    }

    // -- internals ----------------------------------------------------------

    fn authorize(
        &self,
        actor: &str,
        action: Action,
        cr: &ChangeRequest,
    ) -> Result<(), AccessError> {
        if self.authz.can_perform(actor, action, cr) {
            return Ok(());
        }
        warn!(actor, %action, change_request = %cr.reference(), "action denied");
        Err(AccessError::Forbidden {
            actor: actor.to_string(),
            action: action.to_string(),
            change_request_id: cr.id,
        })
    }

    fn policy(&self, condition: MergeCondition) -> CiPolicy {
        let when_ci = condition == MergeCondition::WhenCiSucceeds;
        CiPolicy {
            required: self.config.ci_required || when_ci,
            require_signal: when_ci,
        }
    }

    fn evaluate(&self, cr: &ChangeRequest, intent: &MergeIntent) -> Result<Decision, OrchestratorError> {
        let ci = self.ci.latest_status(&intent.expected_head_sha)?;
        Ok(MergeabilityEvaluator::evaluate(
            cr,
            ci.as_ref(),
            &intent.expected_head_sha,
            self.policy(intent.condition),
            &self.conflicts,
        )?)
    }

    fn reevaluate_pending(&self, intent: MergeIntent) -> Result<MergeReport, OrchestratorError> {
        let cr = self.db.get_change_request(intent.change_request_id)?;
        let mut report = MergeReport::new(cr.id, MergeState::DeferredPendingCi);

        if cr.head_sha.as_deref() != Some(intent.expected_head_sha.as_str()) {
            let reason = CancelReason::HeadMoved {
                tracked_sha: intent.expected_head_sha.clone(),
                current_sha: cr.head_sha.clone(),
            };
            return self.cancel_pending(report, &cr, &intent, reason);
        }

        report.enter(MergeState::Evaluating);
        match self.evaluate(&cr, &intent)? {
            Decision::WaitingOnCi => {
                Ok(report.finish(MergeState::DeferredPendingCi, MergeOutcome::Deferred))
            }
            Decision::Mergeable => {
                if !self.db.take_pending_merge(cr.id, &intent.expected_head_sha)? {
                    return Ok(report);
                }
                self.queue.dispatch(intent.clone())?;
                info!(change_request = %cr.reference(), "CI passed, merge scheduled");
                self.audit(
                    AuditEntry::success("merge_scheduled", "CI succeeded")
                        .for_change_request(cr.id)
                        .by(&intent.actor),
                );
                Ok(report.finish(MergeState::Merging, MergeOutcome::Scheduled))
            }
            Decision::BlockedBy(reason) => {
                if !self.db.take_pending_merge(cr.id, &intent.expected_head_sha)? {
                    return Ok(report);
                }
                self.notifier.notify(
                    MergeEvent::MergeFailed {
                        reason: reason.to_string(),
                    },
                    &cr,
                );
                Ok(self.reject(report, &cr, &intent, FailureReason::Blocked(reason)))
            }
        }
    }

    fn cancel_pending(
        &self,
        report: MergeReport,
        cr: &ChangeRequest,
        intent: &MergeIntent,
        reason: CancelReason,
    ) -> Result<MergeReport, OrchestratorError> {
        if !self.db.take_pending_merge(cr.id, &intent.expected_head_sha)? {
            return Ok(report);
        }
        info!(change_request = %cr.reference(), %reason, "deferred merge cancelled");
        let mut entry = AuditEntry::success("merge_cancelled", &reason.to_string())
            .for_change_request(cr.id);
        if let CancelReason::ByUser { actor } = &reason {
            entry = entry.by(actor);
        }
        self.audit(entry);
        self.notifier.notify(
            MergeEvent::MergeCancelled {
                reason: reason.to_string(),
            },
            cr,
        );
        Ok(report.finish(MergeState::Cancelled, MergeOutcome::Cancelled { reason }))
    }

    /// Cancel a job that was already handed to the pool.
    fn cancel_dispatched(
        &self,
        report: MergeReport,
        cr: &ChangeRequest,
        intent: &MergeIntent,
        reason: CancelReason,
    ) -> MergeReport {
        info!(change_request = %cr.reference(), %reason, "scheduled merge cancelled");
        self.audit(
            AuditEntry::success("merge_cancelled", &reason.to_string())
                .for_change_request(cr.id)
                .by(&intent.actor),
        );
        self.notifier.notify(
            MergeEvent::MergeCancelled {
                reason: reason.to_string(),
            },
            cr,
        );
        report.finish(MergeState::Cancelled, MergeOutcome::Cancelled { reason })
    }

    fn reject(
        &self,
        report: MergeReport,
        cr: &ChangeRequest,
        intent: &MergeIntent,
        reason: FailureReason,
    ) -> MergeReport {
        info!(change_request = %cr.reference(), %reason, "merge blocked");
        self.audit(
            AuditEntry::failure("merge_blocked", &reason.to_string())
                .for_change_request(cr.id)
                .by(&intent.actor),
        );
        report.finish(MergeState::Failed, MergeOutcome::Failed { reason })
    }

    fn fail_execution(
        &self,
        report: MergeReport,
        cr: ChangeRequest,
        intent: &MergeIntent,
        detail: String,
    ) -> Result<MergeReport, OrchestratorError> {
        let cr = self.record_merge_error(cr, &detail)?;
        self.audit(
            AuditEntry::failure("merge_failed", &detail)
                .for_change_request(cr.id)
                .by(&intent.actor),
        );
        self.notifier.notify(
            MergeEvent::MergeFailed {
                reason: detail.clone(),
            },
            &cr,
        );
        Ok(report.finish(
            MergeState::Failed,
            MergeOutcome::Failed {
                reason: FailureReason::ExecutionFailed(detail),
            },
        ))
    }

    /// Move the target branch. Returns the new target head, or why it could
    /// not be moved.
    fn integrate(&self, cr: &ChangeRequest, intent: &MergeIntent) -> Result<String, String> {
        let source_sha = &intent.expected_head_sha;
        let target_sha = self
            .vcs
            .resolve_ref(&cr.target_branch)
            .map_err(|e| format!("cannot resolve target branch: {}", e))?;

        let new_head = match self.config.method {
            MergeMethod::MergeCommit => {
                let message = intent
                    .commit_message
                    .clone()
                    .unwrap_or_else(|| default_merge_message(cr));
                match self
                    .vcs
                    .create_merge_commit(source_sha, &target_sha, &message)
                    .map_err(|e| format!("merge commit failed: {}", e))?
                {
                    MergeCommit::Created(sha) => sha,
                    MergeCommit::Conflict(paths) => {
                        return Err(format!("merge conflicts in {}", paths.join(", ")));
                    }
                }
            }
            MergeMethod::FastForward => source_sha.clone(),
        };

        match self
            .vcs
            .fast_forward(&cr.target_branch, &target_sha, &new_head)
            .map_err(|e| format!("updating target branch failed: {}", e))?
        {
            FastForward::Advanced => Ok(new_head),
            FastForward::NotFastForward => Err(match self.config.method {
                MergeMethod::MergeCommit => "target branch moved during the merge".to_string(),
                MergeMethod::FastForward => {
                    "source branch cannot be fast-forwarded onto the target branch".to_string()
                }
            }),
        }
    }

    fn complete(
        &self,
        report: MergeReport,
        locked: ChangeRequest,
        intent: &MergeIntent,
        merge_commit_sha: String,
    ) -> Result<MergeReport, OrchestratorError> {
        let merged = self.transition_with_retry(
            locked,
            LifecycleEvent::MarkMerged {
                merge_commit_sha: merge_commit_sha.clone(),
            },
        )?;
        info!(change_request = %merged.reference(), sha = %merge_commit_sha, "merged");

        if intent.remove_source_branch {
            if let Err(e) = self.vcs.delete_branch(&merged.source_branch) {
                warn!(branch = %merged.source_branch, error = %e, "failed to remove source branch");
            }
        }
        self.db.delete_pending_merge(merged.id)?;

        self.audit(
            AuditEntry::success("merge_completed", &merge_commit_sha)
                .for_change_request(merged.id)
                .by(&intent.actor),
        );
        self.notifier.notify(
            MergeEvent::MergeCompleted {
                merge_commit_sha: merge_commit_sha.clone(),
            },
            &merged,
        );
        Ok(report.finish(
            MergeState::Completed,
            MergeOutcome::Completed { merge_commit_sha },
        ))
    }

    /// Apply `event`, reloading and retrying when a concurrent metadata edit
    /// bumped the version in between.
    fn transition_with_retry(
        &self,
        mut cr: ChangeRequest,
        event: LifecycleEvent,
    ) -> Result<ChangeRequest, OrchestratorError> {
        let mut attempt = 1;
        loop {
            match self.lifecycle.transition(&cr, event.clone()) {
                Err(LifecycleError::StaleVersion { .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(attempt, "retrying lifecycle transition");
                    attempt += 1;
                    cr = self.db.get_change_request(cr.id)?;
                }
                result => return Ok(result?),
            }
        }
    }

    fn clear_merge_error(&self, cr: ChangeRequest) -> Result<ChangeRequest, OrchestratorError> {
        if cr.merge_error.is_none() {
            return Ok(cr);
        }
        Ok(self.lifecycle.update(
            &cr,
            ChangeRequestUpdate {
                merge_error: Some(None),
                ..Default::default()
            },
        )?)
    }

    fn record_merge_error(
        &self,
        cr: ChangeRequest,
        detail: &str,
    ) -> Result<ChangeRequest, OrchestratorError> {
        Ok(self.lifecycle.update(
            &cr,
            ChangeRequestUpdate {
                merge_error: Some(Some(detail.to_string())),
                ..Default::default()
            },
        )?)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }
}

/// `Merge branch 'feature' into 'main'`, the title, and the reference.
pub fn default_merge_message(cr: &ChangeRequest) -> String {
    format!(
        "Merge branch '{}' into '{}'\n\n{}\n\nSee merge request {}",
        cr.source_branch,
        cr.target_branch,
        cr.wipless_title(),
        cr.reference()
    )
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::authz::ConfiguredAuthorizer;
    use crate::ci::StoredCiSignals;
    use crate::config::AccessConfig;
    use crate::models::{CiSignal, CiStatus};
    use crate::test_support::{open_change_request, set_head, test_db, RecordingSink, TestRepo};

    struct Harness {
        repo: TestRepo,
        db: Arc<Database>,
        ci: Arc<StoredCiSignals>,
        sink: Arc<RecordingSink>,
        orch: MergeOrchestrator,
        jobs: UnboundedReceiver<MergeJob>,
        cr: ChangeRequest,
    }

    impl Harness {
        fn new(config: MergeConfig, access: AccessConfig) -> Self {
            let repo = TestRepo::new();
            repo.commit("main", &[("a.txt", "a\n")]);
            repo.branch("feature", "main");
            let head = repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n")]);

            let db = test_db();
            let cr = open_change_request(&db, "feature", "main");
            let cr = set_head(&db, &cr, &head.to_string());

            let ci = Arc::new(StoredCiSignals::new(db.clone()));
            let sink = Arc::new(RecordingSink::default());
            let (queue, jobs) = MergeQueue::new();
            let orch = MergeOrchestrator::new(
                db.clone(),
                repo.git(),
                ci.clone(),
                Arc::new(ConfiguredAuthorizer::from_config(&access)),
                sink.clone(),
                queue,
                config,
            );
            Self {
                repo,
                db,
                ci,
                sink,
                orch,
                jobs,
                cr,
            }
        }

        fn simple() -> Self {
            Self::new(MergeConfig::default(), AccessConfig::default())
        }

        fn head(&self) -> String {
            self.cr.head_sha.clone().unwrap()
        }

        fn intent(&self, condition: MergeCondition) -> MergeIntent {
            MergeIntent::new(self.cr.id, "alice", condition, self.head())
        }

        fn ci(&self, sha: &str, status: CiStatus) {
            self.ci
                .record(&CiSignal {
                    sha: sha.into(),
                    status,
                    coverage: None,
                    has_warnings: false,
                })
                .unwrap();
        }

        fn next_job(&mut self) -> MergeJob {
            self.jobs.try_recv().expect("a queued merge job")
        }

        fn reload(&self) -> ChangeRequest {
            self.db.get_change_request(self.cr.id).unwrap()
        }
    }

    #[test]
    fn test_clean_merge_completes() {
        let mut h = Harness::simple();
        let main_before = h.repo.tip("main").unwrap();

        let report = h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        assert_eq!(report.outcome, MergeOutcome::Scheduled);
        assert_eq!(
            report.trail,
            vec![MergeState::Idle, MergeState::Evaluating, MergeState::Merging]
        );

        let job = h.next_job();
        let report = h.orch.execute(&job).unwrap();
        let sha = match &report.outcome {
            MergeOutcome::Completed { merge_commit_sha } => merge_commit_sha.clone(),
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(report.state(), MergeState::Completed);

        let merged = h.reload();
        assert_eq!(merged.state, LifecycleState::Merged);
        assert_eq!(merged.merge_commit_sha.as_deref(), Some(sha.as_str()));
        assert_eq!(h.repo.tip("main").unwrap().to_string(), sha);
        assert!(h.repo.tip("feature").is_some());

        let commit = h
            .repo
            .repo
            .find_commit(git2::Oid::from_str(&sha).unwrap())
            .unwrap();
        assert_eq!(commit.parent_id(0).unwrap(), main_before);
        assert_eq!(commit.parent_id(1).unwrap().to_string(), h.head());
        assert!(commit
            .message()
            .unwrap()
            .starts_with("Merge branch 'feature' into 'main'"));

        assert_eq!(h.sink.names(), vec!["merge_scheduled", "merge_completed"]);
        let audit = h.db.list_audit_log_for_change_request(h.cr.id, 10).unwrap();
        assert!(audit.iter().any(|e| e.action == "merge_completed" && e.success));
    }

    #[test]
    fn test_sha_mismatch_changes_nothing() {
        let mut h = Harness::simple();
        let intent = MergeIntent::new(h.cr.id, "alice", MergeCondition::Immediate, "0".repeat(40));

        let report = h.orch.request_merge(intent).unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Failed {
                reason: FailureReason::Blocked(BlockReason::ShaMismatch)
            }
        );
        assert!(h.jobs.try_recv().is_err());
        let after = h.reload();
        assert_eq!(after.version, h.cr.version);
        assert_eq!(after.state, LifecycleState::Open);
    }

    #[test]
    fn test_unauthorized_actor_is_rejected() {
        let h = Harness::new(
            MergeConfig::default(),
            AccessConfig {
                maintainers: vec!["maya".into()],
                ..Default::default()
            },
        );
        let err = h
            .orch
            .request_merge(h.intent(MergeCondition::Immediate))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Access(AccessError::Forbidden { ref actor, .. }) if actor == "alice"
        ));
        assert!(matches!(
            h.orch.cancel_merge("mallory", h.cr.id),
            Err(OrchestratorError::Access(_))
        ));
    }

    #[test]
    fn test_deferred_merge_runs_when_ci_succeeds() {
        let mut h = Harness::simple();
        let head = h.head();
        h.ci(&head, CiStatus::Running);

        let report = h
            .orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();
        assert_eq!(report.outcome, MergeOutcome::Deferred);
        assert_eq!(report.state(), MergeState::DeferredPendingCi);
        assert!(h.db.get_pending_merge(h.cr.id).unwrap().is_some());
        assert!(h.jobs.try_recv().is_err());

        let reports = h.orch.on_ci_status(&head).unwrap();
        assert_eq!(reports[0].outcome, MergeOutcome::Deferred);

        h.ci(&head, CiStatus::Success);
        let reports = h.orch.on_ci_status(&head).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].trail,
            vec![
                MergeState::DeferredPendingCi,
                MergeState::Evaluating,
                MergeState::Merging
            ]
        );
        assert!(h.db.get_pending_merge(h.cr.id).unwrap().is_none());

        let job = h.next_job();
        let report = h.orch.execute(&job).unwrap();
        assert!(matches!(report.outcome, MergeOutcome::Completed { .. }));
        assert_eq!(h.reload().state, LifecycleState::Merged);
    }

    #[test]
    fn test_push_cancels_deferred_merge() {
        let mut h = Harness::simple();
        let s1 = h.head();
        h.ci(&s1, CiStatus::Running);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();

        let s2 = h
            .repo
            .commit("feature", &[("a.txt", "a\n"), ("b.txt", "b2\n")])
            .to_string();
        set_head(&h.db, &h.cr, &s2);
        assert!(h.orch.on_source_push(h.cr.id, &s1).unwrap().is_none());

        let report = h.orch.on_source_push(h.cr.id, &s2).unwrap().unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Cancelled {
                reason: CancelReason::HeadMoved {
                    tracked_sha: s1.clone(),
                    current_sha: Some(s2.clone()),
                }
            }
        );
        assert_eq!(report.state(), MergeState::Cancelled);

        h.ci(&s1, CiStatus::Success);
        assert!(h.orch.on_ci_status(&s1).unwrap().is_empty());
        assert!(h.jobs.try_recv().is_err());
        assert_eq!(h.reload().state, LifecycleState::Open);
        assert!(h.sink.names().contains(&"merge_cancelled"));
    }

    #[test]
    fn test_recheck_cancels_when_head_moved_without_push_event() {
        let h = Harness::simple();
        let s1 = h.head();
        h.ci(&s1, CiStatus::Pending);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();
        set_head(&h.db, &h.cr, "f".repeat(40).as_str());

        let reports = h.orch.recheck_pending().unwrap();
        assert!(matches!(
            reports[0].outcome,
            MergeOutcome::Cancelled {
                reason: CancelReason::HeadMoved { .. }
            }
        ));
    }

    #[test]
    fn test_recheck_picks_up_missed_ci_event() {
        let mut h = Harness::simple();
        let head = h.head();
        h.ci(&head, CiStatus::Running);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();
        h.ci(&head, CiStatus::Success);

        let reports = h.orch.recheck_pending().unwrap();
        assert_eq!(reports[0].outcome, MergeOutcome::Scheduled);
        h.next_job();
    }

    #[test]
    fn test_ci_failure_discards_deferred_intent() {
        let h = Harness::simple();
        let head = h.head();
        h.ci(&head, CiStatus::Running);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();
        h.ci(&head, CiStatus::Failed);

        let reports = h.orch.on_ci_status(&head).unwrap();
        assert_eq!(
            reports[0].outcome,
            MergeOutcome::Failed {
                reason: FailureReason::Blocked(BlockReason::CiFailed)
            }
        );
        assert!(h.db.get_pending_merge(h.cr.id).unwrap().is_none());
        assert_eq!(h.sink.names(), vec!["merge_deferred", "merge_failed"]);
    }

    #[test]
    fn test_ci_policies() {
        let h = Harness::simple();
        let report = h
            .orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Failed {
                reason: FailureReason::Blocked(BlockReason::CiMissing)
            }
        );

        let h = Harness::new(
            MergeConfig {
                ci_required: true,
                ..Default::default()
            },
            AccessConfig::default(),
        );
        h.ci(&h.head(), CiStatus::Running);
        let report = h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Failed {
                reason: FailureReason::CiPending
            }
        );
    }

    #[test]
    fn test_cancel_by_user() {
        let h = Harness::simple();
        h.ci(&h.head(), CiStatus::Running);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();

        let report = h.orch.cancel_merge("bob", h.cr.id).unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Cancelled {
                reason: CancelReason::ByUser { actor: "bob".into() }
            }
        );

        let again = h.orch.cancel_merge("bob", h.cr.id).unwrap();
        assert_eq!(again.outcome, MergeOutcome::Skipped);
        assert_eq!(again.trail, vec![MergeState::Idle]);
    }

    #[test]
    fn test_concurrent_executions_merge_once() {
        let mut h = Harness::simple();
        h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        let job = h.next_job();

        let reports: Vec<MergeReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| h.orch.execute(&job).unwrap()))
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let completed = reports
            .iter()
            .filter(|r| matches!(r.outcome, MergeOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(reports
            .iter()
            .all(|r| matches!(r.outcome, MergeOutcome::Completed { .. } | MergeOutcome::Skipped)));
        assert_eq!(h.reload().state, LifecycleState::Merged);
    }

    #[test]
    fn test_rerun_after_merge_is_skipped() {
        let mut h = Harness::simple();
        h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        let job = h.next_job();
        h.orch.execute(&job).unwrap();
        let again = h.orch.execute(&job).unwrap();
        assert_eq!(again.outcome, MergeOutcome::Skipped);
        assert_eq!(again.trail, vec![MergeState::Merging]);
    }

    #[test]
    fn test_execute_reevaluates_before_merging() {
        let mut h = Harness::simple();
        h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        let job = h.next_job();

        h.repo.commit("main", &[("a.txt", "a\n"), ("b.txt", "conflict\n")]);
        let report = h.orch.execute(&job).unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Failed {
                reason: FailureReason::Blocked(BlockReason::HasConflicts)
            }
        );
        let cr = h.reload();
        assert_eq!(cr.state, LifecycleState::Open);
        assert!(cr.merge_error.is_none());
        assert_eq!(h.sink.names(), vec!["merge_scheduled", "merge_failed"]);
    }

    #[test]
    fn test_push_after_dispatch_cancels_job() {
        let mut h = Harness::simple();
        let s1 = h.head();
        h.ci(&s1, CiStatus::Running);
        h.orch
            .request_merge(h.intent(MergeCondition::WhenCiSucceeds))
            .unwrap();

        h.ci(&s1, CiStatus::Success);
        let reports = h.orch.on_ci_status(&s1).unwrap();
        assert_eq!(reports[0].outcome, MergeOutcome::Scheduled);
        let job = h.next_job();

        let s2 = h
            .repo
            .commit("feature", &[("a.txt", "a\n"), ("b.txt", "b2\n")])
            .to_string();
        set_head(&h.db, &h.cr, &s2);
        assert!(h.orch.on_source_push(h.cr.id, &s2).unwrap().is_none());

        let main_before = h.repo.tip("main");
        let report = h.orch.execute(&job).unwrap();
        assert_eq!(
            report.outcome,
            MergeOutcome::Cancelled {
                reason: CancelReason::HeadMoved {
                    tracked_sha: s1.clone(),
                    current_sha: Some(s2.clone()),
                }
            }
        );
        assert_eq!(report.state(), MergeState::Cancelled);

        let cr = h.reload();
        assert_eq!(cr.state, LifecycleState::Open);
        assert!(cr.merge_error.is_none());
        assert_eq!(h.repo.tip("main"), main_before);
        assert_eq!(
            h.sink.names(),
            vec!["merge_deferred", "merge_cancelled"]
        );
    }

    #[test]
    fn test_failed_fast_forward_unlocks_and_records_error() {
        let mut h = Harness::new(
            MergeConfig {
                method: MergeMethod::FastForward,
                ..Default::default()
            },
            AccessConfig::default(),
        );
        h.repo.commit("main", &[("a.txt", "a\n"), ("c.txt", "c\n")]);

        h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        let job = h.next_job();
        let report = h.orch.execute(&job).unwrap();
        match &report.outcome {
            MergeOutcome::Failed {
                reason: FailureReason::ExecutionFailed(detail),
            } => assert!(detail.contains("fast-forward")),
            other => panic!("expected execution failure, got {other:?}"),
        }

        let cr = h.reload();
        assert_eq!(cr.state, LifecycleState::Open);
        assert!(cr.locked_at.is_none());
        assert!(cr.merge_error.as_deref().unwrap().contains("fast-forward"));
        assert!(h.sink.names().contains(&"merge_failed"));

        // A fresh request clears the recorded error.
        h.orch.request_merge(h.intent(MergeCondition::Immediate)).unwrap();
        assert!(h.reload().merge_error.is_none());
    }

    #[test]
    fn test_fast_forward_and_source_removal() {
        let mut h = Harness::new(
            MergeConfig {
                method: MergeMethod::FastForward,
                ..Default::default()
            },
            AccessConfig::default(),
        );
        let intent = h.intent(MergeCondition::Immediate).remove_source_branch(true);
        h.orch.request_merge(intent).unwrap();
        let job = h.next_job();
        let report = h.orch.execute(&job).unwrap();

        assert_eq!(
            report.outcome,
            MergeOutcome::Completed {
                merge_commit_sha: h.head()
            }
        );
        assert_eq!(h.repo.tip("main").unwrap().to_string(), h.head());
        assert!(h.repo.tip("feature").is_none());
    }

    #[test]
    fn test_default_merge_message() {
        let h = Harness::simple();
        let mut cr = h.cr.clone();
        cr.title = "WIP: Add b".into();
        assert_eq!(
            default_merge_message(&cr),
            "Merge branch 'feature' into 'main'\n\nAdd b\n\nSee merge request group/app!1"
        );
    }
}
