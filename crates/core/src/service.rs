//! Change request service.
//!
//! The entry points the webhook API and the scheduler call. Each one loads
//! the change request, checks authorization, then drives the snapshot
//! store, the conflict resolver, the lifecycle controller and the merge
//! orchestrator in turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::authz::{Action, Authorizer};
use crate::ci::{CiSignalSource, StoredCiSignals};
use crate::conflict::{ConflictResolver, Detection, FileResolution};
use crate::db::Database;
use crate::errors::{
    AccessError, ConflictError, CoreError, DatabaseError, LifecycleError, SnapshotError, VcsError,
};
use crate::lifecycle::{ChangeRequestUpdate, LifecycleController, LifecycleEvent};
use crate::models::{
    AuditEntry, ChangeRequest, CiSignal, CiStatus, DiffSet, DiffSnapshot, FileDiff,
    LifecycleState, NewChangeRequest,
};
use crate::notify::{short_sha, MergeEvent, NotificationSink};
use crate::orchestrator::{MergeOrchestrator, MergeReport};
use crate::snapshots::DiffSnapshotStore;
use crate::vcs::VersionControl;

/// Attempts at a metadata write that keeps losing to concurrent edits.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Merge error recorded on change requests closed by the lock sweep.
const LOCK_EXPIRED_ERROR: &str = "merge lock expired";

/// What refreshing one change request after a push did.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub change_request: ChangeRequest,
    /// `None` when the source adds nothing over the target.
    pub snapshot: Option<DiffSnapshot>,
    /// Set when a deferred merge was cancelled because the head moved.
    pub merge_report: Option<MergeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictResolution {
    pub commit_sha: String,
    pub change_request: ChangeRequest,
}

/// Metadata edits a user may make. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRequestEdit {
    pub title: Option<String>,
    /// `Some(None)` clears the description.
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    pub work_in_progress: Option<bool>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// CI state of a change request's head.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CiSummary {
    /// Abbreviated head sha, `None` before the head is known.
    pub sha: Option<String>,
    /// A CI status, `success_with_warnings`, or `preparing` when no
    /// pipeline has reported yet.
    pub status: String,
    pub coverage: Option<f64>,
}

pub struct ChangeRequestService {
    db: Arc<Database>,
    vcs: Arc<dyn VersionControl>,
    snapshots: DiffSnapshotStore,
    conflicts: ConflictResolver,
    lifecycle: LifecycleController,
    ci: Arc<StoredCiSignals>,
    authz: Arc<dyn Authorizer>,
    notifier: Arc<dyn NotificationSink>,
    orchestrator: Arc<MergeOrchestrator>,
}

impl ChangeRequestService {
    pub fn new(
        db: Arc<Database>,
        vcs: Arc<dyn VersionControl>,
        ci: Arc<StoredCiSignals>,
        authz: Arc<dyn Authorizer>,
        notifier: Arc<dyn NotificationSink>,
        orchestrator: Arc<MergeOrchestrator>,
    ) -> Self {
        Self {
            snapshots: DiffSnapshotStore::new(db.clone(), vcs.clone()),
            conflicts: ConflictResolver::new(vcs.clone()),
            lifecycle: LifecycleController::new(db.clone()),
            db,
            vcs,
            ci,
            authz,
            notifier,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Arc<MergeOrchestrator> {
        &self.orchestrator
    }

    // -- lookup -------------------------------------------------------------

    pub fn get(&self, id: i64) -> Result<ChangeRequest, CoreError> {
        Ok(self.db.get_change_request(id)?)
    }

    /// Look up a change request by project and per-project number.
    pub fn find(&self, target_project: &str, iid: i64) -> Result<ChangeRequest, CoreError> {
        self.db
            .find_change_request_by_iid(target_project, iid)?
            .ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "change request".into(),
                    id: format!("{}!{}", target_project, iid),
                }
                .into()
            })
    }

    // -- lifecycle ----------------------------------------------------------

    /// Open a change request and take its first snapshot.
    ///
    /// A source that does not exist yet, or adds nothing, leaves the change
    /// request without a snapshot; the next push fills it in.
    #[instrument(skip(self, new), fields(source = %new.source_branch, target = %new.target_branch))]
    pub fn open(&self, actor: &str, new: NewChangeRequest) -> Result<ChangeRequest, CoreError> {
        let wip = ChangeRequest::title_is_wip(&new.title);
        let cr = self.db.insert_change_request(&new, wip)?;
        info!(change_request = %cr.reference(), wip, "opened change request");
        self.audit(
            AuditEntry::success("change_request_opened", &new.title)
                .for_change_request(cr.id)
                .by(actor),
        );
        Ok(self.refresh_open(cr)?.change_request)
    }

    /// Close a change request. `expected_version` is the version the caller
    /// last saw.
    pub fn close(&self, actor: &str, id: i64, expected_version: i64) -> Result<ChangeRequest, CoreError> {
        let cr = self.authorized_at(actor, Action::Update, id, expected_version)?;
        let closed = self.lifecycle.transition(&cr, LifecycleEvent::Close)?;
        self.audit(AuditEntry::success("change_request_closed", "").for_change_request(id).by(actor));
        Ok(closed)
    }

    /// Reopen a closed change request and bring its head up to date.
    pub fn reopen(&self, actor: &str, id: i64, expected_version: i64) -> Result<ChangeRequest, CoreError> {
        let cr = self.authorized_at(actor, Action::Update, id, expected_version)?;
        let reopened = self.lifecycle.transition(&cr, LifecycleEvent::Reopen)?;
        self.audit(AuditEntry::success("change_request_reopened", "").for_change_request(id).by(actor));
        Ok(self.refresh_open(reopened)?.change_request)
    }

    /// Edit title, description or the work-in-progress flag.
    ///
    /// A new title without an explicit flag sets the flag from its prefix.
    pub fn update(
        &self,
        actor: &str,
        id: i64,
        expected_version: i64,
        edit: ChangeRequestEdit,
    ) -> Result<ChangeRequest, CoreError> {
        let cr = self.authorized_at(actor, Action::Update, id, expected_version)?;
        let work_in_progress = edit
            .work_in_progress
            .or_else(|| edit.title.as_deref().map(ChangeRequest::title_is_wip));
        let update = ChangeRequestUpdate {
            title: edit.title,
            description: edit.description,
            work_in_progress,
            ..Default::default()
        };
        if update.is_empty() {
            return Ok(cr);
        }
        let updated = self.lifecycle.update(&cr, update)?;
        self.audit(
            AuditEntry::success("change_request_updated", &updated.title)
                .for_change_request(id)
                .by(actor),
        );
        Ok(updated)
    }

    /// Clear the work-in-progress flag and strip the prefix from the title.
    pub fn remove_wip(&self, actor: &str, id: i64, expected_version: i64) -> Result<ChangeRequest, CoreError> {
        let cr = self.authorized_at(actor, Action::Update, id, expected_version)?;
        if !cr.work_in_progress && !ChangeRequest::title_is_wip(&cr.title) {
            return Ok(cr);
        }
        let update = ChangeRequestUpdate {
            title: Some(cr.wipless_title()),
            work_in_progress: Some(false),
            ..Default::default()
        };
        let updated = self.lifecycle.update(&cr, update)?;
        info!(change_request = %updated.reference(), "cleared work in progress");
        Ok(updated)
    }

    // -- pushes and CI ------------------------------------------------------

    /// Refresh every open change request whose source is `branch` of
    /// `project`.
    #[instrument(skip(self))]
    pub fn handle_push(&self, project: &str, branch: &str) -> Result<Vec<RefreshOutcome>, CoreError> {
        let open = self.db.list_open_change_requests_for_source(project, branch)?;
        debug!(count = open.len(), "refreshing change requests after push");
        open.into_iter().map(|cr| self.refresh_open(cr)).collect()
    }

    /// Snapshot the current source head of one change request, record it as
    /// the head and cancel a deferred merge that tracked an older head.
    pub fn refresh(&self, id: i64) -> Result<RefreshOutcome, CoreError> {
        let cr = self.db.get_change_request(id)?;
        if !cr.is_open() {
            debug!(state = %cr.state, "not refreshing change request that is not open");
            return Ok(RefreshOutcome {
                change_request: cr,
                snapshot: None,
                merge_report: None,
            });
        }
        self.refresh_open(cr)
    }

    /// Store a CI signal and re-evaluate the merges waiting on it.
    pub fn record_ci(&self, signal: &CiSignal) -> Result<Vec<MergeReport>, CoreError> {
        self.ci.record(signal)?;
        Ok(self.orchestrator.on_ci_status(&signal.sha)?)
    }

    pub fn ci_status(&self, id: i64) -> Result<CiSummary, CoreError> {
        let cr = self.db.get_change_request(id)?;
        let Some(head) = cr.head_sha.as_deref() else {
            return Ok(CiSummary {
                sha: None,
                status: "preparing".into(),
                coverage: None,
            });
        };

        let signal = self.ci.latest_status(head)?;
        let status = match &signal {
            None => "preparing".to_string(),
            Some(s) if s.status == CiStatus::Success && s.has_warnings => {
                "success_with_warnings".to_string()
            }
            Some(s) => s.status.to_string(),
        };
        Ok(CiSummary {
            sha: Some(short_sha(head).to_string()),
            status,
            coverage: signal.and_then(|s| s.coverage),
        })
    }

    // -- conflicts ----------------------------------------------------------

    pub fn conflicts(&self, id: i64) -> Result<Detection, CoreError> {
        let cr = self.db.get_change_request(id)?;
        Ok(self.conflicts.detect(&cr.source_branch, &cr.target_branch)?)
    }

    /// Resolve the conflicts between source and target on the source
    /// branch, then refresh the change request.
    #[instrument(skip(self, resolutions))]
    pub fn resolve_conflicts(
        &self,
        actor: &str,
        id: i64,
        resolutions: &BTreeMap<String, FileResolution>,
    ) -> Result<ConflictResolution, CoreError> {
        let cr = self.authorized(actor, Action::ResolveConflicts, id)?;
        if !cr.is_open() {
            return Err(LifecycleError::InvalidTransition {
                from: cr.state.to_string(),
                event: "resolve_conflicts".into(),
            }
            .into());
        }

        let set = match self.conflicts.detect(&cr.source_branch, &cr.target_branch)? {
            Detection::Clean => return Err(ConflictError::AlreadyResolved.into()),
            Detection::Conflicts(set) => set,
        };
        let commit_sha = self.conflicts.resolve(&set, resolutions)?;

        self.audit(
            AuditEntry::success("conflicts_resolved", &commit_sha)
                .for_change_request(id)
                .by(actor),
        );
        let refreshed = self.refresh_open(cr)?;
        self.notifier.notify(
            MergeEvent::ConflictsResolved {
                commit_sha: commit_sha.clone(),
                actor: actor.to_string(),
            },
            &refreshed.change_request,
        );
        Ok(ConflictResolution {
            commit_sha,
            change_request: refreshed.change_request,
        })
    }

    // -- versions -----------------------------------------------------------

    pub fn versions(&self, id: i64) -> Result<Vec<DiffSnapshot>, CoreError> {
        Ok(self.snapshots.list(id)?)
    }

    pub fn latest_version(&self, id: i64) -> Result<DiffSnapshot, CoreError> {
        Ok(self.snapshots.latest(id)?)
    }

    /// One version of a change request.
    pub fn version(&self, id: i64, snapshot_id: i64) -> Result<DiffSnapshot, CoreError> {
        let snapshot = self.snapshots.get(snapshot_id)?;
        if snapshot.change_request_id != id {
            return Err(DatabaseError::NotFound {
                entity: "diff snapshot".into(),
                id: format!("{} of change request {}", snapshot_id, id),
            }
            .into());
        }
        Ok(snapshot)
    }

    /// File diffs of one version of a change request.
    pub fn version_files(&self, id: i64, snapshot_id: i64) -> Result<Vec<FileDiff>, CoreError> {
        let snapshot = self.version(id, snapshot_id)?;
        Ok(self.snapshots.files(&snapshot)?)
    }

    /// What changed between two versions of a change request.
    pub fn compare_versions(
        &self,
        id: i64,
        older_id: i64,
        newer_id: i64,
    ) -> Result<DiffSet, CoreError> {
        let older = self.version(id, older_id)?;
        let newer = self.version(id, newer_id)?;
        Ok(self.snapshots.compare(&older, &newer)?)
    }

    /// What changed in version `newer_id` since the version whose head was
    /// `start_sha`.
    pub fn compare_since(&self, id: i64, newer_id: i64, start_sha: &str) -> Result<DiffSet, CoreError> {
        let newer = self.version(id, newer_id)?;
        Ok(self.snapshots.compare_from_head(&newer, start_sha)?)
    }

    // -- maintenance --------------------------------------------------------

    /// Release merge locks older than `max_age` and close their change
    /// requests.
    pub fn sweep_stale_locks(&self, max_age: Duration) -> Result<Vec<ChangeRequest>, CoreError> {
        let cutoff = Utc::now() - max_age;
        let mut closed = Vec::new();
        for cr in self.db.list_change_requests_in_state(LifecycleState::Locked)? {
            if cr.locked_at.is_some_and(|at| at > cutoff) {
                continue;
            }
            match self.expire_lock(&cr) {
                Ok(cr) => closed.push(cr),
                Err(CoreError::Lifecycle(LifecycleError::StaleVersion { .. })) => {
                    debug!(change_request = %cr.reference(), "lock changed while sweeping");
                }
                Err(e) => warn!(change_request = %cr.reference(), error = %e, "failed to expire merge lock"),
            }
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "closed change requests with expired merge locks");
        }
        Ok(closed)
    }

    // -- internals ----------------------------------------------------------

    fn authorized(&self, actor: &str, action: Action, id: i64) -> Result<ChangeRequest, CoreError> {
        let cr = self.db.get_change_request(id)?;
        if self.authz.can_perform(actor, action, &cr) {
            return Ok(cr);
        }
        warn!(actor, %action, change_request = %cr.reference(), "action denied");
        Err(AccessError::Forbidden {
            actor: actor.to_string(),
            action: action.to_string(),
            change_request_id: id,
        }
        .into())
    }

    /// Like [`Self::authorized`], but only for the version the caller saw.
    fn authorized_at(
        &self,
        actor: &str,
        action: Action,
        id: i64,
        expected_version: i64,
    ) -> Result<ChangeRequest, CoreError> {
        let cr = self.authorized(actor, action, id)?;
        if cr.version != expected_version {
            debug!(id, expected = expected_version, actual = cr.version, "caller holds a stale version");
            return Err(LifecycleError::StaleVersion {
                id,
                expected: expected_version,
                actual: cr.version,
            }
            .into());
        }
        Ok(cr)
    }

    fn refresh_open(&self, cr: ChangeRequest) -> Result<RefreshOutcome, CoreError> {
        let head = match self.vcs.resolve_ref(&cr.source_branch) {
            Ok(head) => head,
            Err(VcsError::RefNotFound(name)) => {
                warn!(change_request = %cr.reference(), branch = %name, "source branch not found");
                return Ok(RefreshOutcome {
                    change_request: cr,
                    snapshot: None,
                    merge_report: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = match self.snapshots.create_snapshot(cr.id, &head, &cr.target_branch) {
            Ok(snapshot) => Some(snapshot),
            Err(SnapshotError::EmptyDiff { .. }) => {
                debug!(change_request = %cr.reference(), "source adds nothing over target");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let cr = if cr.head_sha.as_deref() == Some(head.as_str()) {
            cr
        } else {
            self.update_with_retry(cr, |_| ChangeRequestUpdate {
                head_sha: Some(head.clone()),
                ..Default::default()
            })?
        };
        let merge_report = self.orchestrator.on_source_push(cr.id, &head)?;

        Ok(RefreshOutcome {
            change_request: cr,
            snapshot,
            merge_report,
        })
    }

    fn update_with_retry<F>(&self, mut cr: ChangeRequest, make: F) -> Result<ChangeRequest, CoreError>
    where
        F: Fn(&ChangeRequest) -> ChangeRequestUpdate,
    {
        let mut attempt = 1;
        loop {
            match self.lifecycle.update(&cr, make(&cr)) {
                Err(LifecycleError::StaleVersion { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(attempt, "retrying change request update");
                    attempt += 1;
                    cr = self.db.get_change_request(cr.id)?;
                }
                result => return Ok(result?),
            }
        }
    }

    fn expire_lock(&self, cr: &ChangeRequest) -> Result<ChangeRequest, CoreError> {
        let unlocked = self.lifecycle.transition(
            cr,
            LifecycleEvent::Unlock {
                merge_error: Some(LOCK_EXPIRED_ERROR.to_string()),
            },
        )?;
        let closed = self.lifecycle.transition(&unlocked, LifecycleEvent::Close)?;
        warn!(change_request = %closed.reference(), "merge lock expired, change request closed");
        self.audit(AuditEntry::failure("merge_lock_expired", LOCK_EXPIRED_ERROR).for_change_request(cr.id));
        self.notifier.notify(MergeEvent::LockExpired, &closed);
        Ok(closed)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }
}
