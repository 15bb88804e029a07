//! The only writer of a change request's lifecycle state.
//!
//! Every write is a compare-and-swap on the version token carried by the
//! [`ChangeRequest`] value the caller passes in. A caller holding an old
//! value gets [`LifecycleError::StaleVersion`] and must reload; concurrent
//! edits are never overwritten.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::errors::{DatabaseError, LifecycleError};
use crate::models::{ChangeRequest, LifecycleState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Close,
    Reopen,
    /// Take the exclusive merge token.
    LockForMerge,
    /// Give the merge token back, recording why the merge did not happen.
    Unlock { merge_error: Option<String> },
    MarkMerged { merge_commit_sha: String },
}

impl LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Reopen => "reopen",
            Self::LockForMerge => "lock_for_merge",
            Self::Unlock { .. } => "unlock",
            Self::MarkMerged { .. } => "mark_merged",
        }
    }
}

/// Metadata edits applied by [`LifecycleController::update`]. `None` leaves
/// a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeRequestUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub work_in_progress: Option<bool>,
    pub head_sha: Option<String>,
    pub merge_error: Option<Option<String>>,
}

impl ChangeRequestUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct LifecycleController {
    db: Arc<Database>,
}

impl LifecycleController {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply `event` to `cr`, returning the stored result.
    pub fn transition(
        &self,
        cr: &ChangeRequest,
        event: LifecycleEvent,
    ) -> Result<ChangeRequest, LifecycleError> {
        let mut next = cr.clone();
        match (&event, cr.state) {
            (LifecycleEvent::Close, LifecycleState::Open) => {
                next.state = LifecycleState::Closed;
            }
            (LifecycleEvent::Reopen, LifecycleState::Closed) => {
                next.state = LifecycleState::Open;
            }
            (LifecycleEvent::LockForMerge, LifecycleState::Open) => {
                next.state = LifecycleState::Locked;
                next.locked_at = Some(Utc::now());
            }
            (LifecycleEvent::Unlock { merge_error }, LifecycleState::Locked) => {
                next.state = LifecycleState::Open;
                next.locked_at = None;
                next.merge_error = merge_error.clone();
            }
            (
                LifecycleEvent::MarkMerged { merge_commit_sha },
                LifecycleState::Open | LifecycleState::Locked,
            ) => {
                next.state = LifecycleState::Merged;
                next.locked_at = None;
                next.merge_error = None;
                next.merge_commit_sha = Some(merge_commit_sha.clone());
            }
            (event, from) => {
                return Err(LifecycleError::InvalidTransition {
                    from: from.to_string(),
                    event: event.name().to_string(),
                });
            }
        }

        let stored = self.swap(cr, next)?;
        info!(
            change_request = %stored.reference(),
            from = %cr.state,
            to = %stored.state,
            event = event.name(),
            version = stored.version,
            "lifecycle transition"
        );
        Ok(stored)
    }

    /// Edit metadata under the same version rule as [`Self::transition`].
    pub fn update(
        &self,
        cr: &ChangeRequest,
        update: ChangeRequestUpdate,
    ) -> Result<ChangeRequest, LifecycleError> {
        let mut next = cr.clone();
        if let Some(title) = update.title {
            next.title = title;
        }
        if let Some(description) = update.description {
            next.description = description;
        }
        if let Some(wip) = update.work_in_progress {
            next.work_in_progress = wip;
        }
        if let Some(sha) = update.head_sha {
            next.head_sha = Some(sha);
        }
        if let Some(merge_error) = update.merge_error {
            next.merge_error = merge_error;
        }

        let stored = self.swap(cr, next)?;
        debug!(
            change_request = %stored.reference(),
            version = stored.version,
            "updated change request"
        );
        Ok(stored)
    }

    fn swap(
        &self,
        current: &ChangeRequest,
        mut next: ChangeRequest,
    ) -> Result<ChangeRequest, LifecycleError> {
        next.updated_at = Utc::now();
        if self
            .db
            .compare_and_swap_change_request(&next, current.version)?
        {
            next.version = current.version + 1;
            return Ok(next);
        }

        let actual = self
            .db
            .get_change_request_version(current.id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "change_request".into(),
                id: current.id.to_string(),
            })?;
        warn!(
            id = current.id,
            expected = current.version,
            actual,
            "stale change request version"
        );
        Err(LifecycleError::StaleVersion {
            id: current.id,
            expected: current.version,
            actual,
        })
    }
}
