//! Whether a change request can be merged right now.
//!
//! [`MergeabilityEvaluator::evaluate`] checks, in order:
//!
//! 1. the requested head sha matches the current source head
//! 2. the change request is open
//! 3. it is not marked work in progress
//! 4. the branches merge without conflicts
//! 5. CI is not still running (when required)
//! 6. CI did not fail (when required)
//! 7. a CI signal exists (when the caller demands one)
//!
//! The first failing check decides. A stale sha is reported even when
//! everything else is green.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::ConflictCheck;
use crate::errors::ConflictError;
use crate::models::{ChangeRequest, CiSignal, CiStatus, LifecycleState};

/// Why a change request cannot be merged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ShaMismatch,
    NotOpen,
    WorkInProgress,
    HasConflicts,
    CiFailed,
    CiMissing,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ShaMismatch => "source branch head does not match the requested sha",
            Self::NotOpen => "change request is not open",
            Self::WorkInProgress => "change request is marked as work in progress",
            Self::HasConflicts => "source branch has conflicts with the target branch",
            Self::CiFailed => "CI failed",
            Self::CiMissing => "no CI status has been reported",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Mergeable,
    WaitingOnCi,
    BlockedBy(BlockReason),
}

/// How CI affects mergeability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CiPolicy {
    /// A pending or failed pipeline blocks the merge.
    pub required: bool,
    /// A missing signal blocks the merge too. Only meaningful with `required`.
    pub require_signal: bool,
}

impl CiPolicy {
    pub fn not_required() -> Self {
        Self::default()
    }

    pub fn required() -> Self {
        Self {
            required: true,
            require_signal: false,
        }
    }

    pub fn signal_required() -> Self {
        Self {
            required: true,
            require_signal: true,
        }
    }
}

pub struct MergeabilityEvaluator;

impl MergeabilityEvaluator {
    /// Decide whether `change_request` can be merged at `requested_sha`.
    ///
    /// The conflict check only runs once the cheap checks have passed; its
    /// errors are the only ones returned.
    pub fn evaluate(
        change_request: &ChangeRequest,
        ci: Option<&CiSignal>,
        requested_sha: &str,
        policy: CiPolicy,
        conflicts: &dyn ConflictCheck,
    ) -> Result<Decision, ConflictError> {
        let decision = Self::decide(change_request, ci, requested_sha, policy, conflicts)?;
        debug!(
            change_request = %change_request.reference(),
            ?decision,
            "evaluated mergeability"
        );
        Ok(decision)
    }

    fn decide(
        cr: &ChangeRequest,
        ci: Option<&CiSignal>,
        requested_sha: &str,
        policy: CiPolicy,
        conflicts: &dyn ConflictCheck,
    ) -> Result<Decision, ConflictError> {
        if cr.head_sha.as_deref() != Some(requested_sha) {
            return Ok(Decision::BlockedBy(BlockReason::ShaMismatch));
        }
        if cr.state != LifecycleState::Open {
            return Ok(Decision::BlockedBy(BlockReason::NotOpen));
        }
        if cr.work_in_progress {
            return Ok(Decision::BlockedBy(BlockReason::WorkInProgress));
        }
        if conflicts.has_conflicts(requested_sha, &cr.target_branch)? {
            return Ok(Decision::BlockedBy(BlockReason::HasConflicts));
        }
        if !policy.required {
            return Ok(Decision::Mergeable);
        }

        // A signal reported for another sha says nothing about this one.
        let status = ci.filter(|s| s.sha == requested_sha).map(|s| s.status);
        Ok(match status {
            Some(CiStatus::Pending | CiStatus::Running) => Decision::WaitingOnCi,
            Some(CiStatus::Failed) => Decision::BlockedBy(BlockReason::CiFailed),
            Some(CiStatus::Success | CiStatus::Skipped) => Decision::Mergeable,
            None if policy.require_signal => Decision::BlockedBy(BlockReason::CiMissing),
            None => Decision::Mergeable,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;

    struct FixedConflicts {
        conflicted: bool,
        calls: AtomicUsize,
    }

    impl FixedConflicts {
        fn new(conflicted: bool) -> Self {
            Self {
                conflicted,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ConflictCheck for FixedConflicts {
        fn has_conflicts(&self, _source: &str, _target: &str) -> Result<bool, ConflictError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.conflicted)
        }
    }

    fn change_request() -> ChangeRequest {
        let now = Utc::now();
        ChangeRequest {
            id: 1,
            target_project: "group/app".into(),
            iid: 1,
            source_project: "group/app".into(),
            source_branch: "feature".into(),
            target_branch: "main".into(),
            title: "Add feature".into(),
            description: None,
            state: LifecycleState::Open,
            head_sha: Some("s1".into()),
            merge_commit_sha: None,
            merge_error: None,
            work_in_progress: false,
            version: 1,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn signal(sha: &str, status: CiStatus) -> CiSignal {
        CiSignal {
            sha: sha.into(),
            status,
            coverage: None,
            has_warnings: false,
        }
    }

    fn eval(cr: &ChangeRequest, ci: Option<&CiSignal>, sha: &str, policy: CiPolicy) -> Decision {
        MergeabilityEvaluator::evaluate(cr, ci, sha, policy, &FixedConflicts::new(false)).unwrap()
    }

    #[test]
    fn test_clean_without_ci_is_mergeable() {
        let cr = change_request();
        assert_eq!(eval(&cr, None, "s1", CiPolicy::not_required()), Decision::Mergeable);
    }

    #[test]
    fn test_sha_mismatch_dominates() {
        let mut cr = change_request();
        cr.state = LifecycleState::Closed;
        cr.work_in_progress = true;
        let failed = signal("s0", CiStatus::Failed);
        let conflicts = FixedConflicts::new(true);

        let decision = MergeabilityEvaluator::evaluate(
            &cr,
            Some(&failed),
            "s0",
            CiPolicy::signal_required(),
            &conflicts,
        )
        .unwrap();
        assert_eq!(decision, Decision::BlockedBy(BlockReason::ShaMismatch));
        assert_eq!(conflicts.calls.load(Ordering::SeqCst), 0);

        let green = signal("s0", CiStatus::Success);
        let cr = change_request();
        assert_eq!(
            eval(&cr, Some(&green), "s0", CiPolicy::not_required()),
            Decision::BlockedBy(BlockReason::ShaMismatch)
        );
    }

    #[test]
    fn test_missing_head_is_mismatch() {
        let mut cr = change_request();
        cr.head_sha = None;
        assert_eq!(
            eval(&cr, None, "s1", CiPolicy::not_required()),
            Decision::BlockedBy(BlockReason::ShaMismatch)
        );
    }

    #[test]
    fn test_state_and_wip_precede_conflicts() {
        let conflicts = FixedConflicts::new(true);

        let mut cr = change_request();
        cr.state = LifecycleState::Locked;
        let decision =
            MergeabilityEvaluator::evaluate(&cr, None, "s1", CiPolicy::default(), &conflicts)
                .unwrap();
        assert_eq!(decision, Decision::BlockedBy(BlockReason::NotOpen));

        let mut cr = change_request();
        cr.work_in_progress = true;
        let decision =
            MergeabilityEvaluator::evaluate(&cr, None, "s1", CiPolicy::default(), &conflicts)
                .unwrap();
        assert_eq!(decision, Decision::BlockedBy(BlockReason::WorkInProgress));
        assert_eq!(conflicts.calls.load(Ordering::SeqCst), 0);

        let cr = change_request();
        let running = signal("s1", CiStatus::Running);
        let decision = MergeabilityEvaluator::evaluate(
            &cr,
            Some(&running),
            "s1",
            CiPolicy::required(),
            &conflicts,
        )
        .unwrap();
        assert_eq!(decision, Decision::BlockedBy(BlockReason::HasConflicts));
    }

    #[test]
    fn test_ci_states() {
        let cr = change_request();
        let cases = [
            (CiStatus::Pending, Decision::WaitingOnCi),
            (CiStatus::Running, Decision::WaitingOnCi),
            (CiStatus::Failed, Decision::BlockedBy(BlockReason::CiFailed)),
            (CiStatus::Success, Decision::Mergeable),
            (CiStatus::Skipped, Decision::Mergeable),
        ];
        for (status, expected) in cases {
            let ci = signal("s1", status);
            assert_eq!(eval(&cr, Some(&ci), "s1", CiPolicy::required()), expected);
        }

        let failed = signal("s1", CiStatus::Failed);
        assert_eq!(
            eval(&cr, Some(&failed), "s1", CiPolicy::not_required()),
            Decision::Mergeable
        );
    }

    #[test]
    fn test_missing_signal() {
        let cr = change_request();
        assert_eq!(eval(&cr, None, "s1", CiPolicy::required()), Decision::Mergeable);
        assert_eq!(
            eval(&cr, None, "s1", CiPolicy::signal_required()),
            Decision::BlockedBy(BlockReason::CiMissing)
        );

        let other = signal("s0", CiStatus::Success);
        assert_eq!(
            eval(&cr, Some(&other), "s1", CiPolicy::signal_required()),
            Decision::BlockedBy(BlockReason::CiMissing)
        );
    }
}
