//! Narrow interface onto the version-control engine.
//!
//! The orchestration layer never touches `git2` directly; it goes through
//! [`VersionControl`], which [`git::GitRepository`] implements for a local
//! repository.

pub mod git;

use serde::{Deserialize, Serialize};

use crate::errors::VcsError;
use crate::models::FileDiff;

pub use git::GitRepository;

/// Result of an attempt to build a merge commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeCommit {
    /// The merge was clean; the commit exists but no ref points at it yet.
    Created(String),
    /// The merge conflicts in these paths.
    Conflict(Vec<String>),
}

/// Result of a compare-and-swap branch update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastForward {
    Advanced,
    /// The branch moved, or the new commit does not descend from it.
    NotFastForward,
}

/// One side of a conflicting index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub path: String,
    pub mode: u32,
    pub binary: bool,
    pub content: Vec<u8>,
}

/// A path that conflicts when merging two commits.
///
/// A side is `None` when the file does not exist on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConflict {
    pub path: String,
    pub ancestor: Option<ConflictSide>,
    pub ours: Option<ConflictSide>,
    pub theirs: Option<ConflictSide>,
}

/// Final content for one conflicting path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// Operations the merge subsystem needs from the version-control engine.
///
/// Revisions are branch names or commit ids; branches are short names
/// (`feature`, not `refs/heads/feature`).
pub trait VersionControl: Send + Sync {
    /// Resolve a branch name or sha to a commit id.
    fn resolve_ref(&self, name: &str) -> Result<String, VcsError>;

    /// File and line diff from one commit to another.
    fn diff(&self, from: &str, to: &str) -> Result<Vec<FileDiff>, VcsError>;

    /// Best common ancestor of two commits.
    fn merge_base(&self, a: &str, b: &str) -> Result<String, VcsError>;

    /// Build a merge commit with parents `(target, source)` without moving
    /// any ref.
    fn create_merge_commit(
        &self,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<MergeCommit, VcsError>;

    /// Move `branch` from `expected` to `new`, provided it still points at
    /// `expected` and `new` descends from it.
    fn fast_forward(&self, branch: &str, expected: &str, new: &str)
        -> Result<FastForward, VcsError>;

    fn delete_branch(&self, branch: &str) -> Result<(), VcsError>;

    /// Paths that conflict when merging `theirs` into `ours`, sorted by path.
    fn merge_conflicts(&self, ours: &str, theirs: &str) -> Result<Vec<TreeConflict>, VcsError>;

    /// Merge `theirs` into `ours`, replacing every conflicting path with the
    /// supplied content, and commit the result with parents `(ours, theirs)`
    /// without moving any ref.
    fn commit_resolution(
        &self,
        ours: &str,
        theirs: &str,
        files: &[ResolvedFile],
        message: &str,
    ) -> Result<String, VcsError>;
}
