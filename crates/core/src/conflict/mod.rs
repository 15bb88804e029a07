//! Conflict detection and resolution between a change request's source and
//! target branches.
//!
//! 1. **Detection** -- a three-way merge of the two branch heads against
//!    their merge base, split into per-file conflict hunks.
//! 2. **Resolution** -- applying whole-file or per-hunk choices and
//!    committing the result onto the source branch.

pub mod parser;
pub mod resolver;

use crate::errors::ConflictError;

pub use parser::{ConflictHunk, Section, Side};
pub use resolver::{ConflictFile, ConflictResolver, ConflictSet, Detection, FileResolution};

/// Cheap conflict check used by the mergeability evaluator.
pub trait ConflictCheck: Send + Sync {
    fn has_conflicts(&self, source_ref: &str, target_ref: &str) -> Result<bool, ConflictError>;
}
