//! Conflict detection and in-place resolution between two branches.
//!
//! The source branch is "ours" and the target branch is "theirs". Resolving
//! merges the target into the source and advances the source branch; the
//! target branch and the change request are left alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::parser::{self, ConflictHunk, Section, Side, TextMerge};
use super::ConflictCheck;
use crate::errors::{ConflictError, VcsError};
use crate::vcs::{ConflictSide, FastForward, ResolvedFile, TreeConflict, VersionControl};

/// Files larger than this cannot be resolved in place.
pub const MAX_RESOLVABLE_BYTES: usize = 200 * 1024;

/// One conflicting file with its content split into sections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictFile {
    pub path: String,
    pub ours: String,
    pub theirs: String,
    pub sections: Vec<Section>,
}

impl ConflictFile {
    pub fn hunk_count(&self) -> usize {
        parser::hunk_count(&self.sections)
    }
}

/// Conflicts between two commits, computed at one point in time.
///
/// The set remembers the refs and commits it was computed from and is
/// rejected by [`ConflictResolver::resolve`] once either ref has moved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictSet {
    pub source_ref: String,
    pub target_ref: String,
    pub source_sha: String,
    pub target_sha: String,
    pub base_sha: Option<String>,
    pub files: Vec<ConflictFile>,
}

impl ConflictSet {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "conflicts", rename_all = "snake_case")]
pub enum Detection {
    Clean,
    Conflicts(ConflictSet),
}

/// How to settle one conflicting file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FileResolution {
    KeepOurs,
    KeepTheirs,
    /// Replace the whole file.
    Content(String),
    /// Pick a side for every conflicting hunk, keyed by hunk id.
    Sections(BTreeMap<usize, Side>),
}

pub struct ConflictResolver {
    vcs: Arc<dyn VersionControl>,
}

impl ConflictResolver {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self { vcs }
    }

    /// Compute the conflicts of merging `target_ref` into `source_ref`.
    ///
    /// Fails with [`ConflictError::UnresolvableInUi`] for the first path
    /// that has to be resolved outside this service.
    #[instrument(skip(self))]
    pub fn detect(&self, source_ref: &str, target_ref: &str) -> Result<Detection, ConflictError> {
        let source_sha = self.resolve_ref(source_ref)?;
        let target_sha = self.resolve_ref(target_ref)?;

        let conflicts = self.vcs.merge_conflicts(&source_sha, &target_sha)?;
        if conflicts.is_empty() {
            debug!("no conflicts");
            return Ok(Detection::Clean);
        }

        let base_sha = match self.vcs.merge_base(&source_sha, &target_sha) {
            Ok(sha) => Some(sha),
            Err(VcsError::NoMergeBase(..)) => None,
            Err(e) => return Err(e.into()),
        };

        let files = conflicts
            .iter()
            .map(conflict_file)
            .collect::<Result<Vec<_>, _>>()?;

        info!(files = files.len(), "detected conflicts");
        Ok(Detection::Conflicts(ConflictSet {
            source_ref: source_ref.to_string(),
            target_ref: target_ref.to_string(),
            source_sha,
            target_sha,
            base_sha,
            files,
        }))
    }

    /// Whether merging the two refs conflicts at all, resolvable or not.
    pub fn has_conflicts(&self, source_ref: &str, target_ref: &str) -> Result<bool, ConflictError> {
        let source_sha = self.resolve_ref(source_ref)?;
        let target_sha = self.resolve_ref(target_ref)?;
        Ok(!self.vcs.merge_conflicts(&source_sha, &target_sha)?.is_empty())
    }

    /// Apply `resolutions` to `set`, commit the result on top of the source
    /// branch and return the new commit id.
    ///
    /// Every resolution is checked before anything is written.
    #[instrument(skip(self, set, resolutions), fields(source = %set.source_ref))]
    pub fn resolve(
        &self,
        set: &ConflictSet,
        resolutions: &BTreeMap<String, FileResolution>,
    ) -> Result<String, ConflictError> {
        let files = build_resolved_files(set, resolutions)?;

        self.ensure_unmoved(&set.source_ref, &set.source_sha)?;
        self.ensure_unmoved(&set.target_ref, &set.target_sha)?;

        let message = format!(
            "Merge branch '{}' into '{}'",
            set.target_ref, set.source_ref
        );
        let commit = self
            .vcs
            .commit_resolution(&set.source_sha, &set.target_sha, &files, &message)?;

        match self
            .vcs
            .fast_forward(&set.source_ref, &set.source_sha, &commit)?
        {
            FastForward::Advanced => {
                info!(%commit, files = files.len(), "conflicts resolved");
                Ok(commit)
            }
            FastForward::NotFastForward => {
                let actual = self
                    .vcs
                    .resolve_ref(&set.source_ref)
                    .unwrap_or_else(|_| "<deleted>".to_string());
                Err(ConflictError::StaleConflictSet {
                    branch: set.source_ref.clone(),
                    expected: set.source_sha.clone(),
                    actual,
                })
            }
        }
    }

    fn resolve_ref(&self, name: &str) -> Result<String, ConflictError> {
        self.vcs.resolve_ref(name).map_err(|e| match e {
            VcsError::RefNotFound(name) => ConflictError::RefNotFound(name),
            other => ConflictError::VcsError(other),
        })
    }

    fn ensure_unmoved(&self, name: &str, expected: &str) -> Result<(), ConflictError> {
        let actual = match self.vcs.resolve_ref(name) {
            Ok(sha) => sha,
            Err(VcsError::RefNotFound(_)) => "<deleted>".to_string(),
            Err(e) => return Err(e.into()),
        };
        if actual != expected {
            return Err(ConflictError::StaleConflictSet {
                branch: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

impl ConflictCheck for ConflictResolver {
    fn has_conflicts(&self, source_ref: &str, target_ref: &str) -> Result<bool, ConflictError> {
        ConflictResolver::has_conflicts(self, source_ref, target_ref)
    }
}

fn conflict_file(conflict: &TreeConflict) -> Result<ConflictFile, ConflictError> {
    let unresolvable = |reason: &str| ConflictError::UnresolvableInUi {
        path: conflict.path.clone(),
        reason: reason.to_string(),
    };

    let (ours, theirs) = match (&conflict.ours, &conflict.theirs) {
        (Some(ours), Some(theirs)) => (ours, theirs),
        _ => return Err(unresolvable("file is present on one side only")),
    };
    let renamed = ours.path != theirs.path
        || conflict
            .ancestor
            .as_ref()
            .map(|a| a.path != ours.path)
            .unwrap_or(false);
    if renamed {
        return Err(unresolvable("file was renamed"));
    }
    let sides = [Some(ours), Some(theirs), conflict.ancestor.as_ref()];
    if sides.iter().flatten().any(|s| s.binary) {
        return Err(unresolvable("binary file"));
    }
    if ours.mode != theirs.mode {
        return Err(unresolvable("file modes differ"));
    }
    if sides
        .iter()
        .flatten()
        .any(|s| s.content.len() > MAX_RESOLVABLE_BYTES)
    {
        return Err(unresolvable("file is too large"));
    }

    let ours_text = text(ours).ok_or_else(|| unresolvable("file is not valid UTF-8"))?;
    let theirs_text = text(theirs).ok_or_else(|| unresolvable("file is not valid UTF-8"))?;
    let base_text = match &conflict.ancestor {
        Some(a) => text(a).ok_or_else(|| unresolvable("file is not valid UTF-8"))?,
        None => String::new(),
    };

    let sections = match parser::merge_text(&base_text, &ours_text, &theirs_text) {
        Ok(TextMerge::Conflicted(sections)) => sections,
        Ok(TextMerge::Clean(text)) => vec![Section::Unchanged { text }],
        // Offer the whole file as one hunk.
        Err(_) => vec![Section::Conflict(ConflictHunk {
            id: 0,
            ours: ours_text.clone(),
            base: base_text.clone(),
            theirs: theirs_text.clone(),
        })],
    };

    Ok(ConflictFile {
        path: conflict.path.clone(),
        ours: ours_text,
        theirs: theirs_text,
        sections,
    })
}

fn text(side: &ConflictSide) -> Option<String> {
    String::from_utf8(side.content.clone()).ok()
}

fn build_resolved_files(
    set: &ConflictSet,
    resolutions: &BTreeMap<String, FileResolution>,
) -> Result<Vec<ResolvedFile>, ConflictError> {
    let mut files = Vec::with_capacity(set.files.len());
    for file in &set.files {
        let resolution = resolutions
            .get(&file.path)
            .ok_or_else(|| ConflictError::MissingResolution(file.path.clone()))?;
        let content = match resolution {
            FileResolution::KeepOurs => file.ours.clone(),
            FileResolution::KeepTheirs => file.theirs.clone(),
            FileResolution::Content(content) => {
                if parser::contains_conflict_block(content) {
                    return Err(ConflictError::InvalidResolution {
                        path: file.path.clone(),
                        detail: "content still contains conflict markers".into(),
                    });
                }
                content.clone()
            }
            FileResolution::Sections(choices) => {
                if let Some(id) = choices.keys().find(|id| **id >= file.hunk_count()) {
                    return Err(ConflictError::InvalidResolution {
                        path: file.path.clone(),
                        detail: format!("no conflict hunk {id}"),
                    });
                }
                parser::render(&file.sections, choices)
                    .map_err(|_| ConflictError::MissingResolution(file.path.clone()))?
            }
        };
        files.push(ResolvedFile {
            path: file.path.clone(),
            content: content.into_bytes(),
        });
    }

    if let Some(extra) = resolutions
        .keys()
        .find(|path| !set.files.iter().any(|f| &f.path == *path))
    {
        return Err(ConflictError::InvalidResolution {
            path: extra.clone(),
            detail: "file is not in conflict".into(),
        });
    }
    Ok(files)
}
