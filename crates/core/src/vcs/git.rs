//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::{
    BranchType, Commit, Delta, DiffFindOptions, DiffOptions, ErrorCode, Index, IndexEntry,
    IndexTime, Oid, Patch, Repository, Signature,
};
use tracing::{debug, info, instrument, warn};

use super::{ConflictSide, FastForward, MergeCommit, ResolvedFile, TreeConflict, VersionControl};
use crate::errors::VcsError;
use crate::models::{ChangeKind, DiffHunk, DiffLine, FileDiff, LineOrigin};

/// Mode of a submodule entry; it has no blob to read.
const GITLINK_MODE: u32 = 0o160000;
const DEFAULT_FILE_MODE: u32 = 0o100644;

/// [`VersionControl`] backed by a local `git2::Repository`.
///
/// `git2::Repository` is not `Sync`, so the handle sits behind a mutex and
/// every operation runs under the lock.
pub struct GitRepository {
    repo: Mutex<Repository>,
    repo_path: PathBuf,
    committer_name: String,
    committer_email: String,
}

impl GitRepository {
    /// Open an existing Git repository at `repo_path`. Merge commits are
    /// recorded under the given committer identity.
    pub fn open<P: AsRef<Path>>(
        repo_path: P,
        committer_name: &str,
        committer_email: &str,
    ) -> Result<Self, VcsError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| VcsError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo: Mutex::new(repo),
            repo_path: path.to_path_buf(),
            committer_name: committer_name.to_string(),
            committer_email: committer_email.to_string(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| {
            warn!("git repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn signature(&self) -> Result<Signature<'static>, VcsError> {
        Ok(Signature::now(&self.committer_name, &self.committer_email)?)
    }
}

impl VersionControl for GitRepository {
    fn resolve_ref(&self, name: &str) -> Result<String, VcsError> {
        let repo = self.repo();
        let commit = find_commit(&repo, name)?;
        Ok(commit.id().to_string())
    }

    #[instrument(skip(self))]
    fn diff(&self, from: &str, to: &str) -> Result<Vec<FileDiff>, VcsError> {
        let repo = self.repo();
        let from_tree = find_commit(&repo, from)?.tree()?;
        let to_tree = find_commit(&repo, to)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.context_lines(3);
        let mut diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut opts))?;
        let mut find = DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find))?;

        let mut files = Vec::new();
        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let new_path = delta.new_file().path().map(path_string);
            let old_path = delta.old_file().path().map(path_string);
            let change_kind = match delta.status() {
                Delta::Added => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Renamed => ChangeKind::Renamed,
                Delta::Copied => ChangeKind::Copied,
                Delta::Typechange => ChangeKind::TypeChanged,
                _ => ChangeKind::Modified,
            };
            let path = match change_kind {
                ChangeKind::Deleted => old_path.clone(),
                _ => new_path.or_else(|| old_path.clone()),
            }
            .unwrap_or_default();
            let old_path = match change_kind {
                ChangeKind::Renamed | ChangeKind::Copied => old_path,
                _ => None,
            };

            let (binary, hunks) = match Patch::from_diff(&diff, idx)? {
                Some(patch) if !delta.flags().is_binary() => (false, collect_hunks(&patch)?),
                Some(_) => (true, Vec::new()),
                None => (delta.flags().is_binary(), Vec::new()),
            };

            files.push(FileDiff {
                path,
                old_path,
                change_kind,
                binary,
                hunks,
            });
        }

        debug!(count = files.len(), "computed diff");
        Ok(files)
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String, VcsError> {
        let repo = self.repo();
        let a_id = find_commit(&repo, a)?.id();
        let b_id = find_commit(&repo, b)?.id();
        match repo.merge_base(a_id, b_id) {
            Ok(oid) => Ok(oid.to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => {
                Err(VcsError::NoMergeBase(a.to_string(), b.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, message))]
    fn create_merge_commit(
        &self,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<MergeCommit, VcsError> {
        let repo = self.repo();
        let target_commit = find_commit(&repo, target)?;
        let source_commit = find_commit(&repo, source)?;

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let paths = conflict_paths(&index)?;
            info!(conflicts = paths.len(), "merge has conflicts");
            return Ok(MergeCommit::Conflict(paths));
        }

        let tree_oid = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let oid = repo.commit(
            None,
            &sig,
            &sig,
            message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        info!(sha = %oid, "created merge commit");
        Ok(MergeCommit::Created(oid.to_string()))
    }

    #[instrument(skip(self))]
    fn fast_forward(
        &self,
        branch: &str,
        expected: &str,
        new: &str,
    ) -> Result<FastForward, VcsError> {
        let repo = self.repo();
        let refname = format!("refs/heads/{}", branch);
        let reference = match repo.find_reference(&refname) {
            Ok(r) => r,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(VcsError::RefNotFound(branch.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let current = reference.target().ok_or_else(|| VcsError::InvalidObject {
            id: refname.clone(),
            detail: "symbolic reference".into(),
        })?;
        let expected = parse_oid(expected)?;
        let new = parse_oid(new)?;

        if current != expected {
            debug!(%current, %expected, "branch moved");
            return Ok(FastForward::NotFastForward);
        }
        if current != new && !repo.graph_descendant_of(new, current)? {
            debug!(%current, %new, "not a descendant");
            return Ok(FastForward::NotFastForward);
        }

        let log = format!("mergeflow: fast-forward {} to {}", branch, new);
        let outcome = match repo.reference_matching(&refname, new, true, current, &log) {
            Ok(_) => {
                info!(%new, "advanced branch");
                FastForward::Advanced
            }
            Err(e) if e.code() == ErrorCode::Modified => FastForward::NotFastForward,
            Err(e) => return Err(e.into()),
        };
        Ok(outcome)
    }

    #[instrument(skip(self))]
    fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        let repo = self.repo();
        let mut found = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(VcsError::RefNotFound(branch.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        found.delete()?;
        info!("deleted branch");
        Ok(())
    }

    fn merge_conflicts(&self, ours: &str, theirs: &str) -> Result<Vec<TreeConflict>, VcsError> {
        let repo = self.repo();
        let ours_commit = find_commit(&repo, ours)?;
        let theirs_commit = find_commit(&repo, theirs)?;

        let index = repo.merge_commits(&ours_commit, &theirs_commit, None)?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }

        let mut conflicts = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let ancestor = conflict_side(&repo, conflict.ancestor.as_ref())?;
            let ours = conflict_side(&repo, conflict.our.as_ref())?;
            let theirs = conflict_side(&repo, conflict.their.as_ref())?;
            let path = ours
                .as_ref()
                .or(theirs.as_ref())
                .or(ancestor.as_ref())
                .map(|s| s.path.clone())
                .unwrap_or_default();
            conflicts.push(TreeConflict {
                path,
                ancestor,
                ours,
                theirs,
            });
        }
        conflicts.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = conflicts.len(), "collected merge conflicts");
        Ok(conflicts)
    }

    #[instrument(skip(self, files, message), fields(files = files.len()))]
    fn commit_resolution(
        &self,
        ours: &str,
        theirs: &str,
        files: &[ResolvedFile],
        message: &str,
    ) -> Result<String, VcsError> {
        let repo = self.repo();
        let ours_commit = find_commit(&repo, ours)?;
        let theirs_commit = find_commit(&repo, theirs)?;

        let mut index = repo.merge_commits(&ours_commit, &theirs_commit, None)?;
        let conflicts = index
            .conflicts()?
            .collect::<Result<Vec<_>, git2::Error>>()?;

        for file in files {
            let mode = conflicts
                .iter()
                .find_map(|c| {
                    [c.our.as_ref(), c.their.as_ref()]
                        .into_iter()
                        .flatten()
                        .find(|e| e.path == file.path.as_bytes())
                        .map(|e| e.mode)
                })
                .unwrap_or(DEFAULT_FILE_MODE);
            let blob = repo.blob(&file.content)?;
            index.remove_path(Path::new(&file.path))?;
            index.add(&IndexEntry {
                ctime: IndexTime::new(0, 0),
                mtime: IndexTime::new(0, 0),
                dev: 0,
                ino: 0,
                mode,
                uid: 0,
                gid: 0,
                file_size: file.content.len() as u32,
                id: blob,
                flags: file.path.len().min(0xfff) as u16,
                flags_extended: 0,
                path: file.path.as_bytes().to_vec(),
            })?;
        }

        if index.has_conflicts() {
            return Err(VcsError::UnresolvedPaths(conflict_paths(&index)?));
        }

        let tree_oid = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let oid = repo.commit(
            None,
            &sig,
            &sig,
            message,
            &tree,
            &[&ours_commit, &theirs_commit],
        )?;
        info!(sha = %oid, "created resolution commit");
        Ok(oid.to_string())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn find_commit<'r>(repo: &'r Repository, rev: &str) -> Result<Commit<'r>, VcsError> {
    let object = repo.revparse_single(rev).map_err(|e| match e.code() {
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous => {
            VcsError::RefNotFound(rev.to_string())
        }
        _ => VcsError::Git2Error(e),
    })?;
    object.peel_to_commit().map_err(|e| VcsError::InvalidObject {
        id: rev.to_string(),
        detail: e.message().to_string(),
    })
}

fn parse_oid(sha: &str) -> Result<Oid, VcsError> {
    Oid::from_str(sha).map_err(|e| VcsError::InvalidObject {
        id: sha.to_string(),
        detail: e.message().to_string(),
    })
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn collect_hunks(patch: &Patch<'_>) -> Result<Vec<DiffHunk>, VcsError> {
    let mut hunks = Vec::with_capacity(patch.num_hunks());
    for h in 0..patch.num_hunks() {
        let (hunk, line_count) = patch.hunk(h)?;
        let mut lines = Vec::with_capacity(line_count);
        for l in 0..line_count {
            let line = patch.line_in_hunk(h, l)?;
            let origin = match line.origin() {
                ' ' => LineOrigin::Context,
                '+' => LineOrigin::Addition,
                '-' => LineOrigin::Deletion,
                // End-of-file newline markers and the like.
                _ => continue,
            };
            lines.push(DiffLine {
                origin,
                content: String::from_utf8_lossy(line.content()).into_owned(),
                old_lineno: line.old_lineno(),
                new_lineno: line.new_lineno(),
            });
        }
        hunks.push(DiffHunk {
            header: String::from_utf8_lossy(hunk.header()).trim_end().to_string(),
            old_start: hunk.old_start(),
            old_lines: hunk.old_lines(),
            new_start: hunk.new_start(),
            new_lines: hunk.new_lines(),
            lines,
        });
    }
    Ok(hunks)
}

fn conflict_paths(index: &Index) -> Result<Vec<String>, VcsError> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn conflict_side(
    repo: &Repository,
    entry: Option<&IndexEntry>,
) -> Result<Option<ConflictSide>, VcsError> {
    let Some(entry) = entry else {
        return Ok(None);
    };
    let path = String::from_utf8_lossy(&entry.path).into_owned();
    if entry.mode == GITLINK_MODE {
        return Ok(Some(ConflictSide {
            path,
            mode: entry.mode,
            binary: true,
            content: Vec::new(),
        }));
    }
    let blob = repo.find_blob(entry.id)?;
    Ok(Some(ConflictSide {
        path,
        mode: entry.mode,
        binary: blob.is_binary(),
        content: blob.content().to_vec(),
    }))
}
