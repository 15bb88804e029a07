//! Append-only store of diff snapshots.
//!
//! Every revision of a change request gets one immutable [`DiffSnapshot`]
//! recording the source head, the target head and their merge base. The
//! file diffs are kept as a JSON payload next to the row and only decoded
//! when a caller asks for them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::queries::NewDiffSnapshot;
use crate::db::Database;
use crate::errors::{SnapshotError, VcsError};
use crate::models::{DiffSet, DiffSnapshot, FileDiff};
use crate::vcs::VersionControl;

pub struct DiffSnapshotStore {
    db: Arc<Database>,
    vcs: Arc<dyn VersionControl>,
}

impl DiffSnapshotStore {
    pub fn new(db: Arc<Database>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { db, vcs }
    }

    /// Record the diff of `source_ref` against its merge base with
    /// `target_ref`.
    ///
    /// Returns the existing snapshot when one was already taken for the same
    /// pair of heads. Fails with [`SnapshotError::EmptyDiff`] when both refs
    /// resolve to the same commit or the source adds nothing.
    pub fn create_snapshot(
        &self,
        change_request_id: i64,
        source_ref: &str,
        target_ref: &str,
    ) -> Result<DiffSnapshot, SnapshotError> {
        let head_sha = self.vcs.resolve_ref(source_ref).map_err(ref_error)?;
        let start_sha = self.vcs.resolve_ref(target_ref).map_err(ref_error)?;

        if head_sha == start_sha {
            return Err(SnapshotError::EmptyDiff {
                source_ref: source_ref.to_string(),
                target_ref: target_ref.to_string(),
            });
        }

        if let Some(existing) = self
            .db
            .find_diff_snapshot(change_request_id, &head_sha, &start_sha)?
        {
            debug!(id = existing.id, "snapshot already recorded");
            return Ok(existing);
        }

        let base_sha = match self.vcs.merge_base(&head_sha, &start_sha) {
            Ok(base) => base,
            Err(VcsError::NoMergeBase(..)) => {
                warn!(%head_sha, %start_sha, "unrelated histories, diffing against target head");
                start_sha.clone()
            }
            Err(e) => return Err(e.into()),
        };

        let files = self.vcs.diff(&base_sha, &head_sha)?;
        if files.is_empty() {
            return Err(SnapshotError::EmptyDiff {
                source_ref: source_ref.to_string(),
                target_ref: target_ref.to_string(),
            });
        }

        let files_json = serde_json::to_string(&files)?;
        let (snapshot, created) = self.db.find_or_insert_diff_snapshot(&NewDiffSnapshot {
            change_request_id,
            head_sha: &head_sha,
            base_sha: &base_sha,
            start_sha: &start_sha,
            file_count: files.len() as i64,
            files_json: &files_json,
        })?;

        if created {
            info!(
                change_request_id,
                position = snapshot.position,
                head = %snapshot.head_sha,
                files = snapshot.file_count,
                "created diff snapshot"
            );
        }
        Ok(snapshot)
    }

    /// What changed between two revisions of the same change request.
    ///
    /// `older` must precede `newer`.
    pub fn compare(
        &self,
        older: &DiffSnapshot,
        newer: &DiffSnapshot,
    ) -> Result<DiffSet, SnapshotError> {
        if older.change_request_id != newer.change_request_id {
            return Err(SnapshotError::InvalidSnapshotOrder(format!(
                "snapshots {} and {} belong to different change requests",
                older.id, newer.id
            )));
        }
        if older.position >= newer.position {
            return Err(SnapshotError::InvalidSnapshotOrder(format!(
                "snapshot {} (position {}) does not precede snapshot {} (position {})",
                older.id, older.position, newer.id, newer.position
            )));
        }

        let files = self.vcs.diff(&older.head_sha, &newer.head_sha)?;
        Ok(DiffSet {
            from_sha: older.head_sha.clone(),
            to_sha: newer.head_sha.clone(),
            files,
        })
    }

    /// Compare `newer` against the latest earlier snapshot whose head was
    /// `start_sha`.
    pub fn compare_from_head(
        &self,
        newer: &DiffSnapshot,
        start_sha: &str,
    ) -> Result<DiffSet, SnapshotError> {
        let older = self
            .db
            .find_earlier_diff_snapshot_by_head(newer.change_request_id, start_sha, newer.position)?
            .ok_or_else(|| {
                SnapshotError::InvalidSnapshotOrder(format!(
                    "no snapshot before position {} has head {}",
                    newer.position, start_sha
                ))
            })?;
        self.compare(&older, newer)
    }

    /// The most recent snapshot of a change request.
    pub fn latest(&self, change_request_id: i64) -> Result<DiffSnapshot, SnapshotError> {
        self.db
            .latest_diff_snapshot(change_request_id)?
            .ok_or(SnapshotError::NoSnapshots(change_request_id))
    }

    /// All snapshots in creation order.
    pub fn list(&self, change_request_id: i64) -> Result<Vec<DiffSnapshot>, SnapshotError> {
        Ok(self.db.list_diff_snapshots(change_request_id)?)
    }

    pub fn get(&self, id: i64) -> Result<DiffSnapshot, SnapshotError> {
        Ok(self.db.get_diff_snapshot(id)?)
    }

    /// Decode the file diffs stored with a snapshot.
    pub fn files(&self, snapshot: &DiffSnapshot) -> Result<Vec<FileDiff>, SnapshotError> {
        let json = self.db.get_diff_snapshot_files(snapshot.id)?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn ref_error(err: VcsError) -> SnapshotError {
    match err {
        VcsError::RefNotFound(name) => SnapshotError::RefNotFound(name),
        other => SnapshotError::VcsError(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_change_request, test_db, TestRepo};

    struct Fixture {
        repo: TestRepo,
        db: Arc<Database>,
        store: DiffSnapshotStore,
        cr_id: i64,
    }

    fn setup() -> Fixture {
        let repo = TestRepo::new();
        repo.commit("main", &[("a.txt", "a\n")]);
        repo.branch("feature", "main");
        let db = test_db();
        let cr_id = open_change_request(&db, "feature", "main").id;
        let store = DiffSnapshotStore::new(db.clone(), repo.git());
        Fixture {
            repo,
            db,
            store,
            cr_id,
        }
    }

    #[test]
    fn test_identical_refs_are_empty() {
        let f = setup();
        let err = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap_err();
        assert!(matches!(err, SnapshotError::EmptyDiff { .. }));
        assert!(matches!(
            f.store.latest(f.cr_id),
            Err(SnapshotError::NoSnapshots(_))
        ));
    }

    #[test]
    fn test_missing_ref() {
        let f = setup();
        let err = f.store.create_snapshot(f.cr_id, "nope", "main").unwrap_err();
        assert!(matches!(err, SnapshotError::RefNotFound(ref r) if r == "nope"));
    }

    #[test]
    fn test_create_is_idempotent_and_ordered() {
        let f = setup();
        f.repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n")]);

        let first = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        let again = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.position, 1);
        assert_eq!(first.file_count, 1);

        f.repo.commit("feature", &[("a.txt", "A\n"), ("b.txt", "b\n")]);
        let second = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        assert_eq!(second.position, 2);

        let ids: Vec<i64> = f.store.list(f.cr_id).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(f.store.latest(f.cr_id).unwrap().id, second.id);

        let files = f.store.files(&second).unwrap();
        let mut paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_target_move_creates_new_snapshot() {
        let f = setup();
        f.repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let first = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        f.repo.commit("main", &[("a.txt", "a\n"), ("c.txt", "c\n")]);
        let second = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.head_sha, second.head_sha);
        assert_ne!(first.start_sha, second.start_sha);
    }

    #[test]
    fn test_compare_shows_incremental_changes() {
        let f = setup();
        f.repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let first = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        f.repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n"), ("c.txt", "c\n")]);
        let second = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();

        let delta = f.store.compare(&first, &second).unwrap();
        assert_eq!(delta.paths(), vec!["c.txt"]);
        assert_eq!(delta.from_sha, first.head_sha);

        let from_head = f.store.compare_from_head(&second, &first.head_sha).unwrap();
        assert_eq!(from_head, delta);

        assert!(matches!(
            f.store.compare(&second, &first),
            Err(SnapshotError::InvalidSnapshotOrder(_))
        ));
        assert!(matches!(
            f.store.compare(&first, &first),
            Err(SnapshotError::InvalidSnapshotOrder(_))
        ));
        assert!(matches!(
            f.store.compare_from_head(&first, &second.head_sha),
            Err(SnapshotError::InvalidSnapshotOrder(_))
        ));
    }

    #[test]
    fn test_compare_rejects_other_change_request() {
        let f = setup();
        f.repo.commit("feature", &[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let other_id = open_change_request(&f.db, "other", "main").id;

        let mine = f.store.create_snapshot(f.cr_id, "feature", "main").unwrap();
        let mut theirs = f.store.create_snapshot(other_id, "feature", "main").unwrap();
        theirs.position = mine.position + 1;
        assert!(matches!(
            f.store.compare(&mine, &theirs),
            Err(SnapshotError::InvalidSnapshotOrder(_))
        ));
    }
}
