//! Fixtures shared by the unit tests: throwaway bare repositories and
//! in-memory databases.

use std::sync::{Arc, Mutex};

use git2::{Commit, Oid, Repository, Signature};
use tempfile::TempDir;

use crate::db::Database;
use crate::lifecycle::{ChangeRequestUpdate, LifecycleController};
use crate::models::{ChangeRequest, NewChangeRequest};
use crate::notify::{MergeEvent, NotificationSink};
use crate::vcs::GitRepository;

pub(crate) struct TestRepo {
    pub dir: TempDir,
    pub repo: Repository,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        Self { dir, repo }
    }

    pub fn git(&self) -> Arc<GitRepository> {
        Arc::new(GitRepository::open(self.dir.path(), "Bot", "bot@test.com").unwrap())
    }

    /// Commit a flat tree containing exactly `files` on top of `branch`
    /// (or as a root commit when the branch does not exist yet).
    pub fn commit(&self, branch: &str, files: &[(&str, &str)]) -> Oid {
        let parent = self.tip(branch);
        self.commit_with_parents(branch, parent.as_slice(), files)
    }

    pub fn commit_with_parents(&self, branch: &str, parents: &[Oid], files: &[(&str, &str)]) -> Oid {
        let mut builder = self.repo.treebuilder(None).unwrap();
        for (path, content) in files {
            let blob = self.repo.blob(content.as_bytes()).unwrap();
            builder.insert(*path, blob, 0o100644).unwrap();
        }
        let tree = self.repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let parents: Vec<Commit<'_>> = parents
            .iter()
            .map(|p| self.repo.find_commit(*p).unwrap())
            .collect();
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        let oid = self
            .repo
            .commit(None, &sig, &sig, "test commit", &tree, &parent_refs)
            .unwrap();
        self.repo
            .reference(&format!("refs/heads/{}", branch), oid, true, "test")
            .unwrap();
        oid
    }

    /// Point `branch` at the current tip of `from`.
    pub fn branch(&self, branch: &str, from: &str) -> Oid {
        let oid = self.tip(from).unwrap();
        self.repo
            .reference(&format!("refs/heads/{}", branch), oid, true, "test")
            .unwrap();
        oid
    }

    pub fn tip(&self, branch: &str) -> Option<Oid> {
        self.repo
            .find_reference(&format!("refs/heads/{}", branch))
            .ok()
            .and_then(|r| r.target())
    }
}

pub(crate) fn test_db() -> Arc<Database> {
    let db = Database::in_memory().unwrap();
    db.initialize().unwrap();
    Arc::new(db)
}

pub(crate) fn open_change_request(db: &Database, source: &str, target: &str) -> ChangeRequest {
    db.insert_change_request(
        &NewChangeRequest {
            target_project: "group/app".into(),
            source_project: "group/app".into(),
            source_branch: source.into(),
            target_branch: target.into(),
            title: format!("Merge {}", source),
            description: None,
        },
        false,
    )
    .unwrap()
}

/// Point the change request's head at `sha`, the way a push would.
pub(crate) fn set_head(db: &Arc<Database>, cr: &ChangeRequest, sha: &str) -> ChangeRequest {
    LifecycleController::new(db.clone())
        .update(
            cr,
            ChangeRequestUpdate {
                head_sha: Some(sha.to_string()),
                ..Default::default()
            },
        )
        .unwrap()
}

/// Notification sink that remembers what it was told.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub events: Mutex<Vec<(MergeEvent, i64)>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.name())
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: MergeEvent, change_request: &ChangeRequest) {
        self.events
            .lock()
            .unwrap()
            .push((event, change_request.id));
    }
}
