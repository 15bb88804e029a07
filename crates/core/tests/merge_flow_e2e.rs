//! End-to-end tests for merge orchestration.
//!
//! These tests wire the components the way the daemon does:
//! - A real bare Git repository built with `git2` in a temp dir
//! - A real SQLite database file
//! - The merge worker pool on the tokio runtime
//! - The notification queue, drained by the test
//!
//! No network I/O.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, Notify};

use mergeflow_core::authz::ConfiguredAuthorizer;
use mergeflow_core::ci::StoredCiSignals;
use mergeflow_core::config::{AccessConfig, MergeConfig};
use mergeflow_core::conflict::{Detection, FileResolution};
use mergeflow_core::db::Database;
use mergeflow_core::errors::{ConflictError, CoreError};
use mergeflow_core::models::{
    CiSignal, CiStatus, LifecycleState, MergeCondition, MergeIntent, NewChangeRequest,
};
use mergeflow_core::notify::{Notification, NotificationQueue};
use mergeflow_core::orchestrator::{
    CancelReason, MergeJob, MergeOrchestrator, MergeOutcome, MergeQueue, MergeReport,
    MergeWorkerPool,
};
use mergeflow_core::service::ChangeRequestService;
use mergeflow_core::vcs::GitRepository;

// ===========================================================================
// Helpers
// ===========================================================================

fn tip(repo: &Repository, branch: &str) -> Option<Oid> {
    repo.find_reference(&format!("refs/heads/{}", branch))
        .ok()
        .and_then(|r| r.target())
}

/// Commit a flat tree with exactly `files` on top of `branch`.
fn commit(repo: &Repository, branch: &str, files: &[(&str, &str)]) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    for (path, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert(*path, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::now("Dev", "dev@example.com").unwrap();
    let parent = tip(repo, branch).map(|oid| repo.find_commit(oid).unwrap());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(None, &sig, &sig, "change", &tree, &parents)
        .unwrap();
    repo.reference(&format!("refs/heads/{}", branch), oid, true, "test")
        .unwrap();
    oid
}

fn branch(repo: &Repository, name: &str, from: &str) {
    let oid = tip(repo, from).unwrap();
    repo.reference(&format!("refs/heads/{}", name), oid, true, "test")
        .unwrap();
}

fn setup_db(path: &Path) -> Arc<Database> {
    let db = Database::new(path.join("mergeflow.db")).expect("failed to open database");
    db.initialize().expect("failed to initialize schema");
    Arc::new(db)
}

struct Stack {
    service: Arc<ChangeRequestService>,
    orchestrator: Arc<MergeOrchestrator>,
    jobs: Option<mpsc::UnboundedReceiver<MergeJob>>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

fn build_stack(db: Arc<Database>, repo_path: &Path) -> Stack {
    let git = Arc::new(GitRepository::open(repo_path, "mergeflow", "bot@example.com").unwrap());
    let ci = Arc::new(StoredCiSignals::new(db.clone()));
    let authz = Arc::new(ConfiguredAuthorizer::from_config(&AccessConfig::default()));
    let (queue_sink, notifications) = NotificationQueue::new();
    let sink = Arc::new(queue_sink);
    let (queue, jobs) = MergeQueue::new();
    let orchestrator = Arc::new(MergeOrchestrator::new(
        db.clone(),
        git.clone(),
        ci.clone(),
        authz.clone(),
        sink.clone(),
        queue,
        MergeConfig::default(),
    ));
    let service = Arc::new(ChangeRequestService::new(
        db,
        git,
        ci,
        authz,
        sink,
        orchestrator.clone(),
    ));
    Stack {
        service,
        orchestrator,
        jobs: Some(jobs),
        notifications,
    }
}

fn new_cr(source: &str) -> NewChangeRequest {
    NewChangeRequest {
        target_project: "group/app".into(),
        source_project: "group/app".into(),
        source_branch: source.into(),
        target_branch: "main".into(),
        title: format!("Merge {}", source),
        description: None,
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

async fn next_report(rx: &mut broadcast::Receiver<MergeReport>) -> MergeReport {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a merge report")
        .expect("report channel closed")
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(n) = rx.try_recv() {
        names.push(n.event.name());
    }
    names
}

/// main has a.txt; feature adds b.txt.
fn fixture() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init_bare(dir.path().join("repo.git")).unwrap();
    commit(&repo, "main", &[("a.txt", "one\ntwo\nthree\n")]);
    branch(&repo, "feature", "main");
    commit(
        &repo,
        "feature",
        &[("a.txt", "one\ntwo\nthree\n"), ("b.txt", "b\n")],
    );
    (dir, repo)
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_clean_merge_through_worker_pool() {
    let (dir, repo) = fixture();
    let db = setup_db(dir.path());
    let mut stack = build_stack(db, &dir.path().join("repo.git"));

    let (reports_tx, mut reports) = broadcast::channel(16);
    let shutdown = Arc::new(Notify::new());
    let pool = MergeWorkerPool::spawn(
        stack.orchestrator.clone(),
        stack.jobs.take().unwrap(),
        2,
        reports_tx,
        shutdown.clone(),
    );

    let cr = stack.service.open("alice", new_cr("feature")).unwrap();
    let head = cr.head_sha.clone().unwrap();
    let main_before = tip(&repo, "main").unwrap();

    let scheduled = stack
        .orchestrator
        .request_merge(MergeIntent::new(cr.id, "alice", MergeCondition::Immediate, &head))
        .unwrap();
    assert_eq!(scheduled.outcome, MergeOutcome::Scheduled);

    let report = next_report(&mut reports).await;
    let sha = match report.outcome {
        MergeOutcome::Completed { merge_commit_sha } => merge_commit_sha,
        other => panic!("expected completion, got {other:?}"),
    };

    let merged = stack.service.get(cr.id).unwrap();
    assert_eq!(merged.state, LifecycleState::Merged);
    assert_eq!(tip(&repo, "main").unwrap().to_string(), sha);
    let commit = repo.find_commit(Oid::from_str(&sha).unwrap()).unwrap();
    assert_eq!(commit.parent_id(0).unwrap(), main_before);
    assert_eq!(commit.parent_id(1).unwrap().to_string(), head);

    assert_eq!(
        drain_events(&mut stack.notifications),
        vec!["merge_scheduled", "merge_completed"]
    );

    shutdown.notify_waiters();
    pool.join().await;
}

#[tokio::test]
async fn test_merge_when_ci_succeeds() {
    let (dir, repo) = fixture();
    let db = setup_db(dir.path());
    let mut stack = build_stack(db, &dir.path().join("repo.git"));

    let (reports_tx, mut reports) = broadcast::channel(16);
    let shutdown = Arc::new(Notify::new());
    let pool = MergeWorkerPool::spawn(
        stack.orchestrator.clone(),
        stack.jobs.take().unwrap(),
        1,
        reports_tx,
        shutdown.clone(),
    );

    let cr = stack.service.open("alice", new_cr("feature")).unwrap();
    let head = cr.head_sha.clone().unwrap();
    stack.service.record_ci(&signal(&head, CiStatus::Running)).unwrap();

    let deferred = stack
        .orchestrator
        .request_merge(MergeIntent::new(
            cr.id,
            "alice",
            MergeCondition::WhenCiSucceeds,
            &head,
        ))
        .unwrap();
    assert_eq!(deferred.outcome, MergeOutcome::Deferred);
    assert_eq!(stack.service.get(cr.id).unwrap().state, LifecycleState::Open);

    let rechecked = stack
        .service
        .record_ci(&signal(&head, CiStatus::Success))
        .unwrap();
    assert_eq!(rechecked[0].outcome, MergeOutcome::Scheduled);

    let report = next_report(&mut reports).await;
    let sha = match report.outcome {
        MergeOutcome::Completed { merge_commit_sha } => merge_commit_sha,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(stack.service.get(cr.id).unwrap().state, LifecycleState::Merged);
    assert_eq!(tip(&repo, "main").unwrap().to_string(), sha);

    shutdown.notify_waiters();
    pool.join().await;
}

#[tokio::test]
async fn test_push_cancels_deferred_merge() {
    let (dir, repo) = fixture();
    let db = setup_db(dir.path());
    let mut stack = build_stack(db, &dir.path().join("repo.git"));

    let cr = stack.service.open("alice", new_cr("feature")).unwrap();
    let s1 = cr.head_sha.clone().unwrap();
    stack.service.record_ci(&signal(&s1, CiStatus::Pending)).unwrap();
    stack
        .orchestrator
        .request_merge(MergeIntent::new(cr.id, "alice", MergeCondition::WhenCiSucceeds, &s1))
        .unwrap();

    let s2 = commit(
        &repo,
        "feature",
        &[("a.txt", "one\ntwo\nthree\n"), ("b.txt", "b, reworked\n")],
    )
    .to_string();
    let outcomes = stack.service.handle_push("group/app", "feature").unwrap();
    let report = outcomes[0].merge_report.clone().expect("deferred merge cancelled");
    assert_eq!(
        report.outcome,
        MergeOutcome::Cancelled {
            reason: CancelReason::HeadMoved {
                tracked_sha: s1.clone(),
                current_sha: Some(s2.clone()),
            }
        }
    );

    // The old head going green no longer merges anything.
    let late = stack.service.record_ci(&signal(&s1, CiStatus::Success)).unwrap();
    assert!(late.is_empty());
    let jobs = stack.jobs.as_mut().unwrap();
    assert!(jobs.try_recv().is_err());

    let cr = stack.service.get(cr.id).unwrap();
    assert_eq!(cr.state, LifecycleState::Open);
    assert_eq!(cr.head_sha.as_deref(), Some(s2.as_str()));
    assert_eq!(stack.service.versions(cr.id).unwrap().len(), 2);
    assert_eq!(
        drain_events(&mut stack.notifications),
        vec!["merge_deferred", "merge_cancelled"]
    );
}

#[tokio::test]
async fn test_missing_resolution_writes_nothing() {
    let (dir, repo) = fixture();
    commit(
        &repo,
        "main",
        &[("a.txt", "one\nTWO\nthree\n"), ("b.txt", "main b\n")],
    );
    let source_before = commit(
        &repo,
        "feature",
        &[("a.txt", "one\n2\nthree\n"), ("b.txt", "feature b\n")],
    );
    let db = setup_db(dir.path());
    let stack = build_stack(db, &dir.path().join("repo.git"));
    let cr = stack.service.open("alice", new_cr("feature")).unwrap();

    let set = match stack.service.conflicts(cr.id).unwrap() {
        Detection::Conflicts(set) => set,
        Detection::Clean => panic!("expected conflicts"),
    };
    assert_eq!(set.paths(), vec!["a.txt", "b.txt"]);

    let mut resolutions = BTreeMap::new();
    resolutions.insert("a.txt".to_string(), FileResolution::KeepOurs);
    let err = stack
        .service
        .resolve_conflicts("alice", cr.id, &resolutions)
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(ConflictError::MissingResolution(ref path)) if path == "b.txt"
    ));
    assert_eq!(tip(&repo, "feature").unwrap(), source_before);

    resolutions.insert("b.txt".to_string(), FileResolution::KeepTheirs);
    let resolved = stack
        .service
        .resolve_conflicts("alice", cr.id, &resolutions)
        .unwrap();
    assert_eq!(tip(&repo, "feature").unwrap().to_string(), resolved.commit_sha);
    assert!(matches!(stack.service.conflicts(cr.id).unwrap(), Detection::Clean));
}

#[tokio::test]
async fn test_deferred_merge_survives_restart() {
    let (dir, _repo) = fixture();
    let repo_path = dir.path().join("repo.git");

    let (cr_id, head) = {
        let stack = build_stack(setup_db(dir.path()), &repo_path);
        let cr = stack.service.open("alice", new_cr("feature")).unwrap();
        let head = cr.head_sha.clone().unwrap();
        stack.service.record_ci(&signal(&head, CiStatus::Running)).unwrap();
        stack
            .orchestrator
            .request_merge(MergeIntent::new(
                cr.id,
                "alice",
                MergeCondition::WhenCiSucceeds,
                &head,
            ))
            .unwrap();
        (cr.id, head)
    };

    // CI finished while the daemon was down.
    let db = setup_db(dir.path());
    db.upsert_ci_status(&signal(&head, CiStatus::Success)).unwrap();

    let mut stack = build_stack(db, &repo_path);
    let reports = stack.orchestrator.recheck_pending().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].change_request_id, cr_id);
    assert_eq!(reports[0].outcome, MergeOutcome::Scheduled);

    let job = stack.jobs.as_mut().unwrap().try_recv().unwrap();
    let report = stack.orchestrator.execute(&job).unwrap();
    assert!(matches!(report.outcome, MergeOutcome::Completed { .. }));
}
