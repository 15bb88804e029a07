//! Error types for the mergeflow core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Mergeability decisions (sha mismatch, waiting on CI, ...) are *not*
//! errors: they are values returned by the evaluator and orchestrator. The
//! types here cover failed operations and infrastructure problems.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

// ---------------------------------------------------------------------------
// Version-control errors
// ---------------------------------------------------------------------------

/// Errors from the version-control collaborator (git2).
#[derive(Debug, Error)]
pub enum VcsError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The two commits share no history.
    #[error("no merge base between {0} and {1}")]
    NoMergeBase(String, String),

    /// A merge index still had conflicts when a tree was about to be written.
    #[error("merge still has unresolved paths: {}", .0.join(", "))]
    UnresolvedPaths(Vec<String>),

    /// An object id was malformed or pointed at the wrong kind of object.
    #[error("invalid git object '{id}': {detail}")]
    InvalidObject {
        id: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Diff snapshot errors
// ---------------------------------------------------------------------------

/// Errors from the diff snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The source or target ref does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Source and target resolve to identical content.
    #[error("empty diff between '{source_ref}' and '{target_ref}'")]
    EmptyDiff {
        source_ref: String,
        target_ref: String,
    },

    /// The two snapshots cannot be compared in the requested order.
    #[error("invalid snapshot order: {0}")]
    InvalidSnapshotOrder(String),

    /// The change request has no snapshots yet.
    #[error("change request {0} has no diff snapshots")]
    NoSnapshots(i64),

    /// A stored file payload could not be (de)serialized.
    #[error("snapshot payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Underlying version-control error.
    #[error("snapshot vcs error: {0}")]
    VcsError(#[from] VcsError),

    /// Database error when persisting snapshots.
    #[error("snapshot database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict detection / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// A conflicting file cannot be resolved in place.
    #[error("conflict in '{path}' cannot be resolved in place: {reason}")]
    UnresolvableInUi {
        path: String,
        reason: String,
    },

    /// A conflicting file was left without a resolution.
    #[error("missing resolution for '{0}'")]
    MissingResolution(String),

    /// The provided resolution content is invalid.
    #[error("invalid resolution for '{path}': {detail}")]
    InvalidResolution {
        path: String,
        detail: String,
    },

    /// A branch moved after the conflict set was computed.
    #[error("conflict set is stale: '{branch}' moved from {expected} to {actual}")]
    StaleConflictSet {
        branch: String,
        expected: String,
        actual: String,
    },

    /// There is nothing left to resolve.
    #[error("conflicts are already resolved")]
    AlreadyResolved,

    /// The source or target ref does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Underlying version-control error.
    #[error("conflict vcs error: {0}")]
    VcsError(#[from] VcsError),
}

// ---------------------------------------------------------------------------
// Lifecycle errors
// ---------------------------------------------------------------------------

/// Errors from lifecycle transitions and compare-and-swap updates.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The caller's version token no longer matches the stored one.
    #[error("stale version for change request {id}: expected {expected}, found {actual}")]
    StaleVersion {
        id: i64,
        expected: i64,
        actual: i64,
    },

    /// The event is not allowed from the current state.
    #[error("invalid lifecycle transition from {from} on {event}")]
    InvalidTransition {
        from: String,
        event: String,
    },

    /// Database error when persisting the change request.
    #[error("lifecycle database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Orchestrator errors
// ---------------------------------------------------------------------------

/// Hard failures of the merge orchestrator.
///
/// Blocked or deferred merges are reported through `MergeReport`, never
/// through this type.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The merge queue has shut down.
    #[error("merge queue closed, cannot dispatch change request {0}")]
    QueueClosed(i64),

    /// Authorization denied.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Lifecycle error while driving a merge.
    #[error("orchestrator lifecycle error: {0}")]
    LifecycleError(#[from] LifecycleError),

    /// Conflict check failed.
    #[error("orchestrator conflict error: {0}")]
    ConflictError(#[from] ConflictError),

    /// Underlying version-control error.
    #[error("orchestrator vcs error: {0}")]
    VcsError(#[from] VcsError),

    /// Database error.
    #[error("orchestrator database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Authorization errors
// ---------------------------------------------------------------------------

/// Returned when the authorizer denies an action.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("actor '{actor}' may not {action} change request {change_request_id}")]
    Forbidden {
        actor: String,
        action: String,
        change_request_id: i64,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt {
        entity: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the notification subsystem (Slack, email).
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Slack webhook delivery failed.
    #[error("Slack notification failed: {0}")]
    SlackError(String),

    /// Email delivery failed.
    #[error("email notification failed: {0}")]
    EmailError(String),

    /// HTTP error during notification delivery.
    #[error("notification HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// All notification channels failed.
    #[error("all notification channels failed: {0}")]
    AllChannelsFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = VcsError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = ConflictError::MissingResolution("b.txt".into());
        assert_eq!(err.to_string(), "missing resolution for 'b.txt'");

        let err = LifecycleError::StaleVersion {
            id: 7,
            expected: 3,
            actual: 4,
        };
        assert!(err.to_string().contains("expected 3, found 4"));

        let err = ConfigError::EnvVarMissing {
            var: "MERGEFLOW_WEBHOOK_SECRET".into(),
            field: "webhook.secret_env".into(),
        };
        assert!(err.to_string().contains("MERGEFLOW_WEBHOOK_SECRET"));

        let err = AccessError::Forbidden {
            actor: "mallory".into(),
            action: "merge".into(),
            change_request_id: 12,
        };
        assert_eq!(
            err.to_string(),
            "actor 'mallory' may not merge change request 12"
        );
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let snap_err = SnapshotError::NoSnapshots(1);
        let core_err: CoreError = snap_err.into();
        assert!(matches!(core_err, CoreError::Snapshot(_)));

        let db_err = DatabaseError::NotFound {
            entity: "change_request".into(),
            id: "abc".into(),
        };
        let lifecycle_err: LifecycleError = db_err.into();
        let core_err: CoreError = lifecycle_err.into();
        assert!(matches!(
            core_err,
            CoreError::Lifecycle(LifecycleError::DatabaseError(_))
        ));
    }

    #[test]
    fn test_forbidden_is_transparent_through_orchestrator() {
        let err: OrchestratorError = AccessError::Forbidden {
            actor: "bob".into(),
            action: "cancel_merge".into(),
            change_request_id: 3,
        }
        .into();
        assert!(err.to_string().starts_with("actor 'bob'"));
    }
}
