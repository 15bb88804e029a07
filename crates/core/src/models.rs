//! Domain model types used throughout mergeflow.
//!
//! These types bridge the orchestration layer, the database layer, and the
//! webhook API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Change request
// ---------------------------------------------------------------------------

/// Coarse lifecycle state of a change request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Open,
    Closed,
    Merged,
    /// Held by a merge worker while the integration runs.
    Locked,
}

impl LifecycleState {
    /// Parse a state string as stored in the database.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "merged" => Some(Self::Merged),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
            Self::Locked => write!(f, "locked"),
        }
    }
}

/// A proposed integration of a source branch into a target branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRequest {
    pub id: i64,
    /// Project that owns the target branch.
    pub target_project: String,
    /// Sequence number visible to users, unique per target project.
    pub iid: i64,
    pub source_project: String,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: Option<String>,
    pub state: LifecycleState,
    /// Current source head; `None` until first computed.
    pub head_sha: Option<String>,
    pub merge_commit_sha: Option<String>,
    /// Reason for the last failed merge, if any.
    pub merge_error: Option<String>,
    pub work_in_progress: bool,
    /// Optimistic-concurrency token, incremented on every write.
    pub version: i64,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Title prefixes that mark a change request as work in progress.
const WIP_PREFIXES: &[&str] = &["WIP:", "[WIP]"];

impl ChangeRequest {
    /// Human-readable reference such as `group/app!42`.
    pub fn reference(&self) -> String {
        format!("{}!{}", self.target_project, self.iid)
    }

    pub fn is_open(&self) -> bool {
        self.state == LifecycleState::Open
    }

    /// Whether the title marks the change as work in progress.
    pub fn title_is_wip(title: &str) -> bool {
        let trimmed = title.trim_start();
        WIP_PREFIXES
            .iter()
            .any(|p| has_prefix_ignore_case(trimmed, p))
    }

    /// The title with any work-in-progress prefix removed.
    pub fn wipless_title(&self) -> String {
        let mut title = self.title.trim_start();
        loop {
            let stripped = WIP_PREFIXES
                .iter()
                .find(|p| has_prefix_ignore_case(title, p))
                .map(|p| title[p.len()..].trim_start());
            match stripped {
                Some(rest) => title = rest,
                None => break,
            }
        }
        title.to_string()
    }
}

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Fields supplied when opening a new change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChangeRequest {
    pub target_project: String,
    pub source_project: String,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Diffs
// ---------------------------------------------------------------------------

/// Kind of change applied to a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
    TypeChanged,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Deleted => write!(f, "deleted"),
            Self::Modified => write!(f, "modified"),
            Self::Renamed => write!(f, "renamed"),
            Self::Copied => write!(f, "copied"),
            Self::TypeChanged => write!(f, "type_changed"),
        }
    }
}

/// Origin of a single diff line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineOrigin {
    Context,
    Addition,
    Deletion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffLine {
    pub origin: LineOrigin,
    pub content: String,
    pub old_lineno: Option<u32>,
    pub new_lineno: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffHunk {
    /// The `@@ -a,b +c,d @@` header line.
    pub header: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<DiffLine>,
}

/// Line-level diff of one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    /// Previous path for renames and copies.
    pub old_path: Option<String>,
    pub change_kind: ChangeKind,
    /// Binary files carry no hunks.
    pub binary: bool,
    pub hunks: Vec<DiffHunk>,
}

impl FileDiff {
    pub fn additions(&self) -> usize {
        self.count(LineOrigin::Addition)
    }

    pub fn deletions(&self) -> usize {
        self.count(LineOrigin::Deletion)
    }

    fn count(&self, origin: LineOrigin) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| l.origin == origin)
            .count()
    }
}

/// A file/line diff between two commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSet {
    pub from_sha: String,
    pub to_sha: String,
    pub files: Vec<FileDiff>,
}

impl DiffSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Immutable record of a change request's diff at one revision.
///
/// File diffs are stored separately and loaded on demand through
/// `DiffSnapshotStore::files`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffSnapshot {
    pub id: i64,
    pub change_request_id: i64,
    /// 1-based creation order within the change request.
    pub position: i64,
    /// Source head at snapshot time.
    pub head_sha: String,
    /// Merge base of source and target.
    pub base_sha: String,
    /// Target head at snapshot time.
    pub start_sha: String,
    pub file_count: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CI signals
// ---------------------------------------------------------------------------

/// Status reported by the CI system for one commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl CiStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Pending or running: the result is not known yet.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Latest CI result for a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiSignal {
    pub sha: String,
    pub status: CiStatus,
    pub coverage: Option<f64>,
    pub has_warnings: bool,
}

// ---------------------------------------------------------------------------
// Merge intents
// ---------------------------------------------------------------------------

/// When a requested merge may run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeCondition {
    Immediate,
    /// Park until CI reports success for the requested head.
    WhenCiSucceeds,
}

impl MergeCondition {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(Self::Immediate),
            "when_ci_succeeds" => Some(Self::WhenCiSucceeds),
            _ => None,
        }
    }
}

impl std::fmt::Display for MergeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::WhenCiSucceeds => write!(f, "when_ci_succeeds"),
        }
    }
}

/// "Actor requested a merge under condition C at head H."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeIntent {
    pub change_request_id: i64,
    pub actor: String,
    pub condition: MergeCondition,
    pub expected_head_sha: String,
    pub remove_source_branch: bool,
    pub commit_message: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl MergeIntent {
    pub fn new(
        change_request_id: i64,
        actor: impl Into<String>,
        condition: MergeCondition,
        expected_head_sha: impl Into<String>,
    ) -> Self {
        Self {
            change_request_id,
            actor: actor.into(),
            condition,
            expected_head_sha: expected_head_sha.into(),
            remove_source_branch: false,
            commit_message: None,
            requested_at: Utc::now(),
        }
    }

    pub fn remove_source_branch(mut self, remove: bool) -> Self {
        self.remove_source_branch = remove;
        self
    }

    pub fn commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub change_request_id: Option<i64>,
    pub actor: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            change_request_id: None,
            actor: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            success: false,
            ..Self::success(action, details)
        }
    }

    pub fn for_change_request(mut self, id: i64) -> Self {
        self.change_request_id = Some(id);
        self
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }
}
