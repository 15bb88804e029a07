//! Typed query helpers for every table in the mergeflow database.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    AuditEntry, ChangeRequest, CiSignal, CiStatus, DiffSnapshot, LifecycleState, MergeCondition,
    MergeIntent, NewChangeRequest,
};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub change_request_id: Option<i64>,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// Payload for a new diff snapshot row.
#[derive(Debug, Clone)]
pub struct NewDiffSnapshot<'a> {
    pub change_request_id: i64,
    pub head_sha: &'a str,
    pub base_sha: &'a str,
    pub start_sha: &'a str,
    pub file_count: i64,
    /// JSON-encoded `Vec<FileDiff>`.
    pub files_json: &'a str,
}

const CHANGE_REQUEST_COLUMNS: &str = "id, target_project, iid, source_project, source_branch,
    target_branch, title, description, state, head_sha, merge_commit_sha, merge_error,
    work_in_progress, version, locked_at, created_at, updated_at";

const SNAPSHOT_COLUMNS: &str =
    "id, change_request_id, position, head_sha, base_sha, start_sha, file_count, created_at";

const PENDING_MERGE_COLUMNS: &str = "change_request_id, actor, merge_condition,
    expected_head_sha, remove_source_branch, commit_message, requested_at";

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- change_requests ----------------------------------------------------

    /// Insert a new change request, allocating the next iid for its target
    /// project. The row starts `open` at version 1.
    pub fn insert_change_request(
        &self,
        new: &NewChangeRequest,
        work_in_progress: bool,
    ) -> Result<ChangeRequest, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let id = self.transaction(|conn| {
            let iid: i64 = conn.query_row(
                "SELECT COALESCE(MAX(iid), 0) + 1 FROM change_requests WHERE target_project = ?1",
                params![new.target_project],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO change_requests
                    (target_project, iid, source_project, source_branch, target_branch,
                     title, description, state, work_in_progress, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, 1, ?9, ?9)",
                params![
                    new.target_project,
                    iid,
                    new.source_project,
                    new.source_branch,
                    new.target_branch,
                    new.title,
                    new.description,
                    work_in_progress,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(id, project = %new.target_project, "inserted change request");
        self.get_change_request(id)
    }

    /// Load a change request by id.
    pub fn get_change_request(&self, id: i64) -> Result<ChangeRequest, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {CHANGE_REQUEST_COLUMNS} FROM change_requests WHERE id = ?1"),
            params![id],
            change_request_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                entity: "change_request".into(),
                id: id.to_string(),
            },
            other => other.into(),
        })
    }

    /// Look up a change request by its per-project sequence number.
    pub fn find_change_request_by_iid(
        &self,
        target_project: &str,
        iid: i64,
    ) -> Result<Option<ChangeRequest>, DatabaseError> {
        let conn = self.conn();
        let cr = conn
            .query_row(
                &format!(
                    "SELECT {CHANGE_REQUEST_COLUMNS} FROM change_requests
                     WHERE target_project = ?1 AND iid = ?2"
                ),
                params![target_project, iid],
                change_request_from_row,
            )
            .optional()?;
        Ok(cr)
    }

    /// Open change requests whose source is the given project branch.
    pub fn list_open_change_requests_for_source(
        &self,
        source_project: &str,
        source_branch: &str,
    ) -> Result<Vec<ChangeRequest>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_REQUEST_COLUMNS} FROM change_requests
             WHERE source_project = ?1 AND source_branch = ?2 AND state = 'open'
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![source_project, source_branch], change_request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Change requests currently in a given lifecycle state.
    pub fn list_change_requests_in_state(
        &self,
        state: LifecycleState,
    ) -> Result<Vec<ChangeRequest>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_REQUEST_COLUMNS} FROM change_requests WHERE state = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![state.to_string()], change_request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Write every mutable field of `next` if the stored version still equals
    /// `expected_version`, bumping the version by one.
    ///
    /// Returns `false` when the row was changed by someone else (or is gone).
    pub fn compare_and_swap_change_request(
        &self,
        next: &ChangeRequest,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE change_requests
             SET title = ?1, description = ?2, state = ?3, head_sha = ?4,
                 merge_commit_sha = ?5, merge_error = ?6, work_in_progress = ?7,
                 locked_at = ?8, updated_at = ?9, version = version + 1
             WHERE id = ?10 AND version = ?11",
            params![
                next.title,
                next.description,
                next.state.to_string(),
                next.head_sha,
                next.merge_commit_sha,
                next.merge_error,
                next.work_in_progress,
                next.locked_at.map(|t| t.to_rfc3339()),
                next.updated_at.to_rfc3339(),
                next.id,
                expected_version,
            ],
        )?;
        debug!(
            id = next.id,
            expected_version,
            applied = changed == 1,
            "compare-and-swap on change request"
        );
        Ok(changed == 1)
    }

    /// Current version token of a change request, if it exists.
    pub fn get_change_request_version(&self, id: i64) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn();
        let version = conn
            .query_row(
                "SELECT version FROM change_requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Delete a change request together with its snapshots and pending merge.
    pub fn delete_change_request(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM change_requests WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -- diff_snapshots -----------------------------------------------------

    /// Return the snapshot for `(change_request_id, head_sha, start_sha)`,
    /// inserting it at the next position if it does not exist yet.
    ///
    /// The lookup and the insert share one transaction, so racing callers
    /// cannot produce two snapshots for the same pair of heads.
    pub fn find_or_insert_diff_snapshot(
        &self,
        new: &NewDiffSnapshot<'_>,
    ) -> Result<(DiffSnapshot, bool), DatabaseError> {
        self.transaction(|conn| {
            if let Some(existing) =
                query_snapshot_by_heads(conn, new.change_request_id, new.head_sha, new.start_sha)?
            {
                return Ok((existing, false));
            }

            let position: i64 = conn.query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM diff_snapshots
                 WHERE change_request_id = ?1",
                params![new.change_request_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO diff_snapshots
                    (change_request_id, position, head_sha, base_sha, start_sha,
                     file_count, files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.change_request_id,
                    position,
                    new.head_sha,
                    new.base_sha,
                    new.start_sha,
                    new.file_count,
                    new.files_json,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id, change_request_id = new.change_request_id, position, "inserted diff snapshot");

            let created = conn.query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots WHERE id = ?1"),
                params![id],
                snapshot_from_row,
            )?;
            Ok((created, true))
        })
    }

    /// Look up the snapshot for a pair of heads.
    pub fn find_diff_snapshot(
        &self,
        change_request_id: i64,
        head_sha: &str,
        start_sha: &str,
    ) -> Result<Option<DiffSnapshot>, DatabaseError> {
        let conn = self.conn();
        query_snapshot_by_heads(&conn, change_request_id, head_sha, start_sha)
    }

    /// Load a snapshot by id.
    pub fn get_diff_snapshot(&self, id: i64) -> Result<DiffSnapshot, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots WHERE id = ?1"),
            params![id],
            snapshot_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                entity: "diff_snapshot".into(),
                id: id.to_string(),
            },
            other => other.into(),
        })
    }

    /// The most recently created snapshot of a change request.
    pub fn latest_diff_snapshot(
        &self,
        change_request_id: i64,
    ) -> Result<Option<DiffSnapshot>, DatabaseError> {
        let conn = self.conn();
        let snapshot = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots
                     WHERE change_request_id = ?1 ORDER BY position DESC LIMIT 1"
                ),
                params![change_request_id],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// All snapshots of a change request in creation order.
    pub fn list_diff_snapshots(
        &self,
        change_request_id: i64,
    ) -> Result<Vec<DiffSnapshot>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots
             WHERE change_request_id = ?1 ORDER BY position"
        ))?;
        let rows = stmt
            .query_map(params![change_request_id], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest snapshot of a change request with the given head that was
    /// created before `before_position`.
    pub fn find_earlier_diff_snapshot_by_head(
        &self,
        change_request_id: i64,
        head_sha: &str,
        before_position: i64,
    ) -> Result<Option<DiffSnapshot>, DatabaseError> {
        let conn = self.conn();
        let snapshot = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots
                     WHERE change_request_id = ?1 AND head_sha = ?2 AND position < ?3
                     ORDER BY position DESC LIMIT 1"
                ),
                params![change_request_id, head_sha, before_position],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// The JSON file payload of a snapshot.
    pub fn get_diff_snapshot_files(&self, id: i64) -> Result<String, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT files FROM diff_snapshots WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                entity: "diff_snapshot".into(),
                id: id.to_string(),
            },
            other => other.into(),
        })
    }

    // -- pending_merges -----------------------------------------------------

    /// Record (or replace) the deferred merge intent of a change request.
    pub fn upsert_pending_merge(&self, intent: &MergeIntent) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pending_merges
                (change_request_id, actor, merge_condition, expected_head_sha,
                 remove_source_branch, commit_message, requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(change_request_id) DO UPDATE SET
                actor = excluded.actor,
                merge_condition = excluded.merge_condition,
                expected_head_sha = excluded.expected_head_sha,
                remove_source_branch = excluded.remove_source_branch,
                commit_message = excluded.commit_message,
                requested_at = excluded.requested_at",
            params![
                intent.change_request_id,
                intent.actor,
                intent.condition.to_string(),
                intent.expected_head_sha,
                intent.remove_source_branch,
                intent.commit_message,
                intent.requested_at.to_rfc3339(),
            ],
        )?;
        debug!(
            change_request_id = intent.change_request_id,
            sha = %intent.expected_head_sha,
            "stored pending merge"
        );
        Ok(())
    }

    pub fn get_pending_merge(
        &self,
        change_request_id: i64,
    ) -> Result<Option<MergeIntent>, DatabaseError> {
        let conn = self.conn();
        let intent = conn
            .query_row(
                &format!(
                    "SELECT {PENDING_MERGE_COLUMNS} FROM pending_merges WHERE change_request_id = ?1"
                ),
                params![change_request_id],
                pending_merge_from_row,
            )
            .optional()?;
        Ok(intent)
    }

    /// Pending intents waiting on CI for the given head sha.
    pub fn list_pending_merges_for_sha(&self, sha: &str) -> Result<Vec<MergeIntent>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PENDING_MERGE_COLUMNS} FROM pending_merges
             WHERE expected_head_sha = ?1 ORDER BY change_request_id"
        ))?;
        let rows = stmt
            .query_map(params![sha], pending_merge_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_pending_merges(&self) -> Result<Vec<MergeIntent>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PENDING_MERGE_COLUMNS} FROM pending_merges ORDER BY change_request_id"
        ))?;
        let rows = stmt
            .query_map([], pending_merge_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove the pending intent only if it still tracks `expected_head_sha`.
    ///
    /// Returns `true` for exactly one caller when several race to consume the
    /// same intent.
    pub fn take_pending_merge(
        &self,
        change_request_id: i64,
        expected_head_sha: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM pending_merges WHERE change_request_id = ?1 AND expected_head_sha = ?2",
            params![change_request_id, expected_head_sha],
        )?;
        Ok(removed == 1)
    }

    /// Remove the pending intent regardless of its head. Returns whether one
    /// existed.
    pub fn delete_pending_merge(&self, change_request_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM pending_merges WHERE change_request_id = ?1",
            params![change_request_id],
        )?;
        Ok(removed == 1)
    }

    // -- ci_statuses --------------------------------------------------------

    /// Store the latest CI result for a commit.
    pub fn upsert_ci_status(&self, signal: &CiSignal) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO ci_statuses (sha, status, coverage, has_warnings, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sha) DO UPDATE SET
                status = excluded.status,
                coverage = excluded.coverage,
                has_warnings = excluded.has_warnings,
                updated_at = excluded.updated_at",
            params![
                signal.sha,
                signal.status.to_string(),
                signal.coverage,
                signal.has_warnings,
                now
            ],
        )?;
        debug!(sha = %signal.sha, status = %signal.status, "stored CI status");
        Ok(())
    }

    pub fn get_ci_status(&self, sha: &str) -> Result<Option<CiSignal>, DatabaseError> {
        let conn = self.conn();
        let row: Option<(String, String, Option<f64>, bool)> = conn
            .query_row(
                "SELECT sha, status, coverage, has_warnings FROM ci_statuses WHERE sha = ?1",
                params![sha],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(sha, status, coverage, has_warnings)| {
            let status = CiStatus::from_str_val(&status).ok_or_else(|| DatabaseError::Corrupt {
                entity: "ci_status".into(),
                detail: format!("unknown status '{}' for {}", status, sha),
            })?;
            Ok(CiSignal {
                sha,
                status,
                coverage,
                has_warnings,
            })
        })
        .transpose()
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit log entry.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, change_request_id, actor, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.action,
                entry.change_request_id,
                entry.actor,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// Most recent audit entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, change_request_id, actor, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Audit entries of one change request, newest first.
    pub fn list_audit_log_for_change_request(
        &self,
        change_request_id: i64,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, change_request_id, actor, details, success, created_at
             FROM audit_log WHERE change_request_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![change_request_id, limit], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn change_request_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeRequest> {
    let state: String = row.get(8)?;
    let state = LifecycleState::from_str_val(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown lifecycle state '{}'", state).into(),
        )
    })?;
    let locked_at: Option<String> = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    Ok(ChangeRequest {
        id: row.get(0)?,
        target_project: row.get(1)?,
        iid: row.get(2)?,
        source_project: row.get(3)?,
        source_branch: row.get(4)?,
        target_branch: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        state,
        head_sha: row.get(9)?,
        merge_commit_sha: row.get(10)?,
        merge_error: row.get(11)?,
        work_in_progress: row.get(12)?,
        version: row.get(13)?,
        locked_at: locked_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<DiffSnapshot> {
    let created_at: String = row.get(7)?;
    Ok(DiffSnapshot {
        id: row.get(0)?,
        change_request_id: row.get(1)?,
        position: row.get(2)?,
        head_sha: row.get(3)?,
        base_sha: row.get(4)?,
        start_sha: row.get(5)?,
        file_count: row.get(6)?,
        created_at: parse_datetime(&created_at),
    })
}

fn pending_merge_from_row(row: &Row<'_>) -> rusqlite::Result<MergeIntent> {
    let condition: String = row.get(2)?;
    let condition = MergeCondition::from_str_val(&condition).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown merge condition '{}'", condition).into(),
        )
    })?;
    let requested_at: String = row.get(6)?;
    Ok(MergeIntent {
        change_request_id: row.get(0)?,
        actor: row.get(1)?,
        condition,
        expected_head_sha: row.get(3)?,
        remove_source_branch: row.get(4)?,
        commit_message: row.get(5)?,
        requested_at: parse_datetime(&requested_at),
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        change_request_id: row.get(2)?,
        actor: row.get(3)?,
        details: row.get(4)?,
        success: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn query_snapshot_by_heads(
    conn: &Connection,
    change_request_id: i64,
    head_sha: &str,
    start_sha: &str,
) -> Result<Option<DiffSnapshot>, DatabaseError> {
    let snapshot = conn
        .query_row(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM diff_snapshots
                 WHERE change_request_id = ?1 AND head_sha = ?2 AND start_sha = ?3"
            ),
            params![change_request_id, head_sha, start_sha],
            snapshot_from_row,
        )
        .optional()?;
    Ok(snapshot)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
