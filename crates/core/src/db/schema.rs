//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS change_requests (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            target_project    TEXT    NOT NULL,
            iid               INTEGER NOT NULL,
            source_project    TEXT    NOT NULL,
            source_branch     TEXT    NOT NULL,
            target_branch     TEXT    NOT NULL,
            title             TEXT    NOT NULL DEFAULT '',
            description       TEXT,
            state             TEXT    NOT NULL DEFAULT 'open'
                              CHECK (state IN ('open', 'closed', 'merged', 'locked')),
            head_sha          TEXT,
            merge_commit_sha  TEXT,
            merge_error       TEXT,
            work_in_progress  INTEGER NOT NULL DEFAULT 0,
            version           INTEGER NOT NULL DEFAULT 1,
            locked_at         TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            UNIQUE (target_project, iid)
        );

        CREATE INDEX IF NOT EXISTS idx_change_requests_source
            ON change_requests (source_project, source_branch);
        CREATE INDEX IF NOT EXISTS idx_change_requests_state ON change_requests (state);

        CREATE TABLE IF NOT EXISTS diff_snapshots (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            change_request_id  INTEGER NOT NULL
                               REFERENCES change_requests (id) ON DELETE CASCADE,
            position           INTEGER NOT NULL,
            head_sha           TEXT    NOT NULL,
            base_sha           TEXT    NOT NULL,
            start_sha          TEXT    NOT NULL,
            file_count         INTEGER NOT NULL DEFAULT 0,
            files              TEXT    NOT NULL DEFAULT '[]',
            created_at         TEXT    NOT NULL,
            UNIQUE (change_request_id, position),
            UNIQUE (change_request_id, head_sha, start_sha)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            action             TEXT NOT NULL,
            change_request_id  INTEGER,
            actor              TEXT,
            details            TEXT,
            success            INTEGER NOT NULL DEFAULT 1,
            created_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
    (
        2,
        "deferred merge intents and CI signals",
        r#"
        CREATE TABLE IF NOT EXISTS pending_merges (
            change_request_id     INTEGER PRIMARY KEY
                                  REFERENCES change_requests (id) ON DELETE CASCADE,
            actor                 TEXT    NOT NULL,
            merge_condition       TEXT    NOT NULL,
            expected_head_sha     TEXT    NOT NULL,
            remove_source_branch  INTEGER NOT NULL DEFAULT 0,
            commit_message        TEXT,
            requested_at          TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_merges_sha ON pending_merges (expected_head_sha);

        CREATE TABLE IF NOT EXISTS ci_statuses (
            sha           TEXT PRIMARY KEY,
            status        TEXT    NOT NULL,
            coverage      REAL,
            has_warnings  INTEGER NOT NULL DEFAULT 0,
            updated_at    TEXT    NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "change_requests",
            "diff_snapshots",
            "audit_log",
            "pending_merges",
            "ci_statuses",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_state_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO change_requests
                (target_project, iid, source_project, source_branch, target_branch,
                 state, created_at, updated_at)
             VALUES ('p', 1, 'p', 'f', 'main', 'merging', 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
