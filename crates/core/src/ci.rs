//! CI signal source.
//!
//! Pipelines report their status through the webhook API; the latest signal
//! per commit is kept in the `ci_statuses` table and read back from there.

use std::sync::Arc;

use tracing::info;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::CiSignal;

/// Where the orchestrator reads CI results from.
pub trait CiSignalSource: Send + Sync {
    /// Latest signal for `sha`, or `None` when no pipeline has reported.
    fn latest_status(&self, sha: &str) -> Result<Option<CiSignal>, DatabaseError>;

    /// Coverage percentage reported for `sha`.
    fn coverage(&self, sha: &str) -> Result<Option<f64>, DatabaseError> {
        Ok(self.latest_status(sha)?.and_then(|s| s.coverage))
    }
}

/// CI signals persisted in the database.
pub struct StoredCiSignals {
    db: Arc<Database>,
}

impl StoredCiSignals {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a signal, replacing any earlier one for the same sha.
    pub fn record(&self, signal: &CiSignal) -> Result<(), DatabaseError> {
        self.db.upsert_ci_status(signal)?;
        info!(sha = %signal.sha, status = %signal.status, "recorded CI status");
        Ok(())
    }
}

impl CiSignalSource for StoredCiSignals {
    fn latest_status(&self, sha: &str) -> Result<Option<CiSignal>, DatabaseError> {
        self.db.get_ci_status(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CiStatus;
    use crate::test_support::test_db;

    #[test]
    fn test_record_replaces_previous_signal() {
        let ci = StoredCiSignals::new(test_db());
        assert!(ci.latest_status("abc").unwrap().is_none());
        assert!(ci.coverage("abc").unwrap().is_none());

        ci.record(&CiSignal {
            sha: "abc".into(),
            status: CiStatus::Running,
            coverage: None,
            has_warnings: false,
        })
        .unwrap();
        ci.record(&CiSignal {
            sha: "abc".into(),
            status: CiStatus::Success,
            coverage: Some(87.5),
            has_warnings: true,
        })
        .unwrap();

        let latest = ci.latest_status("abc").unwrap().unwrap();
        assert_eq!(latest.status, CiStatus::Success);
        assert!(latest.has_warnings);
        assert_eq!(ci.coverage("abc").unwrap(), Some(87.5));
    }
}
