//! Idempotent per-day attendance log.

use crate::db::{Database, DbError};
use crate::types::AttendanceRecord;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a call to [`AttendanceLedger::mark`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MarkOutcome {
    /// First sighting of this identity today; the stored record.
    NewlyMarked(AttendanceRecord),
    /// A record for today already existed. Nothing was written.
    AlreadyMarked,
}

impl MarkOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, MarkOutcome::NewlyMarked(_))
    }
}

#[derive(Clone)]
pub struct AttendanceLedger {
    db: Arc<Database>,
}

impl AttendanceLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record attendance for `reg_no` on the calendar day of `now`.
    ///
    /// The existence check and the insert are one statement, so concurrent
    /// callers for the same identity and day see exactly one `NewlyMarked`.
    pub fn mark(&self, reg_no: &str, now: NaiveDateTime) -> Result<MarkOutcome, DbError> {
        if self.db.insert_attendance(reg_no, now)? {
            tracing::info!(reg_no, marked_at = %now, "attendance marked");
            let name = self.db.lookup(reg_no)?.map(|p| p.name);
            Ok(MarkOutcome::NewlyMarked(AttendanceRecord {
                reg_no: reg_no.to_string(),
                name,
                marked_at: now,
            }))
        } else {
            tracing::debug!(reg_no, "already marked today");
            Ok(MarkOutcome::AlreadyMarked)
        }
    }

    /// Newest records first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, DbError> {
        self.db.recent_attendance(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{at, identity};

    fn ledger_with(keys: &[&str]) -> AttendanceLedger {
        let db = Database::open_in_memory().unwrap();
        for key in keys {
            db.insert_identity(&identity(key, &[1.0]), at(1, 7, 0)).unwrap();
        }
        AttendanceLedger::new(Arc::new(db))
    }

    #[test]
    fn test_second_mark_same_day_is_noop() {
        let ledger = ledger_with(&["S001"]);

        let first = ledger.mark("S001", at(4, 9, 0)).unwrap();
        assert_eq!(
            first,
            MarkOutcome::NewlyMarked(AttendanceRecord {
                reg_no: "S001".into(),
                name: Some("Student S001".into()),
                marked_at: at(4, 9, 0),
            })
        );
        assert_eq!(ledger.mark("S001", at(4, 16, 45)).unwrap(), MarkOutcome::AlreadyMarked);

        let recent = ledger.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].marked_at, at(4, 9, 0));
    }

    #[test]
    fn test_new_day_marks_again() {
        let ledger = ledger_with(&["S001"]);
        assert!(ledger.mark("S001", at(4, 9, 0)).unwrap().is_new());
        assert!(ledger.mark("S001", at(5, 9, 0)).unwrap().is_new());
        assert_eq!(ledger.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_marks_record_once() {
        let ledger = ledger_with(&["S001"]);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.mark("S001", at(4, 9, i)).unwrap())
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_new()).count(), 1);
        assert_eq!(ledger.recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let ledger = ledger_with(&["S001", "S002", "S003"]);
        ledger.mark("S002", at(4, 9, 0)).unwrap();
        ledger.mark("S001", at(4, 10, 0)).unwrap();
        ledger.mark("S003", at(4, 8, 0)).unwrap();

        let recent = ledger.recent(2).unwrap();
        let keys: Vec<_> = recent.iter().map(|r| r.reg_no.as_str()).collect();
        assert_eq!(keys, ["S001", "S002"]);
        assert!(ledger.recent(0).unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_identity_is_rejected() {
        let ledger = ledger_with(&[]);
        let err = ledger.mark("ghost", at(4, 9, 0)).unwrap_err();
        assert!(matches!(err, DbError::UnknownIdentity(_)));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let json = serde_json::to_value(MarkOutcome::AlreadyMarked).unwrap();
        assert_eq!(json["status"], "already_marked");
    }
}
