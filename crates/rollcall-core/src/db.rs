//! SQLite persistence for identities and attendance.
//!
//! One connection behind a mutex. Uniqueness is enforced by the schema:
//! `identities.reg_no` is the primary key and attendance is
//! `UNIQUE(reg_no, day)`, so concurrent writers cannot both win.

use crate::error::{ErrorKind, Failure};
use crate::types::{AttendanceRecord, Fingerprint, Identity, Profile};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const DAY_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    reg_no        TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    cohort        TEXT NOT NULL DEFAULT '',
    phone         TEXT NOT NULL DEFAULT '',
    fingerprint   BLOB,
    registered_at TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS attendance (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    reg_no    TEXT NOT NULL REFERENCES identities (reg_no),
    day       TEXT NOT NULL,
    marked_at TEXT NOT NULL,
    UNIQUE (reg_no, day)
);
CREATE INDEX IF NOT EXISTS attendance_marked_at ON attendance (marked_at);
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("identity {0} is already registered")]
    Duplicate(String),
    #[error("identity {0} is not registered")]
    UnknownIdentity(String),
    #[error("corrupt row for {reg_no}: {reason}")]
    Corrupt { reg_no: String, reason: String },
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Duplicate(_) => ErrorKind::DuplicateIdentity,
            DbError::UnknownIdentity(_) => ErrorKind::UnknownIdentity,
            _ => ErrorKind::PersistenceFailure,
        }
    }
}

impl From<DbError> for Failure {
    fn from(e: DbError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive access to the connection. All writers go through here.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every identity that has a stored fingerprint.
    pub fn load_identities(&self) -> Result<Vec<Identity>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT reg_no, name, COALESCE(cohort, ''), COALESCE(phone, ''), fingerprint
             FROM identities ORDER BY reg_no",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                Profile {
                    reg_no: row.get(0)?,
                    name: row.get(1)?,
                    cohort: row.get(2)?,
                    phone: row.get(3)?,
                },
                row.get::<_, Option<Vec<u8>>>(4)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (profile, blob) = row?;
            let Some(blob) = blob else {
                tracing::warn!(reg_no = %profile.reg_no, "identity has no stored fingerprint; skipping");
                continue;
            };
            let fingerprint = Fingerprint::from_le_bytes(&blob).ok_or_else(|| DbError::Corrupt {
                reg_no: profile.reg_no.clone(),
                reason: format!("fingerprint blob of {} bytes", blob.len()),
            })?;
            identities.push(Identity {
                profile,
                fingerprint,
            });
        }
        Ok(identities)
    }

    /// Display attributes of one identity.
    pub fn lookup(&self, reg_no: &str) -> Result<Option<Profile>, DbError> {
        lookup(&self.lock(), reg_no)
    }

    /// Insert a single identity in its own transaction.
    pub fn insert_identity(&self, identity: &Identity, registered_at: NaiveDateTime) -> Result<(), DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        insert_identity(&tx, identity, registered_at)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert an attendance row unless one exists for `(reg_no, day)`.
    ///
    /// Returns `true` when a row was inserted.
    pub fn insert_attendance(&self, reg_no: &str, now: NaiveDateTime) -> Result<bool, DbError> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "INSERT INTO attendance (reg_no, day, marked_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (reg_no, day) DO NOTHING",
                params![
                    reg_no,
                    now.format(DAY_FORMAT).to_string(),
                    now.format(TIMESTAMP_FORMAT).to_string()
                ],
            )
            .map_err(|e| match constraint_code(&e) {
                Some(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => {
                    DbError::UnknownIdentity(reg_no.to_string())
                }
                _ => DbError::Sqlite(e),
            })?;
        Ok(changed == 1)
    }

    /// Most recent attendance rows across all identities, newest first.
    pub fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceRecord>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT a.reg_no, i.name, a.marked_at
             FROM attendance a
             LEFT JOIN identities i ON i.reg_no = a.reg_no
             ORDER BY a.marked_at DESC, a.id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (reg_no, name, marked_at) = row?;
            let marked_at = NaiveDateTime::parse_from_str(&marked_at, TIMESTAMP_FORMAT).map_err(|e| {
                DbError::Corrupt {
                    reg_no: reg_no.clone(),
                    reason: format!("timestamp '{marked_at}': {e}"),
                }
            })?;
            records.push(AttendanceRecord {
                reg_no,
                name,
                marked_at,
            });
        }
        Ok(records)
    }
}

pub(crate) fn lookup(conn: &Connection, reg_no: &str) -> Result<Option<Profile>, DbError> {
    Ok(conn
        .query_row(
            "SELECT reg_no, name, COALESCE(cohort, ''), COALESCE(phone, '')
             FROM identities WHERE reg_no = ?1",
            params![reg_no],
            |row| {
                Ok(Profile {
                    reg_no: row.get(0)?,
                    name: row.get(1)?,
                    cohort: row.get(2)?,
                    phone: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// Insert a new identity. An existing key surfaces as [`DbError::Duplicate`].
pub(crate) fn insert_identity(
    tx: &Transaction<'_>,
    identity: &Identity,
    registered_at: NaiveDateTime,
) -> Result<(), DbError> {
    let p = &identity.profile;
    tx.execute(
        "INSERT INTO identities (reg_no, name, cohort, phone, fingerprint, registered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            p.reg_no,
            p.name,
            p.cohort,
            p.phone,
            identity.fingerprint.to_le_bytes(),
            registered_at.format(TIMESTAMP_FORMAT).to_string()
        ],
    )
    .map_err(|e| match constraint_code(&e) {
        Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) | Some(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) => {
            DbError::Duplicate(p.reg_no.clone())
        }
        _ => DbError::Sqlite(e),
    })?;
    Ok(())
}

/// Overwrite attributes and fingerprint of an existing identity.
pub(crate) fn replace_identity(
    tx: &Transaction<'_>,
    identity: &Identity,
    registered_at: NaiveDateTime,
) -> Result<(), DbError> {
    let p = &identity.profile;
    let changed = tx.execute(
        "UPDATE identities
         SET name = ?2, cohort = ?3, phone = ?4, fingerprint = ?5, registered_at = ?6
         WHERE reg_no = ?1",
        params![
            p.reg_no,
            p.name,
            p.cohort,
            p.phone,
            identity.fingerprint.to_le_bytes(),
            registered_at.format(TIMESTAMP_FORMAT).to_string()
        ],
    )?;
    if changed == 0 {
        return Err(DbError::UnknownIdentity(p.reg_no.clone()));
    }
    Ok(())
}

fn constraint_code(e: &rusqlite::Error) -> Option<std::os::raw::c_int> {
    match e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            Some(err.extended_code)
        }
        _ => None,
    }
}

/// Create tables and add columns that older databases lack.
fn migrate(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(SCHEMA)?;
    ensure_column(conn, "identities", "cohort", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "identities", "phone", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "identities", "fingerprint", "BLOB")?;
    ensure_column(conn, "identities", "registered_at", "TEXT NOT NULL DEFAULT ''")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<(), DbError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.iter().any(|c| c == column) {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    tracing::info!(table, column, "added missing column");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::NaiveDate;

    pub fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    pub fn identity(reg_no: &str, values: &[f32]) -> Identity {
        Identity {
            profile: Profile {
                reg_no: reg_no.into(),
                name: format!("Student {reg_no}"),
                cohort: "3".into(),
                phone: "5551234".into(),
            },
            fingerprint: Fingerprint::new(values.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{at, identity};
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let a = identity("S001", &[0.25, -0.5]);
        db.insert_identity(&a, at(1, 9, 0)).unwrap();

        assert_eq!(db.load_identities().unwrap(), vec![a.clone()]);
        assert_eq!(db.lookup("S001").unwrap(), Some(a.profile));
        assert_eq!(db.lookup("S999").unwrap(), None);
    }

    #[test]
    fn test_duplicate_insert_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.insert_identity(&identity("S001", &[1.0]), at(1, 9, 0)).unwrap();
        let err = db
            .insert_identity(&identity("S001", &[2.0]), at(1, 9, 5))
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(ref k) if k == "S001"), "{err}");
        assert_eq!(err.kind(), ErrorKind::DuplicateIdentity);
        assert_eq!(db.load_identities().unwrap()[0].fingerprint.values, vec![1.0]);
    }

    #[test]
    fn test_attendance_unique_per_day() {
        let db = Database::open_in_memory().unwrap();
        db.insert_identity(&identity("S001", &[1.0]), at(1, 8, 0)).unwrap();

        assert!(db.insert_attendance("S001", at(1, 9, 0)).unwrap());
        assert!(!db.insert_attendance("S001", at(1, 17, 30)).unwrap());
        assert!(db.insert_attendance("S001", at(2, 9, 0)).unwrap());
        assert_eq!(db.recent_attendance(10).unwrap().len(), 2);
    }

    #[test]
    fn test_attendance_requires_registered_identity() {
        let db = Database::open_in_memory().unwrap();
        let err = db.insert_attendance("ghost", at(1, 9, 0)).unwrap_err();
        assert!(matches!(err, DbError::UnknownIdentity(_)), "{err}");
    }

    #[test]
    fn test_legacy_schema_gains_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE identities (reg_no TEXT PRIMARY KEY, name TEXT NOT NULL, cohort TEXT);
             INSERT INTO identities (reg_no, name, cohort) VALUES ('OLD1', 'Legacy', NULL);",
        )
        .unwrap();

        let db = Database::init(conn).unwrap();
        let profile = db.lookup("OLD1").unwrap().unwrap();
        assert_eq!(profile.phone, "");
        assert_eq!(profile.cohort, "");
        // No fingerprint yet, so the store does not load it.
        assert!(db.load_identities().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_fingerprint_blob() {
        let db = Database::open_in_memory().unwrap();
        db.lock()
            .execute(
                "INSERT INTO identities (reg_no, name, fingerprint) VALUES ('BAD', 'x', X'010203')",
                [],
            )
            .unwrap();
        assert!(matches!(db.load_identities(), Err(DbError::Corrupt { .. })));
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        let db = Database::open(&path).unwrap();
        db.insert_identity(&identity("S001", &[1.0]), at(1, 9, 0)).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.load_identities().unwrap().len(), 1);
    }
}
