//! Registration: samples → canonical fingerprint → persistent table + store.
//!
//! An attempt walks `CollectingSamples → Aggregating → Validating →
//! Persisting → Registered`. The database row is written first and the
//! in-memory store second, both while the connection guard is held, so two
//! attempts for the same key cannot interleave between the uniqueness check
//! and the commit. Archive images are written to a hidden staging directory
//! before the guard is taken; only the renames happen under it.

use crate::dataset::{self, person_dir_name, SkippedDir};
use crate::db::{self, Database, DbError};
use crate::enrollment::{self, EnrollError};
use crate::error::{ErrorKind, Failure, SampleWarning};
use crate::extractor::SampleBatch;
use crate::store::IdentityStore;
use crate::types::{Identity, Profile};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStage {
    CollectingSamples,
    Aggregating,
    Validating,
    Persisting,
    Registered,
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error(transparent)]
    InsufficientSamples(#[from] EnrollError),
    #[error("invalid profile for {reg_no:?}: {reason}")]
    InvalidProfile { reg_no: String, reason: String },
    #[error("identity {0} is already registered")]
    Duplicate(String),
    #[error("identity {0} is not registered")]
    Unknown(String),
    #[error("database: {0}")]
    Database(DbError),
    #[error("sample archive: {0}")]
    Archive(#[from] io::Error),
}

impl RegisterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegisterError::InsufficientSamples(_) => ErrorKind::InsufficientSamples,
            RegisterError::InvalidProfile { .. } => ErrorKind::InvalidProfile,
            RegisterError::Duplicate(_) => ErrorKind::DuplicateIdentity,
            RegisterError::Unknown(_) => ErrorKind::UnknownIdentity,
            RegisterError::Database(_) | RegisterError::Archive(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// The stage the attempt was in when it failed.
    pub fn stage(&self) -> RegisterStage {
        match self {
            RegisterError::InsufficientSamples(_) => RegisterStage::Aggregating,
            RegisterError::InvalidProfile { .. } | RegisterError::Duplicate(_) | RegisterError::Unknown(_) => {
                RegisterStage::Validating
            }
            RegisterError::Database(_) | RegisterError::Archive(_) => RegisterStage::Persisting,
        }
    }
}

impl From<DbError> for RegisterError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Duplicate(key) => RegisterError::Duplicate(key),
            DbError::UnknownIdentity(key) => RegisterError::Unknown(key),
            other => RegisterError::Database(other),
        }
    }
}

impl From<rusqlite::Error> for RegisterError {
    fn from(e: rusqlite::Error) -> Self {
        RegisterError::Database(DbError::Sqlite(e))
    }
}

impl From<RegisterError> for Failure {
    fn from(e: RegisterError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registered {
    pub reg_no: String,
    /// Fingerprints that went into the canonical mean.
    pub samples_used: usize,
    /// Samples dropped along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SampleWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Replace,
}

pub struct Registrar {
    store: Arc<IdentityStore>,
    db: Arc<Database>,
    archive: Option<SampleArchive>,
    min_samples: usize,
}

impl Registrar {
    pub fn new(store: Arc<IdentityStore>, db: Arc<Database>, min_samples: usize) -> Self {
        Self {
            store,
            db,
            archive: None,
            min_samples,
        }
    }

    /// Keep raw sample images of service registrations under `archive`.
    pub fn with_archive(mut self, archive: SampleArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Register a new identity. An existing key fails with `Duplicate`.
    ///
    /// `images` are the raw samples behind `batch`; they are archived when an
    /// archive is configured and left alone when empty.
    pub fn register(
        &self,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        self.run(Mode::Create, profile, batch, images, now)
    }

    /// Replace the fingerprint and attributes of an existing identity.
    pub fn reregister(
        &self,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        self.run(Mode::Replace, profile, batch, images, now)
    }

    fn run(
        &self,
        mode: Mode,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        let reg_no = profile.reg_no.clone();
        let result = self.attempt(mode, profile, batch, images, now);
        match &result {
            Ok(registered) => tracing::info!(
                reg_no = %registered.reg_no,
                samples = registered.samples_used,
                warnings = registered.warnings.len(),
                replaced = mode == Mode::Replace,
                "identity registered"
            ),
            Err(e) if e.kind() == ErrorKind::PersistenceFailure => {
                tracing::error!(reg_no = %reg_no, stage = ?e.stage(), error = %e, "registration failed")
            }
            Err(e) => tracing::warn!(reg_no = %reg_no, stage = ?e.stage(), error = %e, "registration rejected"),
        }
        result
    }

    fn attempt(
        &self,
        mode: Mode,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        let SampleBatch {
            fingerprints,
            warnings,
        } = batch;
        tracing::debug!(
            reg_no = %profile.reg_no,
            stage = ?RegisterStage::CollectingSamples,
            usable = fingerprints.len(),
            dropped = warnings.len(),
            "samples collected"
        );

        enter(&profile.reg_no, RegisterStage::Aggregating);
        let fingerprint = enrollment::aggregate(&fingerprints, self.min_samples)?;
        let identity = Identity {
            profile,
            fingerprint,
        };
        let reg_no = identity.key().to_string();

        enter(&reg_no, RegisterStage::Validating);
        dataset::validate_profile(&identity.profile).map_err(|reason| RegisterError::InvalidProfile {
            reg_no: reg_no.clone(),
            reason,
        })?;

        let prepared = match &self.archive {
            Some(archive) if !images.is_empty() => Some(archive.prepare(&identity.profile, images)?),
            _ => None,
        };

        // Archive writes are done; the guard only covers the uniqueness
        // check, the row, the directory renames and the store swap.
        let mut conn = self.db.lock();

        let previous = db::lookup(&conn, &reg_no)?;
        let exists = previous.is_some() || self.store.contains(&reg_no);
        match mode {
            Mode::Create if exists => return Err(RegisterError::Duplicate(reg_no)),
            Mode::Replace if !exists => return Err(RegisterError::Unknown(reg_no)),
            _ => {}
        }

        enter(&reg_no, RegisterStage::Persisting);
        let tx = conn.transaction()?;
        match mode {
            Mode::Create => db::insert_identity(&tx, &identity, now)?,
            Mode::Replace => db::replace_identity(&tx, &identity, now)?,
        }
        // Dropping `tx` on an archive error rolls the row back; dropping
        // `staged` on a commit error puts the old directories back.
        let staged = match prepared {
            Some(prepared) => Some(prepared.place(previous.as_ref())?),
            None => None,
        };
        tx.commit()?;
        if let Some(staged) = staged {
            staged.commit();
        }

        self.store.put(identity);
        drop(conn);
        enter(&reg_no, RegisterStage::Registered);

        Ok(Registered {
            reg_no,
            samples_used: fingerprints.len(),
            warnings,
        })
    }
}

fn enter(reg_no: &str, stage: RegisterStage) {
    tracing::debug!(reg_no, ?stage, "registration stage");
}

/// On-disk copy of registration samples, one person directory each.
#[derive(Debug, Clone)]
pub struct SampleArchive {
    root: PathBuf,
    limit: usize,
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

impl SampleArchive {
    pub fn new(root: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            root: root.into(),
            limit,
        }
    }

    /// Write the first `limit` recognizable images into a hidden staging
    /// directory private to this attempt.
    fn prepare(&self, profile: &Profile, images: &[Vec<u8>]) -> io::Result<PreparedSamples> {
        fs::create_dir_all(&self.root)?;
        let name = person_dir_name(profile);
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let staging = self
            .root
            .join(format!(".{name}.{}-{seq}.staging", std::process::id()));

        fs::create_dir(&staging)?;
        let prepared = PreparedSamples {
            root: self.root.clone(),
            staging,
            name,
        };
        self.write_samples(&prepared.staging, images)?;
        Ok(prepared)
    }

    fn write_samples(&self, dir: &Path, images: &[Vec<u8>]) -> io::Result<()> {
        let mut written = 0;
        for (index, bytes) in images.iter().take(self.limit).enumerate() {
            let Some(ext) = image::guess_format(bytes)
                .ok()
                .and_then(|f| f.extensions_str().first().copied())
            else {
                tracing::debug!(sample = index, "not archiving unrecognized sample");
                continue;
            };
            written += 1;
            fs::write(dir.join(format!("{written}.{ext}")), bytes)?;
        }
        Ok(())
    }
}

/// Samples written to a staging directory, not yet visible in the dataset.
/// Dropping it removes the staging directory.
struct PreparedSamples {
    root: PathBuf,
    staging: PathBuf,
    name: String,
}

impl PreparedSamples {
    /// Move the staged samples into the person directory.
    ///
    /// Both the current directory and the one named after `previous` (when
    /// reregistration changed the name) are moved aside first, so exactly one
    /// directory holds this key afterwards.
    fn place(self, previous: Option<&Profile>) -> io::Result<StagedSamples> {
        let target = self.root.join(&self.name);
        let mut staged = StagedSamples {
            target: target.clone(),
            backups: Vec::new(),
            placed: false,
            committed: false,
        };

        let mut superseded = vec![target];
        if let Some(previous) = previous {
            let old = self.root.join(person_dir_name(previous));
            if !superseded.contains(&old) {
                superseded.push(old);
            }
        }
        for original in superseded {
            if !original.exists() {
                continue;
            }
            let name = original
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let backup = self.root.join(format!(".{name}.previous"));
            if backup.exists() {
                fs::remove_dir_all(&backup)?;
            }
            fs::rename(&original, &backup)?;
            staged.backups.push((original, backup));
        }

        fs::rename(&self.staging, &staged.target)?;
        staged.placed = true;
        Ok(staged)
    }
}

impl Drop for PreparedSamples {
    fn drop(&mut self) {
        if self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                tracing::warn!(path = %self.staging.display(), error = %e, "cannot remove archive staging");
            }
        }
    }
}

/// Archive directory placed during Persisting. Dropping it uncommitted
/// removes it and puts back whatever it replaced.
struct StagedSamples {
    target: PathBuf,
    /// `(original, backup)` for every directory moved aside.
    backups: Vec<(PathBuf, PathBuf)>,
    placed: bool,
    committed: bool,
}

impl StagedSamples {
    fn commit(mut self) {
        self.committed = true;
        for (_, backup) in &self.backups {
            if let Err(e) = fs::remove_dir_all(backup) {
                tracing::warn!(path = %backup.display(), error = %e, "cannot remove replaced archive");
            }
        }
    }
}

impl Drop for StagedSamples {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if self.placed {
            if let Err(e) = fs::remove_dir_all(&self.target) {
                tracing::error!(path = %self.target.display(), error = %e, "cannot roll back sample archive");
            }
        }
        for (original, backup) in &self.backups {
            if let Err(e) = fs::rename(backup, original) {
                tracing::error!(path = %backup.display(), error = %e, "cannot restore replaced archive");
            }
        }
    }
}

/// One person that could not be imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub reg_no: String,
    #[serde(flatten)]
    pub failure: Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub registered: Vec<Registered>,
    pub failed: Vec<ImportFailure>,
    pub skipped: Vec<SkippedDir>,
}

/// Register every well-formed person directory under `root`.
///
/// `extract` turns one person's images into a sample batch. Per-person
/// failures are collected in the report; only an unreadable root aborts.
pub fn import_dataset<F>(
    registrar: &Registrar,
    root: &Path,
    mut extract: F,
    now: NaiveDateTime,
) -> io::Result<ImportReport>
where
    F: FnMut(&[Vec<u8>]) -> SampleBatch,
{
    let scan = dataset::scan(root)?;
    let mut report = ImportReport {
        skipped: scan.skipped,
        ..ImportReport::default()
    };

    for person in scan.people {
        let reg_no = person.profile.reg_no.clone();
        tracing::info!(reg_no = %reg_no, images = person.images.len(), "importing");

        let images: Vec<Vec<u8>> = person
            .images
            .iter()
            .map(|path| {
                fs::read(path).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read sample");
                    Vec::new()
                })
            })
            .collect();

        let batch = extract(&images);
        match registrar.register(person.profile, batch, &[], now) {
            Ok(registered) => report.registered.push(registered),
            Err(e) => report.failed.push(ImportFailure {
                reg_no,
                failure: e.into(),
            }),
        }
    }

    tracing::info!(
        registered = report.registered.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "import finished"
    );
    Ok(report)
}
