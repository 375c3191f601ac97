//! The attendance service: one object owning the store, the ledger and the
//! registrar, shared by the daemon and the CLI.

use crate::config::Config;
use crate::db::{Database, DbError};
use crate::error::Failure;
use crate::extractor::{self, DetectedFace, ExtractError, FeatureExtractor, SampleBatch};
use crate::ledger::{AttendanceLedger, MarkOutcome};
use crate::matcher::{LinearMatcher, Matcher, Metric};
use crate::registry::{self, ImportReport, Registered, RegisterError, Registrar, SampleArchive};
use crate::store::IdentityStore;
use crate::types::{AttendanceRecord, BoundingBox, Profile};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Attendance state of a matched face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    NewlyMarked,
    AlreadyMarked,
}

impl From<&MarkOutcome> for AttendanceStatus {
    fn from(outcome: &MarkOutcome) -> Self {
        match outcome {
            MarkOutcome::NewlyMarked(_) => AttendanceStatus::NewlyMarked,
            MarkOutcome::AlreadyMarked => AttendanceStatus::AlreadyMarked,
        }
    }
}

/// Per-face answer to a check-in image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceOutcome {
    pub bbox: BoundingBox,
    /// Matched identity, `None` for unknown.
    #[serde(default)]
    pub reg_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance: Option<AttendanceStatus>,
    /// Why this face produced no decision, or why marking it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub identities: usize,
    pub metric: Metric,
    pub threshold: f32,
    pub min_samples: usize,
}

pub struct AttendanceService {
    store: Arc<IdentityStore>,
    ledger: AttendanceLedger,
    registrar: Registrar,
    matcher: Box<dyn Matcher>,
    metric: Metric,
    threshold: f32,
    min_samples: usize,
}

impl AttendanceService {
    /// Open the configured database and load every identity into memory.
    pub fn open(config: &Config) -> Result<Self, DbError> {
        let db = Database::open(&config.db_path)?;
        let service = Self::with_database(db, config)?;
        tracing::info!(
            db = %config.db_path.display(),
            identities = service.store.len(),
            metric = %config.metric,
            threshold = config.match_threshold,
            "attendance service ready"
        );
        Ok(service)
    }

    pub fn with_database(db: Database, config: &Config) -> Result<Self, DbError> {
        let identities = db.load_identities()?;
        if let Some(first) = identities.first() {
            let dim = first.fingerprint.dim();
            if let Some(odd) = identities.iter().find(|i| i.fingerprint.dim() != dim) {
                return Err(DbError::Corrupt {
                    reg_no: odd.key().to_string(),
                    reason: format!(
                        "fingerprint has {} values, {} has {dim}",
                        odd.fingerprint.dim(),
                        first.key()
                    ),
                });
            }
        }

        let db = Arc::new(db);
        let store = Arc::new(IdentityStore::from_identities(identities));
        let mut registrar = Registrar::new(store.clone(), db.clone(), config.min_samples);
        if config.archive_samples > 0 {
            registrar = registrar.with_archive(SampleArchive::new(&config.dataset_dir, config.archive_samples));
        }

        Ok(Self {
            store,
            ledger: AttendanceLedger::new(db),
            registrar,
            matcher: Box::new(LinearMatcher::new(config.metric)),
            metric: config.metric,
            threshold: config.match_threshold,
            min_samples: config.min_samples,
        })
    }

    /// Match every detected face independently and mark attendance for the
    /// known ones.
    pub fn recognize(&self, faces: Vec<DetectedFace>, now: NaiveDateTime) -> Vec<FaceOutcome> {
        let gallery = self.store.snapshot();
        faces
            .into_iter()
            .map(|face| {
                let mut outcome = FaceOutcome {
                    bbox: face.bbox,
                    reg_no: None,
                    name: None,
                    score: 0.0,
                    attendance: None,
                    error: None,
                };
                let fingerprint = match face.fingerprint {
                    Ok(fp) => fp,
                    Err(failure) => {
                        outcome.error = Some(failure);
                        return outcome;
                    }
                };

                let decision = self.matcher.best_match(&fingerprint, &gallery, self.threshold);
                outcome.score = decision.score;
                let Some(reg_no) = decision.reg_no else {
                    tracing::debug!(score = decision.score, "unknown face");
                    return outcome;
                };

                outcome.name = gallery.get(&reg_no).map(|i| i.profile.name.clone());
                match self.ledger.mark(&reg_no, now) {
                    Ok(marked) => outcome.attendance = Some(AttendanceStatus::from(&marked)),
                    Err(e) => {
                        tracing::error!(reg_no = %reg_no, error = %e, "cannot mark attendance");
                        outcome.error = Some(e.into());
                    }
                }
                outcome.reg_no = Some(reg_no);
                outcome
            })
            .collect()
    }

    /// Decode, detect and match one image with the given extractor.
    pub fn check_in<E: FeatureExtractor + ?Sized>(
        &self,
        extractor: &mut E,
        image: &[u8],
        now: NaiveDateTime,
    ) -> Result<Vec<FaceOutcome>, ExtractError> {
        let faces = extractor::detect_faces(extractor, image)?;
        Ok(self.recognize(faces, now))
    }

    pub fn register(
        &self,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        self.registrar.register(profile, batch, images, now)
    }

    pub fn reregister(
        &self,
        profile: Profile,
        batch: SampleBatch,
        images: &[Vec<u8>],
        now: NaiveDateTime,
    ) -> Result<Registered, RegisterError> {
        self.registrar.reregister(profile, batch, images, now)
    }

    /// Register every person directory under `root`, extracting in-process.
    pub fn import<E: FeatureExtractor + ?Sized>(
        &self,
        extractor: &mut E,
        root: &Path,
        now: NaiveDateTime,
    ) -> io::Result<ImportReport> {
        registry::import_dataset(
            &self.registrar,
            root,
            |images| extractor::collect_samples(&mut *extractor, images),
            now,
        )
    }

    pub fn mark(&self, reg_no: &str, now: NaiveDateTime) -> Result<MarkOutcome, DbError> {
        self.ledger.mark(reg_no, now)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, DbError> {
        self.ledger.recent(limit)
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            identities: self.store.len(),
            metric: self.metric,
            threshold: self.threshold,
            min_samples: self.min_samples,
        }
    }
}
