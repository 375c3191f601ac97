//! rollcall-core — Face identity matching and once-per-day attendance.
//!
//! Uses an SSD face detector and a FaceNet embedder running via ONNX Runtime,
//! an in-memory identity store backed by SQLite, and an idempotent
//! attendance ledger.

pub mod config;
pub mod dataset;
pub mod db;
pub mod detector;
pub mod enrollment;
pub mod error;
pub mod extractor;
pub mod ledger;
pub mod matcher;
pub mod recognizer;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use config::{BusKind, Config};
pub use error::{ErrorKind, Failure, Outcome, SampleWarning};
pub use extractor::{FeatureExtractor, OnnxExtractor, SampleBatch};
pub use ledger::MarkOutcome;
pub use matcher::{LinearMatcher, Matcher, Metric};
pub use registry::{ImportReport, Registered};
pub use service::{AttendanceService, FaceOutcome, ServiceStatus};
pub use types::{AttendanceRecord, BoundingBox, Fingerprint, Identity, MatchDecision, Profile};
