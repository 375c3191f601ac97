//! Structured outcomes shared by every public operation.
//!
//! Module errors (`ExtractError`, `DbError`, `RegisterError`, ...) stay rich
//! inside the crate and collapse into a [`Failure`] (kind + message) at the
//! boundary, so callers never receive a raw fault.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No usable face in a sample. Recoverable per sample.
    ExtractionFailure,
    /// Malformed input image. Recoverable per sample.
    DecodeFailure,
    /// Fewer usable samples than the configured minimum.
    InsufficientSamples,
    /// A profile field cannot be stored or archived as given.
    InvalidProfile,
    /// The identity key is already registered.
    DuplicateIdentity,
    /// Re-registration of a key that was never registered.
    UnknownIdentity,
    /// Storage write or read failed; partial artifacts were rolled back.
    PersistenceFailure,
    /// The extraction pool or a blocking task is gone.
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Wire form of any failure: what went wrong and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// A per-sample failure that was recovered from inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWarning {
    /// Position of the sample in the submitted batch.
    pub index: usize,
    #[serde(flatten)]
    pub failure: Failure,
}

/// Result envelope returned over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T, E: Into<Failure>> From<Result<T, E>> for Outcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_wire_shape() {
        let ok: Outcome<u32> = Outcome::Success(3);
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"success":3}"#);

        let err: Outcome<u32> =
            Outcome::Failure(Failure::new(ErrorKind::DuplicateIdentity, "S001 already registered"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["failure"]["kind"], "DuplicateIdentity");
        assert_eq!(json["failure"]["message"], "S001 already registered");
    }

    #[test]
    fn test_outcome_from_result() {
        let r: Result<u32, Failure> = Err(Failure::new(ErrorKind::PersistenceFailure, "disk full"));
        let outcome = Outcome::from(r);
        assert_eq!(
            outcome.into_result().unwrap_err().kind,
            ErrorKind::PersistenceFailure
        );
    }

    #[test]
    fn test_sample_warning_flattens_failure() {
        let w = SampleWarning {
            index: 2,
            failure: Failure::new(ErrorKind::ExtractionFailure, "no face detected"),
        };
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["index"], 2);
        assert_eq!(json["kind"], "ExtractionFailure");
    }
}
