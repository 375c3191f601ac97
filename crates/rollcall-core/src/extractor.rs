//! Feature extraction boundary.
//!
//! The core never looks inside the detector or embedder; it only relies on
//! [`FeatureExtractor`]. [`OnnxExtractor`] is the production implementation.

use crate::config::Config;
use crate::detector::{DetectorError, FaceDetector};
use crate::error::{ErrorKind, Failure, SampleWarning};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Fingerprint};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFace,
    #[error("no usable face region: {0}")]
    Unusable(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Decode(_) => ErrorKind::DecodeFailure,
            _ => ErrorKind::ExtractionFailure,
        }
    }
}

impl From<ExtractError> for Failure {
    fn from(e: ExtractError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

/// Turns images into face boxes and fixed-length fingerprints.
///
/// Implementations hold inference sessions and are driven from one thread at
/// a time; run several instances for parallelism.
pub trait FeatureExtractor: Send {
    /// Detect faces, sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError>;

    /// Compute the fingerprint of one detected face.
    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Fingerprint, ExtractError>;
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| ExtractError::Decode(e.to_string()))
}

/// One face found in a match request.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// The face's fingerprint, or why it could not be computed.
    pub fingerprint: Result<Fingerprint, Failure>,
}

/// Detect every face in an image and fingerprint each one independently.
///
/// A face whose embedding fails is kept with its failure so the caller can
/// report it; it does not affect its siblings.
pub fn detect_faces<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    image: &[u8],
) -> Result<Vec<DetectedFace>, ExtractError> {
    let rgb = decode_image(image)?;
    let boxes = extractor.detect(&rgb)?;
    tracing::debug!(faces = boxes.len(), "detected faces");

    Ok(boxes
        .into_iter()
        .map(|bbox| {
            let fingerprint = extractor.extract(&rgb, &bbox).map_err(Failure::from);
            DetectedFace { bbox, fingerprint }
        })
        .collect())
}

/// Fingerprint of the largest face in an enrollment sample.
pub fn enrollment_sample<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    image: &[u8],
) -> Result<Fingerprint, ExtractError> {
    let rgb = decode_image(image)?;
    let boxes = extractor.detect(&rgb)?;
    let main = boxes
        .iter()
        .max_by(|a, b| a.area().total_cmp(&b.area()))
        .ok_or(ExtractError::NoFace)?;
    extractor.extract(&rgb, main)
}

/// Usable fingerprints of an enrollment batch plus the samples that were dropped.
#[derive(Debug, Clone, Default)]
pub struct SampleBatch {
    pub fingerprints: Vec<Fingerprint>,
    pub warnings: Vec<SampleWarning>,
}

impl SampleBatch {
    pub fn push_warning(&mut self, index: usize, failure: Failure) {
        tracing::warn!(sample = index, kind = %failure.kind, message = %failure.message, "dropping sample");
        self.warnings.push(SampleWarning { index, failure });
    }
}

/// Extract one fingerprint per sample image, dropping samples without a face.
pub fn collect_samples<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    images: &[Vec<u8>],
) -> SampleBatch {
    let mut batch = SampleBatch::default();
    for (index, image) in images.iter().enumerate() {
        match enrollment_sample(extractor, image) {
            Ok(fp) => batch.fingerprints.push(fp),
            Err(e) => batch.push_warning(index, e.into()),
        }
    }
    batch
}

/// SSD detector + FaceNet embedder running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(config: &Config) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&config.detector_model_path(), config.detection_confidence)?;
        let recognizer = FaceRecognizer::load(&config.embedder_model_path())?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError> {
        Ok(self.detector.detect(image)?)
    }

    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Fingerprint, ExtractError> {
        Ok(self.recognizer.extract(image, face)?)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{png, FakeExtractor};
    use super::*;

    #[test]
    fn test_decode_failure_kind() {
        let err = decode_image(b"not an image").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[test]
    fn test_detect_faces_handles_each_face() {
        let image = png(24, &[[10, 0, 0], [0, 0, 0], [0, 20, 0]]);
        let faces = detect_faces(&mut FakeExtractor, &image).unwrap();

        assert_eq!(faces.len(), 3);
        assert_eq!(faces[0].fingerprint.as_ref().unwrap().values, vec![10.0, 0.0, 0.0]);
        assert_eq!(
            faces[1].fingerprint.as_ref().unwrap_err().kind,
            ErrorKind::ExtractionFailure
        );
        assert_eq!(faces[2].fingerprint.as_ref().unwrap().values, vec![0.0, 20.0, 0.0]);
    }

    #[test]
    fn test_detect_faces_without_faces() {
        let faces = detect_faces(&mut FakeExtractor, &png(1, &[])).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_enrollment_sample_no_face() {
        let err = enrollment_sample(&mut FakeExtractor, &png(1, &[])).unwrap_err();
        assert!(matches!(err, ExtractError::NoFace));
    }

    #[test]
    fn test_collect_samples_drops_bad_samples() {
        let images = vec![
            png(8, &[[1, 1, 1]]),
            b"garbage".to_vec(),
            png(1, &[]),
            png(8, &[[2, 2, 2]]),
        ];
        let batch = collect_samples(&mut FakeExtractor, &images);

        assert_eq!(batch.fingerprints.len(), 2);
        assert_eq!(batch.warnings.len(), 2);
        assert_eq!(batch.warnings[0].index, 1);
        assert_eq!(batch.warnings[0].failure.kind, ErrorKind::DecodeFailure);
        assert_eq!(batch.warnings[1].index, 2);
        assert_eq!(batch.warnings[1].failure.kind, ErrorKind::ExtractionFailure);
    }
}
