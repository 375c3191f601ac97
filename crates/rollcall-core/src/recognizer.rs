//! FaceNet face embedder via ONNX Runtime.
//!
//! Crops the detected box, resizes it to 160x160 RGB, standardizes it per
//! image and extracts a 128-dimensional fingerprint.

use crate::types::{BoundingBox, Fingerprint};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from the SSD detector!) ---
const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — export FaceNet to ONNX and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} lies outside the image")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based fingerprint extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet embedder"
        );

        Ok(Self { session })
    }

    /// Extract the fingerprint of one detected face.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Fingerprint, RecognizerError> {
        let crop = crop_face(image, face).ok_or_else(|| RecognizerError::EmptyCrop(face.clone()))?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != FACENET_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Fingerprint::new(l2_normalize(raw_data.to_vec())))
    }
}

/// Crop the box (clamped to the image) and resize to the model input size.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let x1 = face.x.max(0.0).floor() as u32;
    let y1 = face.y.max(0.0).floor() as u32;
    let x2 = ((face.x + face.width).ceil().max(0.0) as u32).min(image.width());
    let y2 = ((face.y + face.height).ceil().max(0.0) as u32).min(image.height());
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop = imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image();
    Some(imageops::resize(
        &crop,
        FACENET_INPUT_SIZE,
        FACENET_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// Per-image standardization into an NHWC float tensor.
///
/// `(x - mean) / max(std, 1/sqrt(n))` over every channel value, the
/// "prewhiten" step FaceNet was trained with.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE as usize;
    let raw = face.as_raw();
    let n = raw.len().max(1) as f32;

    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let var = raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
    let std = var.sqrt().max(1.0 / n.sqrt());

    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in face.enumerate_pixels() {
        for (c, &v) in pixel.0.iter().enumerate() {
            tensor[[0, y as usize, x as usize, c]] = (v as f32 - mean) / std;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
