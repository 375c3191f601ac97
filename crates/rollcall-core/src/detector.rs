//! SSD ResNet-10 face detector via ONNX Runtime.
//!
//! The model takes a 300x300 BGR image with per-channel mean subtraction and
//! emits a `[1, 1, N, 7]` tensor of `(image_id, label, confidence, x1, y1, x2, y2)`
//! rows in normalized coordinates. Non-maximum suppression is part of the graph.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SSD_INPUT_SIZE: u32 = 300;
/// Per-channel means in B, G, R order.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
const SSD_ROW_LEN: usize = 7;
/// Boxes smaller than this (in pixels) cannot be cropped into a face.
const MIN_FACE_SIDE: f32 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — export the res10 SSD face detector to ONNX and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SSD-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            confidence_threshold,
            "loaded SSD face detector"
        );

        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    /// Detect faces, returning boxes in image coordinates sorted by confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;

        let mut faces = decode_detections(
            rows,
            image.width() as f32,
            image.height() as f32,
            self.confidence_threshold,
        );
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(faces)
    }
}

/// Resize to 300x300 and build a mean-subtracted BGR NCHW tensor.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let size = SSD_INPUT_SIZE as usize;
    let resized = imageops::resize(image, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = b as f32 - SSD_MEAN_BGR[0];
        tensor[[0, 1, y, x]] = g as f32 - SSD_MEAN_BGR[1];
        tensor[[0, 2, y, x]] = r as f32 - SSD_MEAN_BGR[2];
    }

    tensor
}

/// Turn raw SSD rows into clamped pixel-space boxes above the threshold.
fn decode_detections(rows: &[f32], width: f32, height: f32, threshold: f32) -> Vec<BoundingBox> {
    rows.chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2] > threshold)
        .filter_map(|row| {
            let x1 = (row[3] * width).clamp(0.0, width);
            let y1 = (row[4] * height).clamp(0.0, height);
            let x2 = (row[5] * width).clamp(0.0, width);
            let y2 = (row[6] * height).clamp(0.0, height);

            let bbox = BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: row[2],
            };
            if bbox.width < MIN_FACE_SIDE || bbox.height < MIN_FACE_SIDE {
                tracing::debug!(?bbox, "discarding degenerate detection");
                return None;
            }
            Some(bbox)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(conf: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> [f32; 7] {
        [0.0, 1.0, conf, x1, y1, x2, y2]
    }

    #[test]
    fn test_decode_scales_to_pixels() {
        let rows = row(0.9, 0.25, 0.5, 0.75, 1.0);
        let faces = decode_detections(&rows, 200.0, 100.0, 0.5);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 50.0).abs() < 1e-4);
        assert!((f.y - 50.0).abs() < 1e-4);
        assert!((f.width - 100.0).abs() < 1e-4);
        assert!((f.height - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_drops_low_confidence() {
        let mut rows = Vec::new();
        rows.extend(row(0.5, 0.0, 0.0, 0.5, 0.5));
        rows.extend(row(0.2, 0.0, 0.0, 0.5, 0.5));
        rows.extend(row(0.51, 0.0, 0.0, 0.5, 0.5));
        let faces = decode_detections(&rows, 100.0, 100.0, 0.5);
        assert_eq!(faces.len(), 1);
        assert!((faces[0].confidence - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_decode_clamps_out_of_frame_boxes() {
        let rows = row(0.9, -0.2, -0.1, 1.3, 0.5);
        let faces = decode_detections(&rows, 100.0, 100.0, 0.5);
        assert_eq!(faces[0].x, 0.0);
        assert_eq!(faces[0].y, 0.0);
        assert!((faces[0].width - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_discards_degenerate_boxes() {
        let rows = row(0.9, 0.5, 0.5, 0.5, 0.9);
        assert!(decode_detections(&rows, 100.0, 100.0, 0.5).is_empty());
    }

    #[test]
    fn test_decode_ignores_trailing_partial_row() {
        let mut rows = row(0.9, 0.0, 0.0, 0.5, 0.5).to_vec();
        rows.extend([0.0, 1.0, 0.99]);
        assert_eq!(decode_detections(&rows, 100.0, 100.0, 0.5).len(), 1);
    }

    #[test]
    fn test_preprocess_shape_and_channel_order() {
        let image = RgbImage::from_pixel(64, 48, image::Rgb([123, 177, 104]));
        let tensor = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 300, 300]);
        // Pixel equals the BGR mean, so every channel normalizes to ~zero.
        assert!(tensor.iter().all(|v| v.abs() <= 1.0));
        assert!(tensor[[0, 0, 150, 150]].abs() <= 1.0);
    }
}
