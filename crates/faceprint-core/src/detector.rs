//! UltraFace face detector via ONNX Runtime.
//!
//! Runs the version-RFB-320 single-shot detector: 320x240 RGB input, two
//! output tensors (per-anchor background/face scores and corner-form boxes
//! normalized to [0, 1]), confidence filtering and NMS post-processing.

use crate::types::FaceRegion;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ULTRAFACE_INPUT_WIDTH: usize = 320;
const ULTRAFACE_INPUT_HEIGHT: usize = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;
/// Values per anchor in the score tensor: [background, face].
const ULTRAFACE_SCORES_PER_ANCHOR: usize = 2;
/// Values per anchor in the box tensor: [x1, y1, x2, y2], normalized.
const ULTRAFACE_COORDS_PER_ANCHOR: usize = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the UltraFace ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// UltraFace-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Output tensor positions (scores, boxes), discovered by name at load
    /// time with a positional fallback.
    output_indices: (usize, usize),
}

impl FaceDetector {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded UltraFace model"
        );

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        let output_indices = discover_output_indices(&output_names);
        tracing::debug!(?output_indices, "UltraFace output tensor mapping");

        Ok(Self {
            session,
            output_indices,
        })
    }

    /// Detect faces in an RGB image, returning regions sorted by confidence.
    ///
    /// An image with no faces yields an empty vector; that is not an error.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let input = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (score_idx, box_idx) = self.output_indices;
        let (_, scores) = outputs[score_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[box_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let detections = decode(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        );

        let mut result = nms(detections, ULTRAFACE_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result)
    }
}

/// Discover output tensor ordering by name.
///
/// The reference UltraFace export names its outputs "scores" and "boxes";
/// other exports use generic numeric names, in which case the standard
/// positional ordering (scores first, boxes second) applies.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");

    match (scores, boxes) {
        (Some(s), Some(b)) => {
            tracing::info!("UltraFace: using name-based output tensor mapping");
            (s, b)
        }
        _ => {
            tracing::info!(
                ?names,
                "UltraFace: output names not recognized, using positional mapping [0]=scores, [1]=boxes"
            );
            (0, 1)
        }
    }
}

/// Preprocess an RGB image into the 1x3x240x320 NCHW tensor UltraFace expects.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(
        image,
        ULTRAFACE_INPUT_WIDTH as u32,
        ULTRAFACE_INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );

    let mut tensor =
        Array4::<f32>::zeros((1, 3, ULTRAFACE_INPUT_HEIGHT, ULTRAFACE_INPUT_WIDTH));

    for y in 0..ULTRAFACE_INPUT_HEIGHT {
        for x in 0..ULTRAFACE_INPUT_WIDTH {
            let pixel = resized.get_pixel(x as u32, y as u32).0;
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
            }
        }
    }

    tensor
}

/// Decode raw score/box tensors into pixel-space face regions.
///
/// Box coordinates are corner-form and normalized to [0, 1]; they are
/// clamped before scaling so a box hanging off the frame cannot produce
/// negative crop coordinates.
fn decode(
    scores: &[f32],
    boxes: &[f32],
    image_width: f32,
    image_height: f32,
    threshold: f32,
) -> Vec<FaceRegion> {
    let num_anchors = scores.len() / ULTRAFACE_SCORES_PER_ANCHOR;
    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        // scores[idx] = [background, face]
        let confidence = scores[idx * ULTRAFACE_SCORES_PER_ANCHOR + 1];
        if confidence <= threshold {
            continue;
        }

        let box_off = idx * ULTRAFACE_COORDS_PER_ANCHOR;
        if box_off + 3 >= boxes.len() {
            continue;
        }

        let x1 = boxes[box_off].clamp(0.0, 1.0) * image_width;
        let y1 = boxes[box_off + 1].clamp(0.0, 1.0) * image_height;
        let x2 = boxes[box_off + 2].clamp(0.0, 1.0) * image_width;
        let y2 = boxes[box_off + 3].clamp(0.0, 1.0) * image_height;

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two face regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = a.width * a.height;
    let area_b = b.width * b.height;
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
