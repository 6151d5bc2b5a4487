//! 128-dimensional face embedding extraction via ONNX Runtime.
//!
//! Crops a detected face region (with margin), resizes it to the network's
//! 150x150 input, and runs the embedding model. The output length is
//! validated against [`EMBEDDING_DIM`](crate::types::EMBEDDING_DIM).

use crate::types::{FaceRegion, EMBEDDING_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from the detector!) ---
const EMBEDDER_INPUT_SIZE: usize = 150;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
/// Fraction of the region size added as margin on every side before the
/// crop, matching how the embedding network was trained.
const EMBEDDER_CROP_MARGIN: f32 = 0.25;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — place the face embedding ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0}x{1} is empty after clamping to the image bounds")]
    EmptyRegion(u32, u32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed 128-d face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the face embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session })
    }

    /// Extract a 128-component embedding for one detected face region.
    pub fn embed(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<Vec<f32>, EmbedderError> {
        let crop = crop_with_margin(image, region)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values: Vec<f32> = raw_data.to_vec();

        if values.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                values.len()
            )));
        }

        Ok(values)
    }
}

/// Crop a face region from the image with a proportional margin, clamped to
/// the image bounds.
fn crop_with_margin(image: &RgbImage, region: &FaceRegion) -> Result<RgbImage, EmbedderError> {
    let margin_x = region.width * EMBEDDER_CROP_MARGIN;
    let margin_y = region.height * EMBEDDER_CROP_MARGIN;

    let x1 = (region.x - margin_x).max(0.0) as u32;
    let y1 = (region.y - margin_y).max(0.0) as u32;
    let x2 = ((region.x + region.width + margin_x) as u32).min(image.width());
    let y2 = ((region.y + region.height + margin_y) as u32).min(image.height());

    if x2 <= x1 || y2 <= y1 {
        return Err(EmbedderError::EmptyRegion(
            x2.saturating_sub(x1),
            y2.saturating_sub(y1),
        ));
    }

    Ok(image::imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// Preprocess a face crop into the 1x3x150x150 NCHW tensor the embedding
/// network expects, with symmetric normalization.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = EMBEDDER_INPUT_SIZE;
    let resized = image::imageops::resize(
        crop,
        size as u32,
        size as u32,
        image::imageops::FilterType::Triangle,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(x as u32, y as u32).0;
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
    }

    tensor
}
