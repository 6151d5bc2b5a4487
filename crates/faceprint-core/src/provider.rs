//! The encoding-provider seam: image bytes in, labeled face vectors out.
//!
//! The rest of the system treats face encoding as a black box that returns
//! zero or more fixed-length vectors per image. [`OnnxProvider`] is the
//! production implementation (UltraFace detection + 128-d embedding);
//! tests substitute their own [`EncodingProvider`].

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::FaceRegion;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// One detected face together with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Vec<f32>,
}

/// Black-box face encoding: an image yields 0..N fixed-length vectors,
/// one per detected face. A detected region that fails to produce an
/// embedding is simply omitted.
pub trait EncodingProvider {
    fn encode_image(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError>;
}

/// File name of the UltraFace detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
/// File name of the 128-d embedding model inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "dlib_face_recognition_resnet_model_v1.onnx";

/// ONNX-backed provider: UltraFace detection followed by per-face
/// embedding extraction.
pub struct OnnxProvider {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxProvider {
    /// Load both models from a model directory.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE).to_string_lossy())?;
        let embedder = FaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL_FILE).to_string_lossy())?;
        Ok(Self { detector, embedder })
    }
}

impl EncodingProvider for OnnxProvider {
    fn encode_image(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let regions = self.detector.detect(&rgb)?;

        let mut faces = Vec::with_capacity(regions.len());
        for region in regions {
            match self.embedder.embed(&rgb, &region) {
                Ok(embedding) => faces.push(DetectedFace { region, embedding }),
                Err(EmbedderError::EmptyRegion(w, h)) => {
                    // Detection found a region the embedder cannot use;
                    // the 0..N contract lets us skip it.
                    tracing::warn!(w, h, "skipping face region with empty crop");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(faces = faces.len(), "encoded image");
        Ok(faces)
    }
}
