//! faceprint-core — Embedding math and the face encoding pipeline.
//!
//! Uses UltraFace for face detection and a 128-d embedding network for
//! recognition, both running via ONNX Runtime for CPU inference. Also
//! defines the split/combined-distance math the store and matchers share.

pub mod detector;
pub mod embedder;
pub mod provider;
pub mod types;

pub use provider::{DetectedFace, EncodingProvider, OnnxProvider, ProviderError};
pub use types::{
    combined_distance, euclidean_distance, split_embedding, EmbeddingError, FaceRecord,
    FaceRegion, LinearScanMatcher, MatchPolicy, MatchResult, Matcher, EMBEDDING_DIM, SPLIT_POINT,
    UNKNOWN_LABEL,
};

use std::path::PathBuf;

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/faceprint/models")
}
