use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of components in a face embedding.
pub const EMBEDDING_DIM: usize = 128;

/// Index at which an embedding is split into its low and high halves.
///
/// The same constant drives the write path (insert splits here) and the
/// read path (stored halves are re-joined here), so the two can never
/// drift apart.
pub const SPLIT_POINT: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding must have exactly {EMBEDDING_DIM} components, got {0}")]
    InvalidLength(usize),
}

/// Split a 128-component embedding into its 64-component halves.
pub fn split_embedding(values: &[f32]) -> Result<(&[f32], &[f32]), EmbeddingError> {
    if values.len() != EMBEDDING_DIM {
        return Err(EmbeddingError::InvalidLength(values.len()));
    }
    Ok(values.split_at(SPLIT_POINT))
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Combined distance between two 128-component embeddings: the Euclidean
/// distance over the low halves plus the Euclidean distance over the high
/// halves.
///
/// This is NOT the 128-d Euclidean distance (that would be
/// `sqrt(d_low^2 + d_high^2)`). The summed form is what the match
/// thresholds are tuned against; see DESIGN.md before changing it.
pub fn combined_distance(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    let (a_low, a_high) = split_embedding(a)?;
    let (b_low, b_high) = split_embedding(b)?;
    Ok(euclidean_distance(a_low, b_low) + euclidean_distance(a_high, b_high))
}

/// Rectangular face region in pixel coordinates, from the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A stored face record: one row per registered embedding.
///
/// Records are immutable after insertion; there is no update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: i64,
    pub label: String,
    /// First 64 components of the embedding.
    pub vec_low: Vec<f32>,
    /// Remaining 64 components of the embedding.
    pub vec_high: Vec<f32>,
    pub created_at: String,
}

impl FaceRecord {
    /// Re-join the stored halves into the original 128-component embedding.
    pub fn embedding(&self) -> Vec<f32> {
        let mut values = Vec::with_capacity(EMBEDDING_DIM);
        values.extend_from_slice(&self.vec_low);
        values.extend_from_slice(&self.vec_high);
        values
    }
}

/// Result of matching a probe embedding against stored records.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Combined distance of the best candidate (0.0 when the store was empty).
    pub distance: f32,
    /// Id of the matched record (if any).
    pub record_id: Option<i64>,
    /// Label of the matched record (if any).
    pub label: Option<String>,
}

impl MatchResult {
    /// A non-match with no candidate at all (empty store).
    pub fn no_match() -> Self {
        Self {
            matched: false,
            distance: 0.0,
            record_id: None,
            label: None,
        }
    }
}

/// Label reported for a face that matches no stored identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Retrieval policy for resolving a probe embedding to a stored identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Index-assisted nearest-neighbor query in the store (canonical).
    Indexed,
    /// Full scan with in-process comparison.
    LinearScan,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::LinearScan => "scan",
        }
    }
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexed" => Ok(Self::Indexed),
            "scan" => Ok(Self::LinearScan),
            other => Err(format!("unknown match policy: {other} (expected `indexed` or `scan`)")),
        }
    }
}

/// Strategy for comparing a probe embedding against a set of stored records.
pub trait Matcher {
    fn compare(
        &self,
        probe: &[f32],
        records: &[FaceRecord],
        max_distance: f32,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Full-scan matcher over combined distance.
///
/// Always iterates ALL records, no early exit, so traversal cost does not
/// leak gallery size or match position.
pub struct LinearScanMatcher;

impl Matcher for LinearScanMatcher {
    fn compare(
        &self,
        probe: &[f32],
        records: &[FaceRecord],
        max_distance: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        split_embedding(probe)?;

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, record) in records.iter().enumerate() {
            let distance = combined_distance(probe, &record.embedding())?;
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_distance <= max_distance => MatchResult {
                matched: true,
                distance: best_distance,
                record_id: Some(records[idx].id),
                label: Some(records[idx].label.clone()),
            },
            Some(_) => MatchResult {
                matched: false,
                distance: best_distance,
                record_id: None,
                label: None,
            },
            None => MatchResult::no_match(),
        })
    }
}
