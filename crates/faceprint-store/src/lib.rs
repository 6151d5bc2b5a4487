//! faceprint-store — Durable storage for labeled face embeddings.
//!
//! A 128-d embedding is split at a fixed point into two 64-d halves,
//! stored as fixed-arity point BLOBs with a composite index, and queried
//! by combined distance (sum of the two half-space Euclidean distances).

pub mod point;
pub mod store;

pub use point::{decode_point, encode_point, PointError, POINT_BYTES, POINT_DIM};
pub use store::{FaceStore, Neighbor, StoreError};
