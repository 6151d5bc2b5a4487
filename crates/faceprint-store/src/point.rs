//! Fixed-arity multidimensional points for SQLite.
//!
//! Each embedding half is stored as a 64-component point: a BLOB of
//! little-endian `f32`s with the arity pinned both here and by a CHECK
//! constraint in the schema. `point_distance`, registered as a SQL scalar
//! function on every connection, gives the database Euclidean distance
//! over two such points.

use faceprint_core::{euclidean_distance, SPLIT_POINT};
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use thiserror::Error;

/// Components per stored point (one embedding half).
pub const POINT_DIM: usize = SPLIT_POINT;

/// Encoded size of a point in bytes.
pub const POINT_BYTES: usize = POINT_DIM * std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PointError {
    #[error("point blob must be {POINT_BYTES} bytes, got {0}")]
    InvalidLength(usize),
}

/// Encode a 64-component point as a little-endian `f32` BLOB.
pub fn encode_point(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<f32>());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a point BLOB back into its components, verifying the arity.
pub fn decode_point(blob: &[u8]) -> Result<Vec<f32>, PointError> {
    if blob.len() != POINT_BYTES {
        return Err(PointError::InvalidLength(blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Register the point functions on a connection.
///
/// `point_distance(a, b)` evaluates the Euclidean distance between two
/// point BLOBs; a malformed blob surfaces as a SQL error rather than a
/// silent wrong answer.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "point_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx.get::<Vec<u8>>(0)?;
            let b = ctx.get::<Vec<u8>>(1)?;
            let pa = decode_point(&a)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let pb = decode_point(&b)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(euclidean_distance(&pa, &pb) as f64)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_point_roundtrip_is_exact() {
        let values: Vec<f32> = (0..POINT_DIM).map(|i| i as f32 * 0.137 - 4.2).collect();
        let decoded = decode_point(&encode_point(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        assert_eq!(
            decode_point(&[0u8; POINT_BYTES - 1]),
            Err(PointError::InvalidLength(POINT_BYTES - 1))
        );
    }

    #[test]
    fn test_point_distance_sql_function() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let a = encode_point(&vec![0.0f32; POINT_DIM]);
        let mut ones = vec![0.0f32; POINT_DIM];
        ones[0] = 3.0;
        ones[1] = 4.0;
        let b = encode_point(&ones);

        let d: f64 = conn
            .query_row("SELECT point_distance(?1, ?2)", params![a, b], |row| row.get(0))
            .unwrap();
        assert!((d - 5.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_point_distance_rejects_malformed_blob() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let a = encode_point(&vec![0.0f32; POINT_DIM]);
        let result: rusqlite::Result<f64> = conn.query_row(
            "SELECT point_distance(?1, ?2)",
            params![a, vec![0u8; 7]],
            |row| row.get(0),
        );
        assert!(result.is_err());
    }
}
