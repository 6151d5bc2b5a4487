//! The embedding store: one row per registered face, halves stored as
//! fixed-arity points, nearest-neighbor retrieval over combined distance.

use crate::point::{self, PointError, POINT_BYTES, POINT_DIM};
use chrono::Utc;
use faceprint_core::{
    split_embedding, EmbeddingError, FaceRecord, LinearScanMatcher, MatchPolicy, MatchResult,
    Matcher,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open face database at {path}: {source}")]
    Connection {
        path: String,
        source: rusqlite::Error,
    },
    #[error("multidimensional point support unavailable: {0}")]
    Capability(rusqlite::Error),
    #[error(transparent)]
    InvalidEmbeddingLength(#[from] EmbeddingError),
    #[error("insert failed: {0}")]
    Insert(rusqlite::Error),
    #[error("query failed: {0}")]
    Query(rusqlite::Error),
    #[error("stored point is malformed: {0}")]
    MalformedPoint(#[from] PointError),
}

/// One hit from the indexed nearest-neighbor query.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: i64,
    pub label: String,
    /// Combined distance to the probe embedding.
    pub distance: f32,
}

/// Handle to the face database.
///
/// One handle per process or per request; a handle is not safe to share
/// across concurrent requests without external synchronization (the daemon
/// keeps its handle on a single engine thread).
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open (or create) the database file and register the point functions.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Connection {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::attach(conn)
    }

    /// Open an in-memory database (used by tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Connection {
            path: ":memory:".to_string(),
            source: e,
        })?;
        Self::attach(conn)
    }

    fn attach(conn: Connection) -> Result<Self, StoreError> {
        point::register_functions(&conn).map_err(StoreError::Capability)?;

        // Probe the capability so a connection that cannot evaluate point
        // distances fails here, not on the first recognition request.
        let zero = point::encode_point(&vec![0.0; POINT_DIM]);
        let _: f64 = conn
            .query_row("SELECT point_distance(?1, ?1)", params![zero], |row| row.get(0))
            .map_err(StoreError::Capability)?;

        Ok(Self { conn })
    }

    /// Destructive one-time setup: drop and recreate the face table and its
    /// composite index. Existing records are lost.
    pub fn initialize(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!(
                "DROP TABLE IF EXISTS faces;
                 CREATE TABLE faces (
                     id         INTEGER PRIMARY KEY AUTOINCREMENT,
                     label      TEXT NOT NULL,
                     vec_low    BLOB NOT NULL CHECK (length(vec_low)  = {POINT_BYTES}),
                     vec_high   BLOB NOT NULL CHECK (length(vec_high) = {POINT_BYTES}),
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX faces_vec_idx ON faces (vec_low, vec_high);"
            ))
            .map_err(StoreError::Query)?;
        tracing::info!("face table (re)initialized");
        Ok(())
    }

    /// Whether `initialize` has been run against this database.
    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'faces'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Query)?;
        Ok(name.is_some())
    }

    /// Insert one labeled embedding, returning the assigned record id.
    ///
    /// The vector length is validated before any SQL runs; an invalid
    /// length leaves the store untouched.
    pub fn insert(&mut self, label: &str, embedding: &[f32]) -> Result<i64, StoreError> {
        let (low, high) = split_embedding(embedding)?;
        self.conn
            .execute(
                "INSERT INTO faces (label, vec_low, vec_high, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    label,
                    point::encode_point(low),
                    point::encode_point(high),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(StoreError::Insert)?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, label, "inserted face record");
        Ok(id)
    }

    /// Insert every embedding of one registration inside a single
    /// transaction. Any failure rolls back the whole batch.
    pub fn insert_all(
        &mut self,
        label: &str,
        embeddings: &[Vec<f32>],
    ) -> Result<Vec<i64>, StoreError> {
        for embedding in embeddings {
            split_embedding(embedding)?;
        }

        let tx = self.conn.transaction().map_err(StoreError::Insert)?;
        let mut ids = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let (low, high) = split_embedding(embedding)?;
            tx.execute(
                "INSERT INTO faces (label, vec_low, vec_high, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    label,
                    point::encode_point(low),
                    point::encode_point(high),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(StoreError::Insert)?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit().map_err(StoreError::Insert)?;

        tracing::info!(label, records = ids.len(), "registered embeddings");
        Ok(ids)
    }

    /// Every stored record in id order, halves decoded and re-validated.
    pub fn all_records(&self) -> Result<Vec<FaceRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, vec_low, vec_high, created_at FROM faces ORDER BY id")
            .map_err(StoreError::Query)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(StoreError::Query)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, label, low_blob, high_blob, created_at) = row.map_err(StoreError::Query)?;
            records.push(FaceRecord {
                id,
                label,
                vec_low: point::decode_point(&low_blob)?,
                vec_high: point::decode_point(&high_blob)?,
                created_at,
            });
        }
        Ok(records)
    }

    /// Up to `k` records whose combined distance to the probe is within
    /// `max_distance`, closest first.
    ///
    /// Combined distance is the sum of the two half-space Euclidean
    /// distances — see `faceprint_core::combined_distance`.
    pub fn nearest(
        &self,
        embedding: &[f32],
        k: usize,
        max_distance: f32,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let (low, high) = split_embedding(embedding)?;
        let low_blob = point::encode_point(low);
        let high_blob = point::encode_point(high);

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, label,
                        point_distance(vec_low, ?1) + point_distance(vec_high, ?2) AS distance
                 FROM faces
                 WHERE point_distance(vec_low, ?1) + point_distance(vec_high, ?2) <= ?3
                 ORDER BY distance ASC
                 LIMIT ?4",
            )
            .map_err(StoreError::Query)?;

        let rows = stmt
            .query_map(
                params![low_blob, high_blob, max_distance as f64, k as i64],
                |row| {
                    Ok(Neighbor {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        distance: row.get::<_, f64>(2)? as f32,
                    })
                },
            )
            .map_err(StoreError::Query)?;

        let mut neighbors = Vec::new();
        for row in rows {
            neighbors.push(row.map_err(StoreError::Query)?);
        }
        Ok(neighbors)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM faces", [], |row| row.get(0))
            .map_err(StoreError::Query)?;
        Ok(n as u64)
    }

    /// Resolve a probe embedding to a stored identity under the given
    /// retrieval policy. Both policies evaluate the same combined-distance
    /// metric against the same ceiling; an empty store or an
    /// over-threshold best candidate is a non-match, never an error.
    pub fn find_match(
        &self,
        embedding: &[f32],
        policy: MatchPolicy,
        k: usize,
        max_distance: f32,
    ) -> Result<MatchResult, StoreError> {
        match policy {
            MatchPolicy::Indexed => {
                let neighbors = self.nearest(embedding, k, max_distance)?;
                Ok(match neighbors.into_iter().next() {
                    Some(n) => MatchResult {
                        matched: true,
                        distance: n.distance,
                        record_id: Some(n.id),
                        label: Some(n.label),
                    },
                    None => MatchResult::no_match(),
                })
            }
            MatchPolicy::LinearScan => {
                let records = self.all_records()?;
                Ok(LinearScanMatcher.compare(embedding, &records, max_distance)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceprint_core::EMBEDDING_DIM;

    fn store() -> FaceStore {
        let store = FaceStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn varied_embedding() -> Vec<f32> {
        (0..EMBEDDING_DIM).map(|i| i as f32 * 0.123 - 3.7).collect()
    }

    #[test]
    fn test_is_initialized_tracks_setup() {
        let store = FaceStore::open_in_memory().unwrap();
        assert!(!store.is_initialized().unwrap());
        store.initialize().unwrap();
        assert!(store.is_initialized().unwrap());
    }

    #[test]
    fn test_initialize_is_destructive() {
        let mut store = store();
        store.insert("alice", &varied_embedding()).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_roundtrips_exactly() {
        let mut store = store();
        let embedding = varied_embedding();
        let id = store.insert("alice", &embedding).unwrap();

        let records = store.all_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].label, "alice");
        // Bit-exact round trip of the concatenated halves.
        assert_eq!(records[0].embedding(), embedding);
        assert!(!records[0].created_at.is_empty());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut store = store();
        let a = store.insert("a", &varied_embedding()).unwrap();
        let b = store.insert("b", &varied_embedding()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_insert_rejects_wrong_length_without_mutation() {
        let mut store = store();
        let err = store.insert("alice", &vec![0.0; 127]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingLength(_)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_all_rejects_batch_with_bad_vector() {
        let mut store = store();
        let batch = vec![varied_embedding(), vec![0.0; 12]];
        assert!(store.insert_all("alice", &batch).is_err());
        // Nothing from the batch may land.
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_all_assigns_ids_in_order() {
        let mut store = store();
        let batch = vec![varied_embedding(), varied_embedding(), varied_embedding()];
        let ids = store.insert_all("bob", &batch).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_nearest_on_empty_store_returns_empty() {
        let store = store();
        let hits = store.nearest(&vec![0.0; EMBEDDING_DIM], 5, 10.0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_nearest_rejects_wrong_length() {
        let store = store();
        assert!(store.nearest(&vec![0.0; 64], 5, 10.0).is_err());
    }

    #[test]
    fn test_nearest_identical_embedding_has_distance_zero() {
        let mut store = store();
        let embedding = varied_embedding();
        store.insert("alice", &embedding).unwrap();

        let hits = store.nearest(&embedding, 1, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "alice");
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_nearest_respects_k_and_ceiling() {
        let mut store = store();
        // Ten embeddings at increasing combined distance from zero.
        for i in 0..10 {
            let mut e = vec![0.0f32; EMBEDDING_DIM];
            e[0] = i as f32 * 0.1;
            store.insert(&format!("p{i}"), &e).unwrap();
        }

        let probe = vec![0.0f32; EMBEDDING_DIM];
        let hits = store.nearest(&probe, 3, 0.45).unwrap();

        assert!(hits.len() <= 3);
        assert!(hits.iter().all(|h| h.distance <= 0.45));
        // Ascending order by combined distance.
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(hits[0].label, "p0");
    }

    #[test]
    fn test_nearest_discriminates_between_identities() {
        // Insert all-zeros as "alice" and all-ones as "bob"; a probe of
        // all 0.01 must resolve to alice and exclude bob entirely.
        let mut store = store();
        store.insert("alice", &vec![0.0; EMBEDDING_DIM]).unwrap();
        store.insert("bob", &vec![1.0; EMBEDDING_DIM]).unwrap();

        let probe = vec![0.01f32; EMBEDDING_DIM];
        let hits = store.nearest(&probe, 1, 1.0).unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "alice");
    }

    #[test]
    fn test_find_match_policies_agree() {
        let mut store = store();
        let embedding = varied_embedding();
        store.insert("alice", &embedding).unwrap();

        let indexed = store
            .find_match(&embedding, MatchPolicy::Indexed, 5, 0.4)
            .unwrap();
        let scanned = store
            .find_match(&embedding, MatchPolicy::LinearScan, 5, 0.4)
            .unwrap();

        assert!(indexed.matched && scanned.matched);
        assert_eq!(indexed.label, scanned.label);
        assert_eq!(indexed.record_id, scanned.record_id);
    }

    #[test]
    fn test_find_match_empty_store_is_no_match() {
        let store = store();
        let probe = vec![0.0f32; EMBEDDING_DIM];
        for policy in [MatchPolicy::Indexed, MatchPolicy::LinearScan] {
            let result = store.find_match(&probe, policy, 5, 0.4).unwrap();
            assert!(!result.matched);
            assert!(result.label.is_none());
        }
    }
}
