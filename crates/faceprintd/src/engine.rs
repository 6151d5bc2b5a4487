use faceprint_core::{EncodingProvider, FaceRegion, MatchPolicy, ProviderError, UNKNOWN_LABEL};
use faceprint_store::{FaceStore, StoreError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Matching parameters the engine applies to every recognition request.
#[derive(Clone)]
pub struct EngineSettings {
    pub policy: MatchPolicy,
    pub match_threshold: f32,
    pub match_limit: usize,
    pub unknown_dir: Option<PathBuf>,
}

/// Daemon status snapshot.
pub struct EngineStatus {
    pub records: u64,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<i64>, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request registration: encode every face in the image and store the
    /// embeddings under the given name.
    pub async fn register(&self, name: String, image: Vec<u8>) -> Result<Vec<i64>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                name,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request recognition: encode every face in the image and resolve each
    /// to a stored label or `Unknown`.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Vec<String>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request a status snapshot.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns both the ONNX sessions and the store connection, so
/// requests are processed one at a time with no shared mutable state.
/// A failed request is answered and the loop continues; only dropping
/// every handle ends the thread.
pub fn spawn_engine<P>(provider: P, store: FaceStore, settings: EngineSettings) -> EngineHandle
where
    P: EncodingProvider + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceprint-engine".into())
        .spawn(move || {
            let mut provider = provider;
            let mut store = store;
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { name, image, reply } => {
                        let result = run_register(&mut provider, &mut store, &name, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { image, reply } => {
                        let result = run_recognize(&mut provider, &store, &settings, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let result = store
                            .count()
                            .map(|records| EngineStatus { records })
                            .map_err(EngineError::Store);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

/// Encode every face in the image and insert the embeddings in one
/// transaction. Zero detected faces means nothing is written.
pub fn run_register<P: EncodingProvider>(
    provider: &mut P,
    store: &mut FaceStore,
    name: &str,
    image: &[u8],
) -> Result<Vec<i64>, EngineError> {
    let faces = provider.encode_image(image)?;
    if faces.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }

    let embeddings: Vec<Vec<f32>> = faces.into_iter().map(|f| f.embedding).collect();
    let ids = store.insert_all(name, &embeddings)?;

    tracing::info!(name, records = ids.len(), "register: embeddings stored");
    Ok(ids)
}

/// Encode every face in the image and resolve each to a stored label via
/// the configured retrieval policy, or `Unknown` when nothing is close
/// enough. Unknown faces optionally leave a JPEG artifact behind.
pub fn run_recognize<P: EncodingProvider>(
    provider: &mut P,
    store: &FaceStore,
    settings: &EngineSettings,
    image: &[u8],
) -> Result<Vec<String>, EngineError> {
    let faces = provider.encode_image(image)?;
    if faces.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }

    let mut labels = Vec::with_capacity(faces.len());
    let mut unknown_regions = Vec::new();

    for face in &faces {
        let result = store.find_match(
            &face.embedding,
            settings.policy,
            settings.match_limit,
            settings.match_threshold,
        )?;
        match result.label {
            Some(label) if result.matched => {
                tracing::info!(label = %label, distance = result.distance, "face recognized");
                labels.push(label);
            }
            _ => {
                tracing::info!(distance = result.distance, "face not recognized");
                labels.push(UNKNOWN_LABEL.to_string());
                unknown_regions.push(face.region.clone());
            }
        }
    }

    // Artifact failures are logged, never propagated; recognition already
    // succeeded from the caller's point of view.
    if let Some(dir) = &settings.unknown_dir {
        if !unknown_regions.is_empty() {
            if let Err(err) = save_unknown_artifacts(dir, image, &unknown_regions) {
                tracing::warn!(error = %err, "failed to save unknown-face artifacts");
            }
        }
    }

    Ok(labels)
}

/// Write one JPEG crop per unidentified face into the artifact directory,
/// for whatever notification channel is attached externally.
fn save_unknown_artifacts(
    dir: &Path,
    image: &[u8],
    regions: &[FaceRegion],
) -> anyhow::Result<()> {
    let rgb = image::load_from_memory(image)?.to_rgb8();
    std::fs::create_dir_all(dir)?;

    for (i, region) in regions.iter().enumerate() {
        let x1 = region.x.max(0.0) as u32;
        let y1 = region.y.max(0.0) as u32;
        let x2 = ((region.x + region.width) as u32).min(rgb.width());
        let y2 = ((region.y + region.height) as u32).min(rgb.height());
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let crop = image::imageops::crop_imm(&rgb, x1, y1, x2 - x1, y2 - y1).to_image();
        let path = dir.join(format!("unknown-{}-{i}.jpg", uuid::Uuid::new_v4()));
        crop.save(&path)?;
        tracing::info!(path = %path.display(), "saved unknown-face artifact");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceprint_core::{DetectedFace, EMBEDDING_DIM};

    /// Provider stub returning a fixed set of faces for any image.
    struct StubProvider {
        faces: Vec<DetectedFace>,
    }

    impl EncodingProvider for StubProvider {
        fn encode_image(&mut self, _image: &[u8]) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(self.faces.clone())
        }
    }

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            region: FaceRegion {
                x: 4.0,
                y: 4.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.9,
            },
            embedding,
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            policy: MatchPolicy::Indexed,
            match_threshold: 0.4,
            match_limit: 5,
            unknown_dir: None,
        }
    }

    fn store() -> FaceStore {
        let store = FaceStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    /// A tiny valid PNG for requests that decode the upload.
    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([90, 90, 90]));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_register_zero_faces_writes_nothing() {
        let mut provider = StubProvider { faces: vec![] };
        let mut store = store();

        let err = run_register(&mut provider, &mut store, "alice", b"img").unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_register_then_recognize_roundtrip() {
        let embedding = vec![0.3f32; EMBEDDING_DIM];
        let mut provider = StubProvider {
            faces: vec![face(embedding.clone())],
        };
        let mut store = store();

        let ids = run_register(&mut provider, &mut store, "alice", b"img").unwrap();
        assert_eq!(ids.len(), 1);

        let labels = run_recognize(&mut provider, &store, &settings(), b"img").unwrap();
        assert_eq!(labels, vec!["alice".to_string()]);
    }

    #[test]
    fn test_recognize_empty_store_reports_unknown() {
        let mut provider = StubProvider {
            faces: vec![face(vec![0.5f32; EMBEDDING_DIM])],
        };
        let store = store();

        let labels = run_recognize(&mut provider, &store, &settings(), b"img").unwrap();
        assert_eq!(labels, vec![UNKNOWN_LABEL.to_string()]);
    }

    #[test]
    fn test_recognize_zero_faces_is_an_error() {
        let mut provider = StubProvider { faces: vec![] };
        let store = store();

        let err = run_recognize(&mut provider, &store, &settings(), b"img").unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
    }

    #[test]
    fn test_recognize_mixed_known_and_unknown() {
        let known = vec![0.2f32; EMBEDDING_DIM];
        let stranger = vec![5.0f32; EMBEDDING_DIM];
        let mut provider = StubProvider {
            faces: vec![face(known.clone()), face(stranger)],
        };
        let mut store = store();
        store.insert("bob", &known).unwrap();

        let labels = run_recognize(&mut provider, &store, &settings(), b"img").unwrap();
        assert_eq!(labels, vec!["bob".to_string(), UNKNOWN_LABEL.to_string()]);
    }

    #[test]
    fn test_recognize_policies_agree_on_stub_data() {
        let known = vec![0.2f32; EMBEDDING_DIM];
        let mut provider = StubProvider {
            faces: vec![face(known.clone())],
        };
        let mut store = store();
        store.insert("carol", &known).unwrap();

        for policy in [MatchPolicy::Indexed, MatchPolicy::LinearScan] {
            let s = EngineSettings {
                policy,
                ..settings()
            };
            let labels = run_recognize(&mut provider, &store, &s, b"img").unwrap();
            assert_eq!(labels, vec!["carol".to_string()]);
        }
    }

    #[test]
    fn test_unknown_face_leaves_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = StubProvider {
            faces: vec![face(vec![0.5f32; EMBEDDING_DIM])],
        };
        let store = store();
        let s = EngineSettings {
            unknown_dir: Some(dir.path().to_path_buf()),
            ..settings()
        };

        let labels = run_recognize(&mut provider, &store, &s, &png_bytes()).unwrap();
        assert_eq!(labels, vec![UNKNOWN_LABEL.to_string()]);

        let artifacts: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn test_artifact_failure_does_not_fail_recognition() {
        // Undecodable image bytes: the artifact step fails, the request
        // must still succeed.
        let dir = tempfile::tempdir().unwrap();
        let mut provider = StubProvider {
            faces: vec![face(vec![0.5f32; EMBEDDING_DIM])],
        };
        let store = store();
        let s = EngineSettings {
            unknown_dir: Some(dir.path().to_path_buf()),
            ..settings()
        };

        let labels = run_recognize(&mut provider, &store, &s, b"not an image").unwrap();
        assert_eq!(labels, vec![UNKNOWN_LABEL.to_string()]);
    }
}
