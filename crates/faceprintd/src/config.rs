use faceprint_core::MatchPolicy;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// Combined-distance ceiling for a positive match.
    pub match_threshold: f32,
    /// Maximum candidates fetched by the indexed nearest-neighbor query.
    pub match_limit: usize,
    /// Retrieval policy used to resolve probe embeddings.
    pub match_policy: MatchPolicy,
    /// Directory for unknown-face JPEG artifacts (disabled when unset).
    pub unknown_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `FACEPRINT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEPRINT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| faceprint_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceprint");

        let db_path = std::env::var("FACEPRINT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        Self {
            db_path,
            model_dir,
            listen_addr: std::env::var("FACEPRINT_LISTEN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8092".to_string()),
            match_threshold: env_f32("FACEPRINT_MATCH_THRESHOLD", 0.40),
            match_limit: env_usize("FACEPRINT_MATCH_LIMIT", 5),
            match_policy: std::env::var("FACEPRINT_MATCH_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MatchPolicy::Indexed),
            unknown_dir: std::env::var("FACEPRINT_UNKNOWN_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
