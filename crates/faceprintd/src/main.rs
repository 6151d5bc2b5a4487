use anyhow::{bail, Context, Result};
use faceprint_core::OnnxProvider;
use faceprint_store::FaceStore;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceprintd starting");

    let config = config::Config::from_env();

    // Connection failure at startup is fatal; the daemon must not serve
    // without its store.
    let store = FaceStore::open(&config.db_path)
        .with_context(|| format!("failed to connect to face database at {}", config.db_path.display()))?;

    if !store.is_initialized()? {
        bail!(
            "face database at {} is not initialized — run `faceprint init` first",
            config.db_path.display()
        );
    }

    let provider = OnnxProvider::load(&config.model_dir)
        .with_context(|| format!("failed to load ONNX models from {}", config.model_dir.display()))?;

    let engine = engine::spawn_engine(
        provider,
        store,
        engine::EngineSettings {
            policy: config.match_policy,
            match_threshold: config.match_threshold,
            match_limit: config.match_limit,
            unknown_dir: config.unknown_dir.clone(),
        },
    );

    let app = server::create_app(server::AppState {
        engine,
        policy: config.match_policy,
        threshold: config.match_threshold,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        addr = %config.listen_addr,
        db = %config.db_path.display(),
        policy = config.match_policy.as_str(),
        threshold = config.match_threshold,
        "faceprintd ready"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
