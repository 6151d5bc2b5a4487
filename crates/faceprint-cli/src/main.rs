use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceprint_core::{EncodingProvider, MatchPolicy, OnnxProvider, UNKNOWN_LABEL};
use faceprint_store::FaceStore;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceprint", about = "Faceprint registration and recognition CLI")]
struct Cli {
    /// Path to the SQLite database file (default: FACEPRINT_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory containing the ONNX model files (default: FACEPRINT_MODEL_DIR).
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// (Re)initialize the face database — drops all existing records
    Init,
    /// Register every face found in an image file
    Register {
        /// Image file to register faces from
        image: PathBuf,
        /// Name for the registered faces (default: a generated capture id)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Recognize faces in an image file
    Recognize {
        /// Image file to recognize faces in
        image: PathBuf,
        /// Retrieval policy: `indexed` or `scan`
        #[arg(long, default_value = "indexed")]
        policy: MatchPolicy,
        /// Combined-distance ceiling for a positive match
        #[arg(long, default_value_t = 0.4)]
        threshold: f32,
        /// Maximum candidates fetched by the indexed query
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List registered face records
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let model_dir = cli.models.unwrap_or_else(default_model_dir);

    match cli.command {
        Commands::Init => {
            let store = FaceStore::open(&db_path)
                .with_context(|| format!("failed to open {}", db_path.display()))?;
            if store.is_initialized()? {
                let dropped = store.count().unwrap_or(0);
                eprintln!("Reinitializing {} — dropping {dropped} existing record(s)", db_path.display());
            }
            store.initialize()?;
            println!("Initialized face database at {}", db_path.display());
        }
        Commands::Register { image, name } => {
            let label = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut store = open_initialized(&db_path)?;
            let mut provider = OnnxProvider::load(&model_dir)
                .with_context(|| format!("failed to load ONNX models from {}", model_dir.display()))?;

            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let faces = provider.encode_image(&bytes)?;
            if faces.is_empty() {
                bail!("no faces detected in {}", image.display());
            }

            let embeddings: Vec<Vec<f32>> = faces.into_iter().map(|f| f.embedding).collect();
            let ids = store.insert_all(&label, &embeddings)?;
            println!("Registered {} face(s) for {label}: record ids {ids:?}", ids.len());
        }
        Commands::Recognize {
            image,
            policy,
            threshold,
            limit,
        } => {
            let store = open_initialized(&db_path)?;
            let mut provider = OnnxProvider::load(&model_dir)
                .with_context(|| format!("failed to load ONNX models from {}", model_dir.display()))?;

            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let faces = provider.encode_image(&bytes)?;
            if faces.is_empty() {
                bail!("no faces detected in {}", image.display());
            }

            for face in &faces {
                let result = store.find_match(&face.embedding, policy, limit, threshold)?;
                match result.label {
                    Some(label) if result.matched => {
                        println!("{label} (distance {:.3})", result.distance)
                    }
                    _ => println!("{UNKNOWN_LABEL}"),
                }
            }
        }
        Commands::List => {
            let store = open_initialized(&db_path)?;
            let records = store.all_records()?;
            if records.is_empty() {
                println!("No faces registered");
            } else {
                for record in records {
                    println!("{:>6}  {:<36}  {}", record.id, record.label, record.created_at);
                }
            }
        }
    }

    Ok(())
}

fn open_initialized(db_path: &Path) -> Result<FaceStore> {
    let store = FaceStore::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    if !store.is_initialized()? {
        bail!(
            "face database at {} is not initialized — run `faceprint init` first",
            db_path.display()
        );
    }
    Ok(store)
}

fn default_db_path() -> PathBuf {
    std::env::var("FACEPRINT_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("faceprint/faces.db")
        })
}

fn default_model_dir() -> PathBuf {
    std::env::var("FACEPRINT_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| faceprint_core::default_model_dir())
}
