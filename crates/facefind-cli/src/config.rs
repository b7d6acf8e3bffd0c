use anyhow::{Context, Result};
use facefind_core::collection::DEFAULT_EXTENSIONS;
use facefind_core::{CorruptPolicy, DEFAULT_TOLERANCE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the store file inside the collection root.
const STORE_FILE: &str = ".facefind-encodings.json";
const MAX_DEFAULT_WORKERS: usize = 4;

/// Optional settings file named by `FACEFIND_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub collection_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub selfie_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub tolerance: Option<f32>,
    pub workers: Option<usize>,
    pub extensions: Option<Vec<String>>,
    pub permanent_no_face: Option<bool>,
    pub on_corrupt: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Runtime configuration: `FACEFIND_*` variables over the config file over defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collection root holding one directory per subfolder.
    pub collection_root: PathBuf,
    /// Base directory for per-user exports.
    pub output_dir: PathBuf,
    /// Where retained selfies are written.
    pub selfie_dir: PathBuf,
    pub store_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a match.
    pub tolerance: f32,
    /// Encoding workers, each with its own model sessions.
    pub workers: usize,
    pub extensions: Vec<String>,
    /// Never retry photos in which no face was found.
    pub permanent_no_face: bool,
    pub on_corrupt: CorruptPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let file = match std::env::var_os("FACEFIND_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Layer `env` over `file` over defaults.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let collection_root = env("FACEFIND_COLLECTION_ROOT")
            .map(PathBuf::from)
            .or(file.collection_root)
            .unwrap_or_else(|| PathBuf::from("all_photos"));

        let store_path = env("FACEFIND_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| collection_root.join(STORE_FILE));

        let extensions = env("FACEFIND_EXTENSIONS")
            .map(|v| v.split(',').map(|e| e.trim().to_string()).filter(|e| !e.is_empty()).collect())
            .or(file.extensions)
            .unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect());

        let on_corrupt = env("FACEFIND_ON_CORRUPT")
            .or(file.on_corrupt)
            .map(|v| {
                v.parse().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "ignoring corrupt-store policy");
                    CorruptPolicy::default()
                })
            })
            .unwrap_or_default();

        Self {
            output_dir: env("FACEFIND_OUTPUT_DIR")
                .map(PathBuf::from)
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from("sorted_user_photos")),
            selfie_dir: env("FACEFIND_SELFIE_DIR")
                .map(PathBuf::from)
                .or(file.selfie_dir)
                .unwrap_or_else(|| PathBuf::from("user_selfies")),
            model_dir: env("FACEFIND_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(facefind_vision::default_model_dir),
            tolerance: env_parse(&env, "FACEFIND_TOLERANCE")
                .or(file.tolerance)
                .unwrap_or(DEFAULT_TOLERANCE),
            workers: env_parse(&env, "FACEFIND_WORKERS")
                .or(file.workers)
                .unwrap_or_else(default_workers)
                .max(1),
            permanent_no_face: env("FACEFIND_PERMANENT_NO_FACE")
                .map(|v| v != "0")
                .or(file.permanent_no_face)
                .unwrap_or(false),
            collection_root,
            store_path,
            extensions,
            on_corrupt,
        }
    }

    /// Intra-op threads per ONNX session, so the pool does not oversubscribe the CPU.
    pub fn intra_threads(&self) -> usize {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        (cores / self.workers).clamp(1, 2)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}
