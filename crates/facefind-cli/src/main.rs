mod config;
mod selfie;
mod status;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facefind_core::collection::PhotoFilter;
use facefind_core::{
    EncodingStore, FaceFinder, QueryOutcome, ResultMaterializer, ScanCoordinator, ScanOptions, Scope,
};
use facefind_vision::OnnxProvider;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facefind", version, about = "Find every photo of a person from one selfie")]
struct Cli {
    /// Collection root (overrides FACEFIND_COLLECTION_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Encoding store file (overrides FACEFIND_STORE_PATH)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Encoding workers (overrides FACEFIND_WORKERS)
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the encoding store up to date without querying
    Scan {
        /// Subfolder to scan; repeat for several. Defaults to all.
        #[arg(short, long = "subfolder")]
        subfolders: Vec<String>,
        /// Re-encode even already scanned subfolders
        #[arg(long)]
        force: bool,
    },
    /// Find and export every photo matching a selfie
    Find {
        /// Image containing the face to look for
        #[arg(long)]
        selfie: PathBuf,
        /// Key naming the output folder (e.g. a phone number)
        #[arg(short, long)]
        user: String,
        /// Subfolder to search; repeat for several. Defaults to all.
        #[arg(short, long = "subfolder")]
        subfolders: Vec<String>,
        /// Maximum face distance for a match (overrides FACEFIND_TOLERANCE)
        #[arg(short, long)]
        tolerance: Option<f32>,
        /// Re-encode the searched subfolders first
        #[arg(long)]
        force: bool,
        /// Keep a copy of the selfie in the selfie directory
        #[arg(long)]
        keep_selfie: bool,
    },
    /// Print per-subfolder store state as JSON
    Status,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(root) = cli.root {
        if cli.store.is_none() && std::env::var_os("FACEFIND_STORE_PATH").is_none() {
            config.store_path = root.join(".facefind-encodings.json");
        }
        config.collection_root = root;
    }
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }

    match cli.command {
        Commands::Scan { subfolders, force } => {
            let finder = build_finder(&config)?;
            let report = finder.scan(&scope(subfolders), force)?;
            for skip in &report.skipped {
                println!("skipped {}: {:?}", skip.id, skip.reason);
            }
            println!(
                "scanned {} subfolder(s): {} encoded, {} reused, {} skipped",
                report.merged.len(),
                report.encoded,
                report.reused,
                report.skipped.len()
            );
        }
        Commands::Find {
            selfie,
            user,
            subfolders,
            tolerance,
            force,
            keep_selfie,
        } => {
            let selfie = if keep_selfie {
                selfie::retain(&config.selfie_dir, &user, &selfie)
                    .with_context(|| format!("storing selfie in {}", config.selfie_dir.display()))?
            } else {
                selfie
            };
            let tolerance = tolerance.unwrap_or(config.tolerance);
            let finder = build_finder(&config)?;

            match finder.run_query(&scope(subfolders), force, &selfie, &user, tolerance)? {
                QueryOutcome::Found {
                    matches,
                    previews,
                    archive,
                } => {
                    for (entry, preview) in matches.iter().zip(&previews) {
                        println!("{:.4}  {}  -> {}", entry.distance, entry.id, preview.display());
                    }
                    println!("{} photo(s) found, archive: {}", matches.len(), archive.display());
                }
                QueryOutcome::NoFaceDetected => {
                    eprintln!("no face detected in {}", selfie.display());
                    return Ok(ExitCode::from(2));
                }
                QueryOutcome::EmptyResult => {
                    println!("no matching photos");
                    return Ok(ExitCode::from(1));
                }
            }
        }
        Commands::Status => {
            let store = EncodingStore::load(&config.store_path)?;
            let report = status::collect(&store, &config.collection_root)
                .with_context(|| format!("listing {}", config.collection_root.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn scope(subfolders: Vec<String>) -> Scope {
    if subfolders.is_empty() {
        Scope::All
    } else {
        Scope::Subfolders(subfolders.into_iter().collect())
    }
}

fn build_finder(config: &Config) -> Result<FaceFinder<OnnxProvider>> {
    let intra_threads = config.intra_threads();
    let providers = (0..config.workers)
        .map(|_| OnnxProvider::load(&config.model_dir, intra_threads))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;
    tracing::info!(
        workers = providers.len(),
        intra_threads,
        root = %config.collection_root.display(),
        "face models ready"
    );

    let options = ScanOptions {
        filter: PhotoFilter::new(&config.extensions),
        permanent_no_face: config.permanent_no_face,
    };
    let coordinator = ScanCoordinator::open(
        &config.collection_root,
        &config.store_path,
        config.on_corrupt,
        providers,
        options,
    )?;
    Ok(FaceFinder::new(
        coordinator,
        ResultMaterializer::new(&config.output_dir),
    ))
}
