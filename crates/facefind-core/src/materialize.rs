//! Export of matched photos into a per-user folder plus a zip archive.
//!
//! Every run builds the complete output in a staging directory next to the
//! user's folder and swaps it in only once all copies and the archive are
//! written. A failed run leaves the previous output exactly as it was and
//! names the photo that could not be copied.

use crate::types::{MatchResult, PhotoId};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Folder used when the user key sanitises to nothing.
pub const UNKNOWN_USER_DIR: &str = "unknown_user";

static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static SEPARATOR_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-\s]+").expect("valid regex"));

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("could not copy {id}: {source}")]
    CopyFailure {
        id: PhotoId,
        #[source]
        source: io::Error,
    },
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("output I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A completed export.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub folder: PathBuf,
    /// Exported copies, closest match first.
    pub previews: Vec<PathBuf>,
    pub archive: PathBuf,
}

/// Turn a user-supplied key into a safe folder name.
///
/// Keeps word characters, whitespace and hyphens, then collapses runs of
/// whitespace and hyphens into a single hyphen.
pub fn sanitize_folder_name(key: &str) -> String {
    let kept = DISALLOWED.replace_all(key, "");
    let collapsed = SEPARATOR_RUNS.replace_all(kept.trim(), "-");
    if collapsed.is_empty() {
        UNKNOWN_USER_DIR.to_string()
    } else {
        collapsed.into_owned()
    }
}

pub struct ResultMaterializer {
    output_root: PathBuf,
}

impl ResultMaterializer {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn user_folder(&self, user_key: &str) -> PathBuf {
        self.output_root.join(sanitize_folder_name(user_key))
    }

    /// Replace the user's folder with copies of `matches` and an archive of them.
    pub fn materialize(
        &self,
        user_key: &str,
        matches: &MatchResult,
        source_root: &Path,
    ) -> Result<Materialized, MaterializeError> {
        let folder_name = sanitize_folder_name(user_key);
        let folder = self.output_root.join(&folder_name);
        fs::create_dir_all(&self.output_root).map_err(io_error(&self.output_root))?;

        let staging = self.output_root.join(format!(
            ".{folder_name}.staging-{}",
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir(&staging).map_err(io_error(&staging))?;

        let archive_name = format!("{folder_name}.zip");
        let names = output_names(matches, &archive_name);

        let staged = stage(&staging, matches, &names, &archive_name, source_root);
        if let Err(e) = staged {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
            }
            return Err(e);
        }

        swap_in(&staging, &folder)?;

        tracing::info!(
            folder = %folder.display(),
            photos = names.len(),
            "results exported"
        );
        Ok(Materialized {
            previews: names.iter().map(|n| folder.join(n)).collect(),
            archive: folder.join(&archive_name),
            folder,
        })
    }

    /// Remove the user's previous output, if any.
    pub fn clear(&self, user_key: &str) -> Result<(), MaterializeError> {
        let folder = self.user_folder(user_key);
        match fs::remove_dir_all(&folder) {
            Ok(()) => {
                tracing::info!(folder = %folder.display(), "previous results cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MaterializeError::Io { path: folder, source }),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MaterializeError {
    let path = path.to_path_buf();
    move |source| MaterializeError::Io { path, source }
}

/// Copy every match into `staging`, then archive exactly those copies.
fn stage(
    staging: &Path,
    matches: &MatchResult,
    names: &[String],
    archive_name: &str,
    source_root: &Path,
) -> Result<(), MaterializeError> {
    for (entry, name) in matches.iter().zip(names) {
        fs::copy(entry.id.source_path(source_root), staging.join(name)).map_err(|source| {
            tracing::error!(id = %entry.id, error = %source, "copy failed, export rolled back");
            MaterializeError::CopyFailure {
                id: entry.id.clone(),
                source,
            }
        })?;
    }
    write_archive(&staging.join(archive_name), staging, names)
}

fn write_archive(path: &Path, dir: &Path, names: &[String]) -> Result<(), MaterializeError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut zip = zip::ZipWriter::new(file);
    // Photos are already compressed.
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(true);

    for name in names {
        zip.start_file(name.as_str(), options)?;
        let copy = dir.join(name);
        let mut src = File::open(&copy).map_err(io_error(&copy))?;
        io::copy(&mut src, &mut zip).map_err(io_error(path))?;
    }
    let file = zip.finish()?;
    file.sync_all().map_err(io_error(path))
}

/// Move `staging` into place as `folder`, replacing any previous output.
fn swap_in(staging: &Path, folder: &Path) -> Result<(), MaterializeError> {
    let retired = folder.with_file_name(format!(
        ".{}.old-{}",
        folder.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));
    let had_previous = match fs::rename(folder, &retired) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(source) => {
            let _ = fs::remove_dir_all(staging);
            return Err(MaterializeError::Io {
                path: folder.to_path_buf(),
                source,
            });
        }
    };

    if let Err(source) = fs::rename(staging, folder) {
        if had_previous {
            restore_previous(&retired, folder);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(MaterializeError::Io {
            path: folder.to_path_buf(),
            source,
        });
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(&retired) {
            tracing::warn!(path = %retired.display(), error = %e, "failed to remove previous results");
        }
    }
    Ok(())
}

/// Put the retired output back. If another export has taken `folder`
/// meanwhile, the retired copy is discarded instead of left behind.
fn restore_previous(retired: &Path, folder: &Path) {
    if let Err(e) = fs::rename(retired, folder) {
        tracing::warn!(
            folder = %folder.display(),
            retired = %retired.display(),
            error = %e,
            "could not restore previous results, discarding them"
        );
        if let Err(e) = fs::remove_dir_all(retired) {
            tracing::warn!(path = %retired.display(), error = %e, "failed to remove previous results");
        }
    }
}

/// Output file name for each match, in match order.
///
/// A file name shared by photos from different subfolders is qualified with
/// the subfolder (`<subfolder>_<file>`) for every photo carrying it. Names
/// are compared case-insensitively; any remaining clash gets a `-N` suffix.
fn output_names(matches: &MatchResult, reserved: &str) -> Vec<String> {
    let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
    for entry in matches.iter() {
        *occurrences.entry(entry.id.file_name().to_lowercase()).or_default() += 1;
    }

    let mut used = BTreeSet::from([reserved.to_lowercase()]);
    matches
        .iter()
        .map(|entry| {
            let file_name = entry.id.file_name();
            let base = if occurrences[&file_name.to_lowercase()] > 1 {
                format!("{}_{}", entry.id.subfolder(), file_name)
            } else {
                file_name.to_string()
            };
            let mut candidate = base.clone();
            let mut n = 1;
            while used.contains(&candidate.to_lowercase()) {
                n += 1;
                candidate = numbered(&base, n);
            }
            used.insert(candidate.to_lowercase());
            candidate
        })
        .collect()
}

fn numbered(name: &str, n: usize) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    match path.extension() {
        Some(ext) => format!("{stem}-{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{n}"),
    }
}
