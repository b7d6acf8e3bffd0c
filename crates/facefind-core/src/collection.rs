//! Photo collection layout: `<root>/<subfolder>/<photo>`.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Extensions treated as photos when none are configured.
pub const DEFAULT_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tiff"];

/// Case-insensitive extension filter for photo files.
#[derive(Debug, Clone)]
pub struct PhotoFilter {
    extensions: BTreeSet<String>,
}

impl PhotoFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') {
            return false;
        }
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }
}

impl Default for PhotoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

/// Immediate, non-hidden subdirectories of the collection root.
///
/// Symlinks are followed, as in [`list_photos`]. Entries that cannot be
/// inspected are logged and left out.
pub fn list_subfolders(root: &Path) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "skipping unreadable collection entry");
                continue;
            }
        };
        match fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable collection entry");
                continue;
            }
        }
        match entry.file_name().into_string() {
            Ok(name) if !name.starts_with('.') => {
                names.insert(name);
            }
            Ok(_) => {}
            Err(raw) => tracing::warn!(name = ?raw, "skipping subfolder with non UTF-8 name"),
        }
    }
    Ok(names)
}

/// Photo file names directly inside `<root>/<subfolder>`, sorted.
///
/// Only the subfolder itself failing is an error. A single entry that
/// cannot be read, such as a dangling symlink, is logged and skipped.
pub fn list_photos(root: &Path, subfolder: &str, filter: &PhotoFilter) -> io::Result<Vec<String>> {
    let dir = root.join(subfolder);
    if !fs::metadata(&dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let mut photos = Vec::new();
    for entry in WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(subfolder, error = %e, "skipping unreadable photo entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            tracing::warn!(subfolder, name = ?entry.file_name(), "skipping photo with non UTF-8 name");
            continue;
        };
        if filter.accepts(name) {
            photos.push(name.to_string());
        }
    }
    Ok(photos)
}
