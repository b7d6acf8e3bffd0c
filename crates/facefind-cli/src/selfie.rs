use facefind_core::materialize::sanitize_folder_name;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Copy `selfie` into `selfie_dir` as `uploaded_selfie_<user>_<tag>.<ext>`.
pub fn retain(selfie_dir: &Path, user_key: &str, selfie: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(selfie_dir)?;
    let ext = selfie
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("jpg");
    let tag = Uuid::new_v4().simple().to_string();
    let dest = selfie_dir.join(format!(
        "uploaded_selfie_{}_{}.{ext}",
        sanitize_folder_name(user_key),
        &tag[..8]
    ));
    fs::copy(selfie, &dest)?;
    tracing::debug!(from = %selfie.display(), to = %dest.display(), "selfie retained");
    Ok(dest)
}
