use facefind_core::collection;
use facefind_core::store::ScanSummary;
use facefind_core::{EncodingStore, SubfolderState};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub root: &'a Path,
    pub store: &'a Path,
    pub dimension: Option<usize>,
    pub photos: usize,
    pub faces: usize,
    pub subfolders: Vec<SubfolderStatus<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SubfolderStatus<'a> {
    Unscanned {
        name: String,
    },
    Scanned {
        name: String,
        /// False once the directory has disappeared from the collection.
        present: bool,
        records: usize,
        #[serde(flatten)]
        summary: &'a ScanSummary,
    },
}

/// Every subfolder on disk or in the store, with its scan state.
pub fn collect<'a>(store: &'a EncodingStore, root: &'a Path) -> io::Result<StatusReport<'a>> {
    let on_disk = match collection::list_subfolders(root) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
        Err(e) => return Err(e),
    };
    let names: BTreeSet<String> = on_disk
        .iter()
        .cloned()
        .chain(store.scanned_subfolders().map(|(name, _)| name.to_string()))
        .collect();

    let subfolders = names
        .into_iter()
        .map(|name| match store.subfolder_state(&name) {
            SubfolderState::Unscanned => SubfolderStatus::Unscanned { name },
            SubfolderState::Scanned(summary) => SubfolderStatus::Scanned {
                present: on_disk.contains(&name),
                records: store.records_in(&name).count(),
                summary,
                name,
            },
        })
        .collect();

    Ok(StatusReport {
        root,
        store: store.path(),
        dimension: store.dimension(),
        photos: store.photo_count(),
        faces: store.face_count(),
        subfolders,
    })
}
