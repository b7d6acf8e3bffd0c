//! Persistent face encoding cache.
//!
//! The store is the union of independently scanned subfolders. A merge only
//! ever replaces the subfolders it was given, and persistence writes a
//! complete new file before swapping it over the old one, so a reader sees
//! either the previous state or the new one and nothing in between.
//!
//! On-disk layout is one header line followed by the JSON body:
//!
//! ```text
//! {"format":"facefind-encodings","version":1,"dimension":512,"records":N,"checksum":"<sha256 of body>"}
//! {"records":{"A/1.jpg":[[...512 floats...]]},"subfolders":{"A":{...}}}
//! ```

use crate::types::{Embedding, EncodingRecord, PhotoId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const STORE_FORMAT: &str = "facefind-encodings";
pub const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corrupt encoding store {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("embedding for {id} has {actual} dimensions, store holds {expected}")]
    DimensionMismatch {
        id: PhotoId,
        expected: usize,
        actual: usize,
    },
    #[error("store I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What to do when the persisted store cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptPolicy {
    /// Surface [`StoreError::Corrupt`] and leave the file alone.
    #[default]
    Abort,
    /// Move the bad file aside and start from an empty store.
    Rebuild,
}

impl FromStr for CorruptPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "rebuild" => Ok(Self::Rebuild),
            other => Err(format!("unknown corrupt-store policy {other:?} (expected abort or rebuild)")),
        }
    }
}

/// Outcome of the last successful scan of one subfolder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scanned_at: DateTime<Utc>,
    /// Photo files present when the scan ran.
    pub photos: usize,
    /// Photos whose encoding failed; retried on the next scan.
    #[serde(default)]
    pub failed: BTreeSet<String>,
    /// Photos in which no face was detected.
    #[serde(default)]
    pub no_face: BTreeSet<String>,
}

/// Scan state of a subfolder as recorded by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubfolderState<'a> {
    Unscanned,
    Scanned(&'a ScanSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoreBody {
    records: BTreeMap<PhotoId, Vec<Embedding>>,
    subfolders: BTreeMap<String, ScanSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    format: String,
    version: u32,
    dimension: Option<usize>,
    records: usize,
    checksum: String,
}

/// Records of the store restricted to a query scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingSet {
    records: BTreeMap<PhotoId, Vec<Embedding>>,
}

impl WorkingSet {
    pub fn from_records(records: impl IntoIterator<Item = EncodingRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.records.entry(record.id).or_default().push(record.embedding);
        }
        set
    }

    /// Number of photos (not faces) in the set.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &PhotoId) -> Option<&[Embedding]> {
        self.records.get(id).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PhotoId, &[Embedding])> {
        self.records.iter().map(|(id, faces)| (id, faces.as_slice()))
    }
}

/// The encoding cache for one collection root.
#[derive(Debug, Clone)]
pub struct EncodingStore {
    path: PathBuf,
    body: StoreBody,
    dimension: Option<usize>,
}

impl EncodingStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            body: StoreBody::default(),
            dimension: None,
        }
    }

    /// Load the persisted store, or an empty one if the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no encoding store yet, starting empty");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let (body, dimension) = decode(&bytes).map_err(|reason| StoreError::Corrupt {
            path: path.clone(),
            reason,
        })?;

        tracing::info!(
            path = %path.display(),
            photos = body.records.len(),
            subfolders = body.subfolders.len(),
            "encoding store loaded"
        );

        Ok(Self { path, body, dimension })
    }

    /// Load, applying `policy` if the file is corrupt.
    pub fn load_with_policy(path: impl Into<PathBuf>, policy: CorruptPolicy) -> Result<Self, StoreError> {
        let path = path.into();
        match Self::load(&path) {
            Err(StoreError::Corrupt { reason, .. }) if policy == CorruptPolicy::Rebuild => {
                let quarantine = quarantine_path(&path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %quarantine.display(),
                    reason = %reason,
                    "encoding store corrupt; every subfolder will be rescanned"
                );
                fs::rename(&path, &quarantine).map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(Self::empty(path))
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Embedding length shared by every record, if any record exists.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn subfolder_state(&self, subfolder: &str) -> SubfolderState<'_> {
        match self.body.subfolders.get(subfolder) {
            Some(summary) => SubfolderState::Scanned(summary),
            None => SubfolderState::Unscanned,
        }
    }

    pub fn scanned_subfolders(&self) -> impl Iterator<Item = (&str, &ScanSummary)> {
        self.body.subfolders.iter().map(|(name, s)| (name.as_str(), s))
    }

    /// Stored faces of every photo in `subfolder`.
    pub fn records_in<'a>(&'a self, subfolder: &'a str) -> impl Iterator<Item = (&'a PhotoId, &'a [Embedding])> + 'a {
        self.body
            .records
            .iter()
            .filter(move |(id, _)| id.subfolder() == subfolder)
            .map(|(id, faces)| (id, faces.as_slice()))
    }

    pub fn photo_count(&self) -> usize {
        self.body.records.len()
    }

    pub fn face_count(&self) -> usize {
        self.body.records.values().map(Vec::len).sum()
    }

    /// Replace everything belonging to the scanned subfolders.
    ///
    /// Records of other subfolders are left untouched. Records in `records`
    /// that fall outside `scanned` are ignored. Validation happens before any
    /// mutation, so on error the store is unchanged.
    pub fn merge(
        &mut self,
        records: Vec<EncodingRecord>,
        scanned: BTreeMap<String, ScanSummary>,
    ) -> Result<(), StoreError> {
        let (records, ignored): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| scanned.contains_key(r.id.subfolder()));
        for record in &ignored {
            tracing::debug!(id = %record.id, "merge: record outside scanned subfolders ignored");
        }

        let outside_kept = self
            .body
            .records
            .keys()
            .any(|id| !scanned.contains_key(id.subfolder()));
        let expected = if outside_kept {
            self.dimension
        } else {
            records.first().map(|r| r.embedding.dimension())
        };
        if let Some(expected) = expected {
            if let Some(bad) = records.iter().find(|r| r.embedding.dimension() != expected) {
                return Err(StoreError::DimensionMismatch {
                    id: bad.id.clone(),
                    expected,
                    actual: bad.embedding.dimension(),
                });
            }
        }

        self.body
            .records
            .retain(|id, _| !scanned.contains_key(id.subfolder()));
        for record in records {
            self.body
                .records
                .entry(record.id)
                .or_default()
                .push(record.embedding);
        }
        self.body.subfolders.extend(scanned);
        self.dimension = if self.body.records.is_empty() { None } else { expected };

        Ok(())
    }

    /// Durably write the full state: new file, fsync, rename over the old one.
    pub fn persist(&self) -> Result<(), StoreError> {
        let body = serde_json::to_vec(&self.body)?;
        let header = StoreHeader {
            format: STORE_FORMAT.to_string(),
            version: STORE_VERSION,
            dimension: self.dimension,
            records: self.face_count(),
            checksum: checksum(&body),
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&body);

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "encodings".to_string());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

        let written = (|| {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        // Make the rename itself durable.
        if let Ok(d) = File::open(&dir) {
            let _ = d.sync_all();
        }

        tracing::info!(
            path = %self.path.display(),
            photos = self.photo_count(),
            faces = header.records,
            "encoding store persisted"
        );
        Ok(())
    }

    /// Records restricted to `scope`.
    pub fn working_set(&self, scope: &BTreeSet<String>) -> WorkingSet {
        WorkingSet {
            records: self
                .body
                .records
                .iter()
                .filter(|(id, _)| scope.contains(id.subfolder()))
                .map(|(id, faces)| (id.clone(), faces.clone()))
                .collect(),
        }
    }
}

fn checksum(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{stamp}"));
    path.with_file_name(name)
}

fn decode(bytes: &[u8]) -> Result<(StoreBody, Option<usize>), String> {
    let split = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or("missing header line")?;
    let (header, body) = (&bytes[..split], &bytes[split + 1..]);

    let header: StoreHeader =
        serde_json::from_slice(header).map_err(|e| format!("unreadable header: {e}"))?;
    if header.format != STORE_FORMAT {
        return Err(format!("unknown format {:?}", header.format));
    }
    if header.version != STORE_VERSION {
        return Err(format!("unsupported version {}", header.version));
    }
    if checksum(body) != header.checksum {
        return Err("checksum mismatch".into());
    }

    let body: StoreBody =
        serde_json::from_slice(body).map_err(|e| format!("unreadable body: {e}"))?;

    let mut faces = 0usize;
    for (id, embeddings) in &body.records {
        if !body.subfolders.contains_key(id.subfolder()) {
            return Err(format!("record {id} belongs to a subfolder never scanned"));
        }
        if embeddings.is_empty() {
            return Err(format!("record {id} has no embeddings"));
        }
        for embedding in embeddings {
            if Some(embedding.dimension()) != header.dimension {
                return Err(format!(
                    "record {id} has {} dimensions, header says {:?}",
                    embedding.dimension(),
                    header.dimension
                ));
            }
        }
        faces += embeddings.len();
    }
    if faces != header.records {
        return Err(format!("header counts {} faces, body holds {faces}", header.records));
    }

    let dimension = if body.records.is_empty() { None } else { header.dimension };
    Ok((body, dimension))
}
