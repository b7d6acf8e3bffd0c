use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Face embedding vector (512-dimensional for ArcFace, but any fixed length works).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// True when every component is finite (no NaN / infinity from a broken model).
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhotoIdError {
    #[error("invalid path component {0:?}")]
    InvalidComponent(String),
    #[error("photo identifier {0:?} is not of the form subfolder/filename")]
    Malformed(String),
}

/// Stable identifier of a photo inside the collection root: `subfolder/filename`.
///
/// Both components are single path segments, so the identifier is independent of
/// where the collection lives on disk and two photos can never share one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhotoId {
    subfolder: String,
    file_name: String,
}

impl PhotoId {
    pub fn new(subfolder: impl Into<String>, file_name: impl Into<String>) -> Result<Self, PhotoIdError> {
        let subfolder = subfolder.into();
        let file_name = file_name.into();
        validate_component(&subfolder)?;
        validate_component(&file_name)?;
        Ok(Self { subfolder, file_name })
    }

    pub fn subfolder(&self) -> &str {
        &self.subfolder
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Absolute location of the photo under `root`.
    pub fn source_path(&self, root: &Path) -> PathBuf {
        root.join(&self.subfolder).join(&self.file_name)
    }
}

/// Reject anything that is not exactly one normal path segment.
pub fn validate_component(name: &str) -> Result<(), PhotoIdError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(PhotoIdError::InvalidComponent(name.to_string()))
    } else {
        Ok(())
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subfolder, self.file_name)
    }
}

impl FromStr for PhotoId {
    type Err = PhotoIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (subfolder, file_name) = s
            .split_once('/')
            .ok_or_else(|| PhotoIdError::Malformed(s.to_string()))?;
        PhotoId::new(subfolder, file_name)
    }
}

impl Serialize for PhotoId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhotoId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One detected face in one photo.
///
/// A photo with several faces yields one record per face; a photo with none
/// yields no record at all.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingRecord {
    pub id: PhotoId,
    pub embedding: Embedding,
}

/// A photo within tolerance of the query, with its closest face distance.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEntry {
    pub id: PhotoId,
    pub distance: f32,
}

/// Matches ordered by ascending distance, ties broken by identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    pub entries: Vec<MatchEntry>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MatchEntry> {
        self.entries.iter()
    }
}
