//! The face embedding seam.
//!
//! Detection and encoding are an external capability; the store, scanner and
//! matcher only see this trait.

use crate::types::Embedding;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("unreadable image {}: {reason}", path.display())]
    UnreadableImage { path: PathBuf, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Detects faces in an image file and encodes each one.
///
/// Implementations return faces ordered by detection confidence, best first,
/// and an empty vector when no face is found. `&mut self` because inference
/// sessions are not shareable; the scanner gives each worker its own provider.
pub trait EmbeddingProvider: Send {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Vec<Embedding>, ProviderError>;

    /// Encode a selfie: the best face, or `None` when no face is found.
    fn encode_selfie(&mut self, image: &Path) -> Result<Option<Embedding>, ProviderError> {
        Ok(self.detect_and_encode(image)?.into_iter().next())
    }
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Vec<Embedding>, ProviderError> {
        (**self).detect_and_encode(image)
    }

    fn encode_selfie(&mut self, image: &Path) -> Result<Option<Embedding>, ProviderError> {
        (**self).encode_selfie(image)
    }
}
