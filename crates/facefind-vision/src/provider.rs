use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::{DETECTOR_MODEL, RECOGNIZER_MODEL};
use facefind_core::{Embedding, EmbeddingProvider, ProviderError};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

impl From<DetectorError> for ProviderError {
    fn from(e: DetectorError) -> Self {
        ProviderError::Inference(e.to_string())
    }
}

impl From<RecognizerError> for ProviderError {
    fn from(e: RecognizerError) -> Self {
        ProviderError::Inference(e.to_string())
    }
}

/// SCRFD + ArcFace behind the embedding-provider seam. One instance per worker.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, LoadError> {
        Ok(Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_MODEL), intra_threads)?,
            recognizer: FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL), intra_threads)?,
        })
    }

    fn decode(path: &Path) -> Result<RgbImage, ProviderError> {
        image::open(path)
            .map(|img| img.to_rgb8())
            .map_err(|e| ProviderError::UnreadableImage {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Vec<Embedding>, ProviderError> {
        let photo = Self::decode(image)?;
        let faces = self.detector.detect(&photo)?;
        tracing::debug!(path = %image.display(), faces = faces.len(), "encoding faces");
        faces
            .iter()
            .map(|face| self.recognizer.encode(&photo, face).map_err(ProviderError::from))
            .collect()
    }

    fn encode_selfie(&mut self, image: &Path) -> Result<Option<Embedding>, ProviderError> {
        let photo = Self::decode(image)?;
        let faces = self.detector.detect(&photo)?;
        if faces.len() > 1 {
            tracing::info!(faces = faces.len(), score = faces[0].score, "selfie has several faces, using the best");
        }
        match faces.first() {
            Some(face) => Ok(Some(self.recognizer.encode(&photo, face)?)),
            None => Ok(None),
        }
    }
}
