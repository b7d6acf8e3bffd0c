//! facefind-vision — Face detection and encoding for photo collections.
//!
//! SCRFD finds faces and their five landmarks, each face is aligned onto the
//! ArcFace template, and ArcFace turns the crop into a 512-dimensional
//! L2-normalised embedding. Both models run on CPU via ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod provider;
pub mod recognizer;

pub use detector::{DetectorError, FaceBox, FaceDetector};
pub use provider::OnnxProvider;
pub use recognizer::{FaceRecognizer, RecognizerError};

use std::path::PathBuf;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/facefind/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind/models")
}
