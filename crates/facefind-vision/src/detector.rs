//! SCRFD face detector via ONNX Runtime.
//!
//! Photos are letterboxed into the 640×640 input, decoded at strides 8, 16
//! and 32 with two anchors per cell, and overlapping boxes are suppressed.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection model not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("unexpected model output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A detected face in photo coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    /// Eyes, nose tip, mouth corners.
    pub landmarks: [(f32, f32); 5],
}

impl FaceBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Scale applied when the photo was fitted into the model input.
/// Padding is added on the right and bottom only.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
}

impl Letterbox {
    fn to_photo(self, x: f32, y: f32) -> (f32, f32) {
        (x / self.scale, y / self.scale)
    }
}

/// Output positions of (score, bbox, kps) for each stride.
type LevelOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    levels: [LevelOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::BadOutput(format!(
                "need 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let levels = map_outputs(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?levels, "loaded SCRFD model");

        Ok(Self { session, levels })
    }

    /// Faces in `image`, best score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (input, letterbox) = letterbox(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in STRIDES.iter().zip(self.levels.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::BadOutput(format!("{what} at stride {stride}: {e}")))
            };
            let level = Level {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                kps: extract(kps_idx, "landmarks")?,
            };
            level.decode(letterbox, SCORE_THRESHOLD, &mut candidates);
        }

        let faces = suppress(candidates, NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Fit `image` into the square model input and normalise it to NCHW RGB.
fn letterbox(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = image.dimensions();
    let scale = (INPUT_SIZE as f32 / w.max(1) as f32).min(INPUT_SIZE as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - MEAN) / STD;
        }
    }
    (tensor, Letterbox { scale })
}

/// Raw outputs of one stride level.
struct Level<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

impl Level<'_> {
    fn decode(&self, letterbox: Letterbox, threshold: f32, out: &mut Vec<FaceBox>) {
        let grid = (INPUT_SIZE / self.stride) as usize;
        let stride = self.stride as f32;
        let anchors = grid * grid * ANCHORS_PER_CELL;

        for idx in 0..anchors.min(self.scores.len()) {
            let score = self.scores[idx];
            if score < threshold {
                continue;
            }
            let (Some(b), Some(k)) = (
                self.boxes.get(idx * 4..idx * 4 + 4),
                self.kps.get(idx * 10..idx * 10 + 10),
            ) else {
                continue;
            };

            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * stride;
            let cy = (cell / grid) as f32 * stride;

            let (x1, y1) = letterbox.to_photo(cx - b[0] * stride, cy - b[1] * stride);
            let (x2, y2) = letterbox.to_photo(cx + b[2] * stride, cy + b[3] * stride);
            let landmarks =
                std::array::from_fn(|i| letterbox.to_photo(cx + k[i * 2] * stride, cy + k[i * 2 + 1] * stride));

            out.push(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                score,
                landmarks,
            });
        }
    }
}

/// Match outputs to strides by name (`score_8`, `bbox_16`, ...), falling back
/// to the usual export order of all scores, then boxes, then landmarks.
fn map_outputs(names: &[String]) -> [LevelOutputs; 3] {
    let find = |prefix: &str, stride: u32| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<LevelOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(levels) => [levels[0], levels[1], levels[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Greedy non-maximum suppression; the result is sorted by score, best first.
fn suppress(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<FaceBox> = Vec::new();
    for face in faces {
        if kept.iter().all(|k| iou(k, &face) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
