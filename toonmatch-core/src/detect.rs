use crate::runtime::OnnxRuntime;
use image::{imageops, RgbImage};
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

const INPUT_SIZE: u32 = 640;

/// SCRFD feature pyramid strides, two anchors per location
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

const NMS_IOU: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }

    fn scaled(&self, sx: f32, sy: f32) -> FaceBox {
        FaceBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// Five facial keypoints in image coordinates:
/// left eye, right eye, nose tip, left and right mouth corners.
pub type Landmarks = [(f32, f32); 5];

#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub landmarks: Landmarks,
    pub confidence: f32,
}

impl DetectedFace {
    /// Ranking key: confident, large faces first
    fn prominence(&self) -> f32 {
        self.confidence * self.bbox.area().sqrt()
    }
}

pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl FaceDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        runtime: &OnnxRuntime,
        confidence_threshold: f32,
    ) -> Result<Self, DetectionError> {
        let session = runtime
            .create_session(model_path)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;

        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    /// Detect faces, most prominent first. An empty list means no face.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let input = Value::from_array(preprocess(image))
            .map_err(|e| {
                DetectionError::Inference(format!("Failed to create input tensor: {}", e))
            })?;

        let outputs = self
            .session
            .run(ort::inputs!["input.1" => input])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        // Layout: scores for every stride, then boxes, then keypoints
        if outputs.len() < STRIDES.len() * 3 {
            return Err(DetectionError::Inference(format!(
                "Expected {} outputs, got {}",
                STRIDES.len() * 3,
                outputs.len()
            )));
        }

        // Back to source image coordinates
        let sx = width as f32 / INPUT_SIZE as f32;
        let sy = height as f32 / INPUT_SIZE as f32;

        let mut faces = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("scores@{}: {}", stride, e)))?;
            let (_, boxes) = outputs[level + STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("boxes@{}: {}", stride, e)))?;
            let (_, keypoints) = outputs[level + STRIDES.len() * 2]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("keypoints@{}: {}", stride, e)))?;

            decode_level(
                stride,
                scores,
                boxes,
                keypoints,
                self.confidence_threshold,
                &mut faces,
            );
        }

        log::debug!("{} raw detections before NMS", faces.len());

        let mut faces: Vec<DetectedFace> = suppress(faces)
            .into_iter()
            .map(|face| DetectedFace {
                bbox: face.bbox.scaled(sx, sy),
                landmarks: face.landmarks.map(|(x, y)| (x * sx, y * sy)),
                confidence: face.confidence,
            })
            .collect();

        faces.sort_by(|a, b| b.prominence().total_cmp(&a.prominence()));
        Ok(faces)
    }
}

/// Resize to the network input and lay out as NCHW in [0, 1]
fn preprocess(image: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, imageops::FilterType::Triangle);
    let side = INPUT_SIZE as usize;
    let mut data = vec![0.0f32; 3 * side * side];

    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * side * side + offset] = pixel[c] as f32 / 255.0;
        }
    }

    ([1, 3, side, side], data)
}

fn decode_level(
    stride: usize,
    scores: &[f32],
    boxes: &[f32],
    keypoints: &[f32],
    threshold: f32,
    out: &mut Vec<DetectedFace>,
) {
    let cells = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    for row in 0..cells {
        for col in 0..cells {
            let cx = (col as f32 + 0.5) * step;
            let cy = (row as f32 + 0.5) * step;

            for anchor in 0..ANCHORS_PER_CELL {
                let idx = (row * cells + col) * ANCHORS_PER_CELL + anchor;
                let Some(&logit) = scores.get(idx) else {
                    continue;
                };
                let confidence = 1.0 / (1.0 + (-logit).exp());
                if confidence < threshold {
                    continue;
                }

                let (Some(b), Some(k)) = (
                    boxes.get(idx * 4..idx * 4 + 4),
                    keypoints.get(idx * 10..idx * 10 + 10),
                ) else {
                    continue;
                };

                // Edge distances from the anchor centre
                let x1 = cx - b[0].abs();
                let y1 = cy - b[1].abs();
                let x2 = cx + b[2].abs();
                let y2 = cy + b[3].abs();

                let mut landmarks = [(0.0, 0.0); 5];
                for (i, point) in landmarks.iter_mut().enumerate() {
                    *point = (cx + k[i * 2] * step, cy + k[i * 2 + 1] * step);
                }

                log::trace!(
                    "stride={} anchor=({:.1},{:.1}) box=({:.1},{:.1},{:.1},{:.1}) conf={:.3}",
                    stride, cx, cy, x1, y1, x2, y2, confidence
                );

                out.push(DetectedFace {
                    bbox: FaceBox {
                        x: x1,
                        y: y1,
                        width: x2 - x1,
                        height: y2 - y1,
                    },
                    landmarks,
                    confidence,
                });
            }
        }
    }
}

/// Greedy non-maximum suppression
fn suppress(mut faces: Vec<DetectedFace>) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectedFace> = Vec::new();
    for face in faces {
        if kept.iter().all(|k| k.bbox.iou(&face.bbox) <= NMS_IOU) {
            kept.push(face);
        }
    }
    kept
}
