use crate::align::ALIGNED_SIZE;
use crate::runtime::OnnxRuntime;
use image::RgbImage;
use ndarray::Array1;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid embedding dimension, expected {expected} but got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
}

/// L2-normalized face embedding vector
pub type Embedding = Array1<f32>;

/// ArcFace-style embedder over aligned 112x112 crops
pub struct FaceEmbedder {
    session: Session,
    dimension: usize,
}

impl FaceEmbedder {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        runtime: &OnnxRuntime,
        dimension: usize,
    ) -> Result<Self, EmbedError> {
        let session = runtime
            .create_session(model_path)
            .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;

        Ok(Self { session, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed an aligned face crop
    pub fn embed(&mut self, aligned_face: &RgbImage) -> Result<Embedding, EmbedError> {
        let (width, height) = aligned_face.dimensions();
        if width != ALIGNED_SIZE || height != ALIGNED_SIZE {
            return Err(EmbedError::Inference(format!(
                "Input image must be {0}x{0}, got {1}x{2}",
                ALIGNED_SIZE, width, height
            )));
        }

        let input = Value::from_array(preprocess(aligned_face))
            .map_err(|e| EmbedError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Inference(format!("Failed to extract embedding: {}", e)))?;

        let actual = shape.get(1).copied().unwrap_or(0) as usize;
        if shape.len() != 2 || actual != self.dimension || data.len() < self.dimension {
            return Err(EmbedError::InvalidDimension {
                expected: self.dimension,
                actual,
            });
        }

        let embedding = Array1::from_iter(data[..self.dimension].iter().copied());
        Ok(normalize_embedding(embedding))
    }
}

/// NCHW tensor, `(pixel - 127.5) / 128`
fn preprocess(image: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let side = ALIGNED_SIZE as usize;
    let plane = side * side;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }

    ([1, 3, side, side], data)
}

/// L2 normalize an embedding vector
pub fn normalize_embedding(mut embedding: Embedding) -> Embedding {
    let norm = embedding.dot(&embedding).sqrt();
    if norm > 0.0 {
        embedding /= norm;
    }
    embedding
}
