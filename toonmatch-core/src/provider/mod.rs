//! Embedding providers: where face embeddings (or whole matches) come from.
//!
//! [`EmbeddingProvider`] turns an image into an embedding, or reports that the
//! image holds no face. [`MatchDelegate`] hands the whole query to a remote
//! service that answers with a ranked match directly.

pub mod local;
pub mod remote;

use crate::detect::DetectedFace;
use crate::embed::Embedding;
use crate::roster::CharacterRecord;
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid image: {0}")]
    Image(String),
    #[error("Remote service error: {0}")]
    Remote(String),
    #[error("Embedding dimension mismatch, expected {expected} but got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Coarse gender estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Auxiliary per-face signals some providers report alongside the embedding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    /// Expression name -> confidence in [0, 1]
    #[serde(default)]
    pub expressions: HashMap<String, f32>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
}

impl FaceAttributes {
    /// Highest-confidence expression, ties broken by name
    pub fn dominant_expression(&self) -> Option<(&str, f32)> {
        self.expressions
            .iter()
            .max_by(|(na, a), (nb, b)| a.total_cmp(b).then_with(|| nb.cmp(na)))
            .map(|(name, score)| (name.as_str(), *score))
    }
}

/// A located face
#[derive(Debug, Clone)]
pub struct FaceData {
    pub embedding: Embedding,
    pub attributes: Option<FaceAttributes>,
    /// Where the face was found, for local inference
    pub detection: Option<DetectedFace>,
}

/// Result of one extraction: "no face" is an expected answer, not an error
#[derive(Debug, Clone)]
pub enum FaceOutcome {
    Found(FaceData),
    NotFound,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of every embedding this provider produces
    fn dimension(&self) -> usize;

    /// Load whatever the provider needs. Idempotent.
    async fn ensure_ready(&self) -> Result<(), ProviderError>;

    async fn extract(&self, image: Arc<RgbImage>) -> Result<FaceOutcome, ProviderError>;

    /// Wait for a share of the provider's inference capacity. Unbounded
    /// providers hand one out immediately.
    async fn reserve(&self) -> Result<InferenceSlot, ProviderError> {
        Ok(InferenceSlot::unbounded())
    }

    /// [`extract`](Self::extract) with capacity already reserved. The slot is
    /// held until the work finishes, even if the caller stops waiting.
    async fn extract_reserved(
        &self,
        slot: InferenceSlot,
        image: Arc<RgbImage>,
    ) -> Result<FaceOutcome, ProviderError> {
        drop(slot);
        self.extract(image).await
    }
}

/// A reserved share of a provider's inference capacity, released on drop
#[derive(Debug, Default)]
pub struct InferenceSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl InferenceSlot {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Some(permit),
        }
    }
}

/// One entry of a remotely ranked answer
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateCandidate {
    pub character: CharacterRecord,
    pub similarity: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DelegateOutcome {
    /// Best first
    Matched(Vec<DelegateCandidate>),
    NoFace,
    /// The service declined to name a confident match
    Unknown { considered: usize },
}

/// Whole-query matching delegated to another service
#[async_trait]
pub trait MatchDelegate: Send + Sync {
    async fn match_image(&self, query: &QueryImage) -> Result<DelegateOutcome, ProviderError>;
}

/// The user's photo, kept both encoded (for upload) and decoded (for inference)
#[derive(Debug, Clone)]
pub struct QueryImage {
    pub bytes: Arc<Vec<u8>>,
    pub image: Arc<RgbImage>,
    pub file_name: String,
}

impl QueryImage {
    pub fn from_bytes(bytes: Vec<u8>, file_name: impl Into<String>) -> Result<Self, ProviderError> {
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| ProviderError::Image(e.to_string()))?;

        Ok(Self {
            bytes: Arc::new(bytes),
            image: Arc::new(decoded.to_rgb8()),
            file_name: file_name.into(),
        })
    }

    pub fn from_image(image: RgbImage) -> Result<Self, ProviderError> {
        let bytes = encode_png(&image).map_err(|e| ProviderError::Image(e.to_string()))?;

        Ok(Self {
            bytes: Arc::new(bytes),
            image: Arc::new(image),
            file_name: "query.png".to_string(),
        })
    }

    pub fn mime_type(&self) -> &'static str {
        match image::guess_format(&self.bytes) {
            Ok(ImageFormat::Jpeg) => "image/jpeg",
            Ok(ImageFormat::WebP) => "image/webp",
            Ok(ImageFormat::Gif) => "image/gif",
            Ok(ImageFormat::Bmp) => "image/bmp",
            _ => "image/png",
        }
    }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Initialisation attempts before a failure becomes permanent
pub const MAX_INIT_ATTEMPTS: u32 = 2;

enum InitState<T> {
    Pending { failures: u32 },
    Ready(Arc<T>),
    Failed(String),
}

/// Lazily initialised, process-lifetime provider state.
///
/// Concurrent first callers queue on the lock, so the initialiser runs at
/// most once at a time and never again after success. A failure is retried
/// by the next caller once, then reported without further attempts.
pub struct InitCell<T> {
    state: Mutex<InitState<T>>,
}

impl<T> InitCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Pending { failures: 0 }),
        }
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<Arc<T>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut state = self.state.lock().await;
        let failures = match &*state {
            InitState::Ready(value) => return Ok(Arc::clone(value)),
            InitState::Failed(reason) => {
                return Err(ProviderError::ModelUnavailable(reason.clone()))
            }
            InitState::Pending { failures } => *failures,
        };

        match init().await {
            Ok(value) => {
                let value = Arc::new(value);
                *state = InitState::Ready(Arc::clone(&value));
                Ok(value)
            }
            Err(e) => {
                let reason = match e {
                    ProviderError::ModelUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                let failures = failures + 1;
                *state = if failures >= MAX_INIT_ATTEMPTS {
                    log::error!("Initialisation failed {} times, giving up: {}", failures, reason);
                    InitState::Failed(reason.clone())
                } else {
                    log::warn!("Initialisation failed, will retry once: {}", reason);
                    InitState::Pending { failures }
                };
                Err(ProviderError::ModelUnavailable(reason))
            }
        }
    }
}

impl<T> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
