use super::{EmbeddingProvider, FaceData, FaceOutcome, InferenceSlot, InitCell, ProviderError};
use crate::align::align_face;
use crate::config::{DetectionConfig, EmbeddingConfig, RuntimeConfig};
use crate::detect::{DetectedFace, FaceDetector};
use crate::embed::FaceEmbedder;
use crate::runtime::OnnxRuntime;
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

struct LocalModels {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

/// In-process detection and embedding on ONNX Runtime.
///
/// Models load on first use. Inference runs on the blocking pool, one image
/// at a time per provider. Callers queue on an async gate; the gate permit
/// travels with the blocking job, so an inference whose caller gave up still
/// holds the models until it returns.
pub struct LocalProvider {
    detection: DetectionConfig,
    embedding: EmbeddingConfig,
    runtime: RuntimeConfig,
    models: InitCell<Mutex<LocalModels>>,
    gate: Arc<Semaphore>,
}

impl LocalProvider {
    pub fn new(
        detection: &DetectionConfig,
        embedding: &EmbeddingConfig,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            detection: detection.clone(),
            embedding: embedding.clone(),
            runtime: runtime.clone(),
            models: InitCell::new(),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    async fn models(&self) -> Result<Arc<Mutex<LocalModels>>, ProviderError> {
        let detection = self.detection.clone();
        let embedding = self.embedding.clone();
        let runtime = self.runtime.clone();

        self.models
            .get_or_init(|| async move {
                tokio::task::spawn_blocking(move || load_models(&detection, &embedding, &runtime))
                    .await
                    .map_err(|e| {
                        ProviderError::ModelUnavailable(format!("Model loading task failed: {}", e))
                    })?
            })
            .await
    }
}

fn load_models(
    detection: &DetectionConfig,
    embedding: &EmbeddingConfig,
    runtime: &RuntimeConfig,
) -> Result<Mutex<LocalModels>, ProviderError> {
    let runtime = OnnxRuntime::new(runtime);

    log::info!("Loading face detection model...");
    let detector =
        FaceDetector::new(&detection.model_path, &runtime, detection.confidence_threshold)
            .map_err(|e| ProviderError::ModelUnavailable(e.to_string()))?;

    log::info!("Loading face embedding model...");
    let embedder = FaceEmbedder::new(&embedding.model_path, &runtime, embedding.dimension)
        .map_err(|e| ProviderError::ModelUnavailable(e.to_string()))?;

    Ok(Mutex::new(LocalModels { detector, embedder }))
}

/// Detect, align and embed the most prominent face
fn extract_face(
    models: &Mutex<LocalModels>,
    image: &RgbImage,
) -> Result<FaceOutcome, ProviderError> {
    let mut models = models
        .lock()
        .map_err(|_| ProviderError::Inference("Model lock poisoned".to_string()))?;

    let faces = models
        .detector
        .detect(image)
        .map_err(|e| ProviderError::Inference(e.to_string()))?;

    let Some(face) = faces.into_iter().next() else {
        log::debug!("No face detected");
        return Ok(FaceOutcome::NotFound);
    };
    log::debug!("Detected face with confidence {:.2}", face.confidence);

    let aligned = align_face(image, &face.landmarks)
        .map_err(|e| ProviderError::Inference(e.to_string()))?;

    let embedding = models.embedder.embed(&aligned).map_err(|e| match e {
        crate::embed::EmbedError::InvalidDimension { expected, actual } => {
            ProviderError::DimensionMismatch { expected, actual }
        }
        other => ProviderError::Inference(other.to_string()),
    })?;

    Ok(FaceOutcome::Found(FaceData {
        embedding,
        attributes: None,
        detection: Some(face),
    }))
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dimension(&self) -> usize {
        self.embedding.dimension
    }

    async fn ensure_ready(&self) -> Result<(), ProviderError> {
        self.models().await.map(|_| ())
    }

    async fn extract(&self, image: Arc<RgbImage>) -> Result<FaceOutcome, ProviderError> {
        let slot = self.reserve().await?;
        self.extract_reserved(slot, image).await
    }

    async fn reserve(&self) -> Result<InferenceSlot, ProviderError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Inference("Inference gate closed".to_string()))?;
        Ok(InferenceSlot::from_permit(permit))
    }

    async fn extract_reserved(
        &self,
        slot: InferenceSlot,
        image: Arc<RgbImage>,
    ) -> Result<FaceOutcome, ProviderError> {
        let models = self.models().await?;

        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            extract_face(&models, &image)
        })
        .await
        .map_err(|e| ProviderError::Inference(format!("Inference task failed: {}", e)))?
    }
}

/// Save a copy of `image` with the detected box (green) and landmarks (red)
pub fn save_debug_visualization<P: AsRef<Path>>(
    image: &RgbImage,
    face: &DetectedFace,
    path: P,
) -> Result<(), image::ImageError> {
    let mut debug_img = image.clone();

    let bbox = &face.bbox;
    let rect = Rect::at(bbox.x as i32, bbox.y as i32)
        .of_size((bbox.width as u32).max(1), (bbox.height as u32).max(1));
    draw_hollow_rect_mut(&mut debug_img, rect, Rgb([0, 255, 0]));

    for &(x, y) in &face.landmarks {
        draw_cross_mut(&mut debug_img, Rgb([255, 0, 0]), x as i32, y as i32);
    }

    debug_img.save(path.as_ref())?;
    log::info!("Debug visualization saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detect::FaceBox;
    use std::time::Duration;

    fn provider_with_missing_models() -> LocalProvider {
        let mut config = Config::default();
        config.detection.model_path = "/nonexistent/scrfd.onnx".into();
        config.embedding.model_path = "/nonexistent/arcface.onnx".into();
        LocalProvider::new(&config.detection, &config.embedding, &config.runtime)
    }

    #[tokio::test]
    async fn test_missing_models_are_unavailable() {
        let provider = provider_with_missing_models();

        assert_eq!(provider.name(), "local");
        assert_eq!(provider.dimension(), 512);
        assert!(matches!(
            provider.ensure_ready().await,
            Err(ProviderError::ModelUnavailable(_))
        ));

        let image = Arc::new(RgbImage::new(16, 16));
        assert!(matches!(
            provider.extract(image).await,
            Err(ProviderError::ModelUnavailable(_))
        ));
        // Sticky after the retry is spent
        assert!(provider.ensure_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_gate_admits_one_inference_at_a_time() {
        let provider = provider_with_missing_models();

        let held = provider.reserve().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), provider.reserve()).await;
        assert!(waiting.is_err());

        drop(held);
        assert!(provider.reserve().await.is_ok());
    }

    #[test]
    fn test_save_debug_visualization() {
        let path = std::env::temp_dir().join(format!("toonmatch_debug_{}.png", std::process::id()));
        let image = RgbImage::from_pixel(40, 40, Rgb([255, 255, 255]));
        let face = DetectedFace {
            bbox: FaceBox {
                x: 5.0,
                y: 5.0,
                width: 20.0,
                height: 20.0,
            },
            landmarks: [(10.0, 12.0), (20.0, 12.0), (15.0, 16.0), (11.0, 20.0), (19.0, 20.0)],
            confidence: 0.9,
        };

        save_debug_visualization(&image, &face, &path).unwrap();
        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(5, 5), &Rgb([0, 255, 0]));
        assert_eq!(saved.get_pixel(15, 16), &Rgb([255, 0, 0]));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires model files
    async fn test_local_extraction() {
        let config = Config::default();
        let provider = LocalProvider::new(&config.detection, &config.embedding, &config.runtime);
        let blank = Arc::new(RgbImage::new(320, 240));
        assert!(matches!(provider.extract(blank).await.unwrap(), FaceOutcome::NotFound));
    }
}
