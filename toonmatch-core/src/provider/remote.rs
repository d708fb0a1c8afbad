use super::{
    encode_png, DelegateCandidate, DelegateOutcome, EmbeddingProvider, FaceAttributes, FaceData,
    FaceOutcome, MatchDelegate, ProviderError, QueryImage,
};
use crate::config::RemoteConfig;
use crate::embed::normalize_embedding;
use crate::roster::CharacterRecord;
use async_trait::async_trait;
use image::RgbImage;
use ndarray::Array1;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Multipart field carrying the uploaded image
const UPLOAD_FIELD: &str = "file";

fn build_client(config: &RemoteConfig) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
        .build()
        .map_err(|e| ProviderError::Remote(format!("HTTP client: {}", e)))
}

/// POST one image as `multipart/form-data`.
///
/// `Ok(None)` when the service answers 422, its signal for "no usable face".
async fn upload(
    http: &reqwest::Client,
    url: &str,
    bytes: Vec<u8>,
    file_name: &str,
    mime: &str,
) -> Result<Option<reqwest::Response>, ProviderError> {
    let part = Part::bytes(bytes)
        .file_name(file_name.to_string())
        .mime_str(mime)
        .map_err(|e| ProviderError::Remote(format!("Invalid upload part: {}", e)))?;
    let form = Form::new().part(UPLOAD_FIELD, part);

    let response = http
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| ProviderError::Remote(format!("POST {}: {}", url, e)))?;

    let status = response.status();
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        return Ok(None);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Remote(format!("POST {}: HTTP {}: {}", url, status, body)));
    }

    Ok(Some(response))
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    attributes: Option<FaceAttributes>,
}

/// Embedding provider backed by an HTTP service.
///
/// The service receives the image as a multipart upload and answers
/// `{"embedding": [..] | null, "attributes": {..}}`.
pub struct RemoteEmbedProvider {
    http: reqwest::Client,
    url: String,
    dimension: usize,
}

impl RemoteEmbedProvider {
    pub fn new(
        url: impl Into<String>,
        config: &RemoteConfig,
        dimension: usize,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(config)?,
            url: url.into(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedProvider {
    fn name(&self) -> &'static str {
        "remote-embed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_ready(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn extract(&self, image: Arc<RgbImage>) -> Result<FaceOutcome, ProviderError> {
        let bytes = encode_png(&image).map_err(|e| ProviderError::Image(e.to_string()))?;

        let uploaded = upload(&self.http, &self.url, bytes, "image.png", "image/png").await?;
        let Some(response) = uploaded else {
            return Ok(FaceOutcome::NotFound);
        };

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Remote(format!("Invalid embedding response: {}", e)))?;

        let Some(values) = body.embedding else {
            return Ok(FaceOutcome::NotFound);
        };

        if values.len() != self.dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: self.dimension,
                actual: values.len(),
            });
        }

        Ok(FaceOutcome::Found(FaceData {
            embedding: normalize_embedding(Array1::from_vec(values)),
            attributes: body.attributes,
            detection: None,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RemoteCandidate {
    character: CharacterRecord,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    #[serde(default, alias = "matched_character")]
    character: Option<CharacterRecord>,
    #[serde(default)]
    similarity: Option<f64>,
    #[serde(default)]
    candidates: Vec<RemoteCandidate>,
    #[serde(default)]
    unknown: bool,
}

fn checked_similarity(value: f64) -> Result<u8, ProviderError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(ProviderError::Remote(format!(
            "Similarity {} outside 0-100",
            value
        )));
    }
    Ok(value.round() as u8)
}

impl MatchResponse {
    fn into_outcome(self) -> Result<DelegateOutcome, ProviderError> {
        if self.unknown {
            return Ok(DelegateOutcome::Unknown {
                considered: self.candidates.len(),
            });
        }

        if !self.candidates.is_empty() {
            let mut ranked = self
                .candidates
                .into_iter()
                .map(|c| {
                    Ok(DelegateCandidate {
                        similarity: checked_similarity(c.score)?,
                        character: c.character,
                    })
                })
                .collect::<Result<Vec<_>, ProviderError>>()?;
            ranked.sort_by(|a, b| b.similarity.cmp(&a.similarity));
            return Ok(DelegateOutcome::Matched(ranked));
        }

        match (self.character, self.similarity) {
            (Some(character), Some(similarity)) => {
                Ok(DelegateOutcome::Matched(vec![DelegateCandidate {
                    similarity: checked_similarity(similarity)?,
                    character,
                }]))
            }
            _ => Err(ProviderError::Remote(
                "Match response names no character".to_string(),
            )),
        }
    }
}

/// Client for a service that matches the whole query itself
pub struct RemoteMatchClient {
    http: reqwest::Client,
    url: String,
}

impl RemoteMatchClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(config)?,
            url: config.match_url.clone(),
        })
    }
}

#[async_trait]
impl MatchDelegate for RemoteMatchClient {
    async fn match_image(&self, query: &QueryImage) -> Result<DelegateOutcome, ProviderError> {
        log::debug!("Delegating match to {}", self.url);
        let response = upload(
            &self.http,
            &self.url,
            query.bytes.to_vec(),
            &query.file_name,
            query.mime_type(),
        )
        .await?;

        let Some(response) = response else {
            return Ok(DelegateOutcome::NoFace);
        };

        let body: MatchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Remote(format!("Invalid match response: {}", e)))?;

        body.into_outcome()
    }
}
