use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    pub detection: DetectionConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    pub roster: RosterConfig,
    pub matching: MatchingConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Where embeddings (or whole matches) come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderMode {
    /// In-process SCRFD + ArcFace inference
    Local,
    /// Remote service returning an embedding per uploaded image
    RemoteEmbed,
    /// Remote service returning the matched character directly
    RemoteMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub mode: ProviderMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

fn default_dimension() -> usize {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Endpoint accepting an image upload and answering with an embedding
    pub embed_url: Option<String>,
    /// Endpoint accepting an image upload and answering with a matched character
    pub match_url: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            embed_url: None,
            match_url: "http://localhost:8000/api/match".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    pub api_base: String,
    pub portrait_host: String,
    pub page_size: usize,
    pub max_pages: u32,
    pub limit: usize,

    // Candidates without a portrait cannot yield an embedding
    #[serde(default = "default_require_portrait")]
    pub require_portrait: bool,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_require_portrait() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub max_candidates: usize,
    pub max_concurrent: usize,
    pub candidate_timeout_secs: u64,
    pub top_k: usize,
    #[serde(default = "default_cache_embeddings")]
    pub cache_embeddings: bool,
}

fn default_cache_embeddings() -> bool {
    true
}

/// Breakpoints of the distance -> similarity transform.
///
/// Distances up to `near_distance` fall from 100 to `near_similarity`,
/// distances between the breakpoints fall linearly to `floor_similarity`,
/// and everything beyond `far_distance` sits on the floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub near_distance: f32,
    pub far_distance: f32,
    pub near_similarity: u8,
    pub floor_similarity: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        // L2-normalized embeddings put Euclidean distance in [0, 2]
        Self {
            near_distance: 0.6,
            far_distance: 1.2,
            near_similarity: 95,
            floor_similarity: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Threads per inference session, ONNX Runtime picks when unset
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/toonmatch/toonmatch.toml (system-wide)
    /// 2. ~/.config/toonmatch/toonmatch.toml (user)
    /// 3. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates = vec![PathBuf::from("/etc/toonmatch/toonmatch.toml")];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("toonmatch")
                    .join("toonmatch.toml"),
            );
        }

        for path in candidates {
            if path.exists() {
                log::debug!("Loading config from {}", path.display());
                return Self::load_from_path(&path);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(ConfigError::Validation(
                "Embedding dimension must be greater than 0".to_string(),
            ));
        }

        match self.provider.mode {
            ProviderMode::RemoteEmbed if self.remote.embed_url.is_none() => {
                return Err(ConfigError::Validation(
                    "remote-embed mode requires remote.embed_url".to_string(),
                ));
            }
            ProviderMode::RemoteMatch if self.remote.match_url.is_empty() => {
                return Err(ConfigError::Validation(
                    "remote-match mode requires remote.match_url".to_string(),
                ));
            }
            _ => {}
        }

        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Remote timeout must be greater than 0".to_string(),
            ));
        }

        if self.roster.api_base.is_empty() || self.roster.portrait_host.is_empty() {
            return Err(ConfigError::Validation(
                "Roster api_base and portrait_host cannot be empty".to_string(),
            ));
        }

        if self.roster.page_size == 0 || self.roster.max_pages == 0 || self.roster.limit == 0 {
            return Err(ConfigError::Validation(
                "Roster page_size, max_pages and limit must be greater than 0".to_string(),
            ));
        }

        if self.matching.max_candidates == 0 {
            return Err(ConfigError::Validation(
                "Max candidates must be greater than 0".to_string(),
            ));
        }

        if self.matching.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "Max concurrent extractions must be greater than 0".to_string(),
            ));
        }

        if self.matching.candidate_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Candidate timeout must be greater than 0".to_string(),
            ));
        }

        self.scoring.validate()?;

        Ok(())
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.near_distance > 0.0 && self.near_distance < self.far_distance) {
            return Err(ConfigError::Validation(
                "Scoring requires 0 < near_distance < far_distance".to_string(),
            ));
        }

        if self.near_similarity > 100 || self.floor_similarity > self.near_similarity {
            return Err(ConfigError::Validation(
                "Scoring requires floor_similarity <= near_similarity <= 100".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                mode: ProviderMode::Local,
            },
            detection: DetectionConfig {
                model_path: PathBuf::from("models/scrfd_500m.onnx"),
                confidence_threshold: 0.5,
            },
            embedding: EmbeddingConfig {
                model_path: PathBuf::from("models/arcface_mobilefacenet.onnx"),
                dimension: 512,
            },
            remote: RemoteConfig::default(),
            roster: RosterConfig {
                api_base: "https://thesimpsonsapi.com".to_string(),
                portrait_host: "https://cdn.thesimpsonsapi.com/500".to_string(),
                page_size: 20,
                max_pages: 3,
                limit: 60,
                require_portrait: true,
                timeout_secs: 10,
            },
            matching: MatchingConfig {
                max_candidates: 30,
                max_concurrent: 4,
                candidate_timeout_secs: 10,
                top_k: 5,
                cache_embeddings: true,
            },
            scoring: ScoringConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}
