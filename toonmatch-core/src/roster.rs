use crate::config::RosterConfig;
use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Roster unavailable: {0}")]
    Unavailable(String),
    #[error("Portrait unavailable: {0}")]
    Portrait(String),
}

/// A character as listed by the roster source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub portrait_path: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub phrases: Vec<String>,
}

impl CharacterRecord {
    pub fn has_portrait(&self) -> bool {
        self.portrait_path
            .as_deref()
            .is_some_and(|path| !path.trim().is_empty())
    }

    /// Full portrait URL: `host` + `portrait_path`, absolute paths kept as-is
    pub fn portrait_url(&self, host: &str) -> Option<String> {
        let path = self.portrait_path.as_deref()?.trim();
        if path.is_empty() {
            return None;
        }
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }

        let host = host.trim_end_matches('/');
        if path.starts_with('/') {
            Some(format!("{}{}", host, path))
        } else {
            Some(format!("{}/{}", host, path))
        }
    }
}

/// One page of the upstream character listing
#[derive(Debug, Clone, Deserialize)]
pub struct CharacterPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub prev: Option<String>,
    #[serde(default)]
    pub pages: Option<u32>,
    pub results: Vec<CharacterRecord>,
}

/// Source of match candidates and their portraits
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Ordered roster, at most `limit` records
    async fn fetch_roster(&self, limit: usize) -> Result<Vec<CharacterRecord>, RosterError>;

    /// Decoded portrait of one character
    async fn fetch_portrait(&self, character: &CharacterRecord) -> Result<RgbImage, RosterError>;
}

/// Failed page request, and whether one more attempt is worthwhile
struct PageFailure {
    message: String,
    retryable: bool,
}

/// HTTP client for the paginated character listing
pub struct RosterClient {
    http: reqwest::Client,
    config: RosterConfig,
}

impl RosterClient {
    pub fn new(config: &RosterConfig) -> Result<Self, RosterError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RosterError::Unavailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    pub fn portrait_url(&self, character: &CharacterRecord) -> Option<String> {
        character.portrait_url(&self.config.portrait_host)
    }

    /// Fetch one page (1-based), retrying once on transport errors and 5xx
    pub async fn fetch_page(&self, page: u32) -> Result<CharacterPage, RosterError> {
        let failure = match self.request_page(page).await {
            Ok(body) => return Ok(body),
            Err(failure) => failure,
        };

        if !failure.retryable {
            return Err(RosterError::Unavailable(failure.message));
        }

        log::warn!("Roster page {} failed ({}), retrying once", page, failure.message);
        self.request_page(page)
            .await
            .map_err(|f| RosterError::Unavailable(f.message))
    }

    async fn request_page(&self, page: u32) -> Result<CharacterPage, PageFailure> {
        let url = format!(
            "{}/api/characters?page={}",
            self.config.api_base.trim_end_matches('/'),
            page
        );
        log::debug!("Fetching roster page {}", url);

        let response = self.http.get(&url).send().await.map_err(|e| PageFailure {
            message: format!("GET {}: {}", url, e),
            retryable: true,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PageFailure {
                message: format!("GET {}: HTTP {}", url, status),
                retryable: status.is_server_error(),
            });
        }

        response.json::<CharacterPage>().await.map_err(|e| PageFailure {
            message: format!("GET {}: invalid body: {}", url, e),
            retryable: false,
        })
    }

    /// Look up a single character within the first `limit` roster entries
    pub async fn find_by_id(
        &self,
        id: u64,
        limit: usize,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        let roster = self.fetch_roster(limit).await?;
        Ok(roster.into_iter().find(|c| c.id == id))
    }
}

#[async_trait]
impl RosterSource for RosterClient {
    async fn fetch_roster(&self, limit: usize) -> Result<Vec<CharacterRecord>, RosterError> {
        if limit > self.config.limit {
            log::warn!(
                "Requested {} characters, capped at the configured roster limit of {}",
                limit,
                self.config.limit
            );
        }
        let limit = limit.min(self.config.limit);
        let pages_needed = limit.div_ceil(self.config.page_size).max(1) as u32;
        let last_page = pages_needed.min(self.config.max_pages);

        let mut roster = Vec::with_capacity(limit);
        for page in 1..=last_page {
            let body = self.fetch_page(page).await?;
            let fetched = body.results.len();
            log::info!("Fetched {} characters from page {}", fetched, page);

            roster.extend(body.results);
            if fetched == 0 || body.next.is_none() || roster.len() >= limit {
                break;
            }
        }

        if self.config.require_portrait {
            let before = roster.len();
            roster.retain(CharacterRecord::has_portrait);
            if roster.len() < before {
                log::debug!("Dropped {} characters without a portrait", before - roster.len());
            }
        }

        roster.truncate(limit);
        log::info!("Roster ready: {} characters", roster.len());
        Ok(roster)
    }

    async fn fetch_portrait(&self, character: &CharacterRecord) -> Result<RgbImage, RosterError> {
        let url = self
            .portrait_url(character)
            .ok_or_else(|| RosterError::Portrait(format!("{} has no portrait", character.name)))?;

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RosterError::Portrait(format!("GET {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(RosterError::Portrait(format!(
                "GET {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RosterError::Portrait(format!("GET {}: {}", url, e)))?;

        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| RosterError::Portrait(format!("{}: {}", url, e)))?;
        Ok(decoded.to_rgb8())
    }
}
