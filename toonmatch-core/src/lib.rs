pub mod align;
pub mod cache;
pub mod compare;
pub mod config;
pub mod detect;
pub mod embed;
pub mod matcher;
pub mod provider;
pub mod roster;
pub mod runtime;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

pub use matcher::{FailureKind, MatchError, MatchReport, MatchState, MatchStatus, Matcher, Strategy};
pub use provider::QueryImage;
pub use roster::{CharacterRecord, RosterClient, RosterSource};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Provider error: {0}")]
    Provider(#[from] provider::ProviderError),
    #[error("Roster error: {0}")]
    Roster(#[from] roster::RosterError),
    #[error(transparent)]
    Match(#[from] matcher::MatchError),
}

/// Character lookalike matching over the configured provider and roster
pub struct Toonmatch {
    roster: Arc<RosterClient>,
    matcher: Matcher,
}

impl Toonmatch {
    pub fn new(config: config::Config) -> Result<Self, Error> {
        config.validate()?;

        let roster = Arc::new(RosterClient::new(&config.roster)?);
        let strategy = Strategy::from_config(&config)?;
        let matcher = Matcher::new(strategy, Arc::clone(&roster) as Arc<dyn RosterSource>, &config);

        Ok(Self {
            roster,
            matcher,
        })
    }

    pub fn roster(&self) -> &RosterClient {
        &self.roster
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn subscribe(&self) -> watch::Receiver<MatchStatus> {
        self.matcher.subscribe()
    }

    /// Match an image file on disk
    pub async fn match_file<P: AsRef<Path>>(&self, path: P) -> Result<MatchReport, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "query.jpg".to_string());

        self.match_bytes(bytes, file_name).await
    }

    /// Match an encoded image
    pub async fn match_bytes(
        &self,
        bytes: Vec<u8>,
        file_name: String,
    ) -> Result<MatchReport, Error> {
        let query = QueryImage::from_bytes(bytes, file_name)?;
        Ok(self.matcher.run(&query).await?)
    }
}
