//! Match orchestration.
//!
//! A run walks `Idle -> LoadingRoster -> ExtractingQuery -> ScoringCandidates
//! -> Ranked -> Completed`, or ends in `Failed`. Progress is published on a
//! watch channel. Each run takes a new generation from the matcher's
//! [`MatchSession`]; a run whose generation is no longer current stops with
//! [`MatchError::Superseded`] (or [`MatchError::Cancelled`]) and publishes
//! nothing further.

use crate::cache::EmbeddingCache;
use crate::compare::{euclidean_distance, rank_by_distance, similarity, CompareError};
use crate::config::{Config, MatchingConfig, ProviderMode, ScoringConfig};
use crate::detect::DetectedFace;
use crate::embed::Embedding;
use crate::provider::local::LocalProvider;
use crate::provider::remote::{RemoteEmbedProvider, RemoteMatchClient};
use crate::provider::{
    DelegateOutcome, EmbeddingProvider, FaceAttributes, FaceOutcome, MatchDelegate, ProviderError,
    QueryImage,
};
use crate::roster::{CharacterRecord, RosterSource};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Idle,
    LoadingRoster,
    ExtractingQuery,
    ScoringCandidates,
    Ranked,
    Completed,
    Failed,
}

impl MatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchState::Completed | MatchState::Failed)
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchState::Idle => "idle",
            MatchState::LoadingRoster => "loading roster",
            MatchState::ExtractingQuery => "extracting query",
            MatchState::ScoringCandidates => "scoring candidates",
            MatchState::Ranked => "ranked",
            MatchState::Completed => "completed",
            MatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Latest progress of the current run
#[derive(Debug, Clone, PartialEq)]
pub struct MatchStatus {
    pub generation: u64,
    pub state: MatchState,
    /// 0..=100
    pub progress: u8,
    pub message: String,
}

impl Default for MatchStatus {
    fn default() -> Self {
        Self {
            generation: 0,
            state: MatchState::Idle,
            progress: 0,
            message: String::new(),
        }
    }
}

/// A scored roster entry
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub character: CharacterRecord,
    /// Position in the roster (or in the delegate's answer)
    pub roster_index: usize,
    /// `None` when a remote delegate scored the candidate
    pub distance: Option<f32>,
    pub similarity: u8,
}

/// A candidate that could not be scored, and why
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedCandidate {
    pub character: CharacterRecord,
    pub roster_index: usize,
    pub reason: String,
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct MatchReport {
    pub winner: CandidateScore,
    /// Best first, at most `top_k` entries
    pub ranked: Vec<CandidateScore>,
    pub scored: usize,
    pub skipped: Vec<SkippedCandidate>,
    pub query_attributes: Option<FaceAttributes>,
    pub query_face: Option<DetectedFace>,
}

/// Coarse failure classes callers present differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Ask for another photo
    NoFace,
    /// Infrastructure trouble, try again later
    Unavailable,
    /// Nothing on the roster could be compared
    NoCandidates,
    /// Provider broke its contract
    Contract,
    /// Replaced by a newer request
    Stale,
}

#[derive(Debug, Clone, Error)]
pub enum MatchError {
    #[error("No face found in the query image")]
    NoFaceInQuery,
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Roster unavailable: {0}")]
    RosterUnavailable(String),
    #[error("No candidate could be scored ({failed} of {attempted} failed)")]
    NoCandidatesScored { attempted: usize, failed: usize },
    #[error("Embedding dimension mismatch, expected {expected} but got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Query extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("Remote service error: {0}")]
    Remote(String),
    #[error("Superseded by a newer request")]
    Superseded,
    #[error("Cancelled")]
    Cancelled,
}

impl MatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MatchError::NoFaceInQuery => FailureKind::NoFace,
            MatchError::ModelUnavailable(_)
            | MatchError::RosterUnavailable(_)
            | MatchError::ExtractionFailed(_)
            | MatchError::Remote(_) => FailureKind::Unavailable,
            MatchError::NoCandidatesScored { .. } => FailureKind::NoCandidates,
            MatchError::DimensionMismatch { .. } => FailureKind::Contract,
            MatchError::Superseded | MatchError::Cancelled => FailureKind::Stale,
        }
    }
}

impl From<ProviderError> for MatchError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::ModelUnavailable(reason) => MatchError::ModelUnavailable(reason),
            ProviderError::DimensionMismatch { expected, actual } => {
                MatchError::DimensionMismatch { expected, actual }
            }
            ProviderError::Remote(reason) => MatchError::Remote(reason),
            ProviderError::Inference(reason) | ProviderError::Image(reason) => {
                MatchError::ExtractionFailed(reason)
            }
        }
    }
}

/// Where candidate scores come from
#[derive(Clone)]
pub enum Strategy {
    /// Embed query and portraits, rank by distance
    Embeddings(Arc<dyn EmbeddingProvider>),
    /// Upload the query, take the service's ranking
    Delegate(Arc<dyn MatchDelegate>),
}

impl Strategy {
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let strategy = match config.provider.mode {
            ProviderMode::Local => Strategy::Embeddings(Arc::new(LocalProvider::new(
                &config.detection,
                &config.embedding,
                &config.runtime,
            ))),
            ProviderMode::RemoteEmbed => {
                let url = config.remote.embed_url.clone().ok_or_else(|| {
                    ProviderError::Remote("remote.embed_url is not configured".to_string())
                })?;
                Strategy::Embeddings(Arc::new(RemoteEmbedProvider::new(
                    url,
                    &config.remote,
                    config.embedding.dimension,
                )?))
            }
            ProviderMode::RemoteMatch => {
                Strategy::Delegate(Arc::new(RemoteMatchClient::new(&config.remote)?))
            }
        };
        Ok(strategy)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionState {
    generation: u64,
    cancelled: bool,
}

/// Request generations. Starting a run or cancelling makes every earlier
/// generation stale.
#[derive(Debug)]
pub struct MatchSession {
    state: watch::Sender<SessionState>,
}

impl MatchSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self { state }
    }

    pub fn begin(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|s| {
            s.generation += 1;
            s.cancelled = false;
            generation = s.generation;
        });
        generation
    }

    pub fn cancel(&self) {
        self.state.send_modify(|s| {
            s.generation += 1;
            s.cancelled = true;
        });
    }

    pub fn current(&self) -> u64 {
        self.state.borrow().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Resolves once `generation` is stale, with the reason
    async fn stale(&self, generation: u64) -> MatchError {
        let mut rx = self.state.subscribe();
        let latest = rx.wait_for(|s| s.generation != generation).await.map(|s| *s);
        match latest {
            Ok(s) if s.cancelled && s.generation == generation + 1 => MatchError::Cancelled,
            Ok(_) => MatchError::Superseded,
            Err(_) => std::future::pending().await,
        }
    }
}

impl Default for MatchSession {
    fn default() -> Self {
        Self::new()
    }
}

enum CandidateOutcome {
    Embedded(Embedding),
    NoFace,
    Failed(String),
    Fatal(MatchError),
}

struct CandidateJob {
    roster: Arc<dyn RosterSource>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<EmbeddingCache>>,
    character: CharacterRecord,
}

impl CandidateJob {
    /// `budget` covers the portrait fetch and the extraction, not the wait for
    /// provider capacity.
    async fn run(self, budget: Duration) -> CandidateOutcome {
        if let Some(embedding) = self.cache.as_ref().and_then(|c| c.get(&self.character)) {
            log::trace!("Cached embedding for {}", self.character.name);
            return CandidateOutcome::Embedded(embedding);
        }

        let started = Instant::now();
        let portrait = match timeout(budget, self.roster.fetch_portrait(&self.character)).await {
            Ok(Ok(image)) => Arc::new(image),
            Ok(Err(e)) => return CandidateOutcome::Failed(e.to_string()),
            Err(_) => return timed_out(budget),
        };
        let remaining = budget.saturating_sub(started.elapsed());

        let slot = match self.provider.reserve().await {
            Ok(slot) => slot,
            Err(e) => return CandidateOutcome::Failed(e.to_string()),
        };
        let extraction = self.provider.extract_reserved(slot, portrait);
        let extracted = match timeout(remaining, extraction).await {
            Ok(result) => result,
            Err(_) => return timed_out(budget),
        };

        match extracted {
            Ok(FaceOutcome::Found(face)) => {
                if let Some(cache) = &self.cache {
                    cache.insert(&self.character, face.embedding.clone());
                }
                CandidateOutcome::Embedded(face.embedding)
            }
            Ok(FaceOutcome::NotFound) => CandidateOutcome::NoFace,
            Err(ProviderError::DimensionMismatch { expected, actual }) => {
                CandidateOutcome::Fatal(MatchError::DimensionMismatch { expected, actual })
            }
            Err(e) => CandidateOutcome::Failed(e.to_string()),
        }
    }
}

fn timed_out(budget: Duration) -> CandidateOutcome {
    CandidateOutcome::Failed(format!("Timed out after {}s", budget.as_secs()))
}

/// Finds the roster character closest to a query photo
pub struct Matcher {
    strategy: Strategy,
    roster: Arc<dyn RosterSource>,
    matching: MatchingConfig,
    scoring: ScoringConfig,
    roster_limit: usize,
    cache: Option<Arc<EmbeddingCache>>,
    session: MatchSession,
    status: watch::Sender<MatchStatus>,
}

impl Matcher {
    pub fn new(strategy: Strategy, roster: Arc<dyn RosterSource>, config: &Config) -> Self {
        let (status, _) = watch::channel(MatchStatus::default());
        let cache = config
            .matching
            .cache_embeddings
            .then(|| Arc::new(EmbeddingCache::new()));

        Self {
            strategy,
            roster,
            matching: config.matching.clone(),
            scoring: config.scoring.clone(),
            roster_limit: config.roster.limit,
            cache,
            session: MatchSession::new(),
            status,
        }
    }

    /// Stream of status updates for the current run
    pub fn subscribe(&self) -> watch::Receiver<MatchStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> MatchStatus {
        self.status.borrow().clone()
    }

    pub fn cache(&self) -> Option<&EmbeddingCache> {
        self.cache.as_deref()
    }

    /// Abandon the run in flight, if any
    pub fn cancel(&self) {
        log::debug!("Cancelling generation {}", self.session.current());
        self.session.cancel();
    }

    /// Match `query` against the roster. Starting a new run makes any run
    /// still in flight on this matcher stale.
    pub async fn run(&self, query: &QueryImage) -> Result<MatchReport, MatchError> {
        let generation = self.session.begin();
        log::debug!("Starting match generation {}", generation);

        let result = tokio::select! {
            result = self.execute(generation, query) => result,
            stale = self.session.stale(generation) => Err(stale),
        };

        if !self.session.is_current(generation) {
            log::debug!("Discarding result of stale generation {}", generation);
            return Err(match result {
                Err(MatchError::Cancelled) => MatchError::Cancelled,
                _ => MatchError::Superseded,
            });
        }

        match &result {
            Ok(report) => {
                log::info!(
                    "Best match: {} (similarity {}%)",
                    report.winner.character.name,
                    report.winner.similarity
                );
                self.report(
                    generation,
                    MatchState::Completed,
                    100,
                    format!("Matched {}", report.winner.character.name),
                );
            }
            Err(e) => {
                log::warn!("Match failed: {}", e);
                self.report(generation, MatchState::Failed, 100, e.to_string());
            }
        }
        result
    }

    fn report(&self, generation: u64, state: MatchState, progress: u8, message: impl Into<String>) {
        if !self.session.is_current(generation) {
            return;
        }
        let message = message.into();
        log::debug!("[{}] {}: {}", generation, state, message);
        self.status.send_replace(MatchStatus {
            generation,
            state,
            progress: progress.min(100),
            message,
        });
    }

    async fn execute(
        &self,
        generation: u64,
        query: &QueryImage,
    ) -> Result<MatchReport, MatchError> {
        match &self.strategy {
            Strategy::Embeddings(provider) => {
                self.match_embeddings(generation, provider, query).await
            }
            Strategy::Delegate(delegate) => {
                self.match_delegate(generation, delegate.as_ref(), query).await
            }
        }
    }

    async fn match_embeddings(
        &self,
        generation: u64,
        provider: &Arc<dyn EmbeddingProvider>,
        query: &QueryImage,
    ) -> Result<MatchReport, MatchError> {
        self.report(generation, MatchState::LoadingRoster, 5, "Loading characters");
        let roster = self
            .roster
            .fetch_roster(self.roster_limit)
            .await
            .map_err(|e| MatchError::RosterUnavailable(e.to_string()))?;
        if roster.is_empty() {
            return Err(MatchError::RosterUnavailable("Roster is empty".to_string()));
        }

        self.report(generation, MatchState::ExtractingQuery, 15, "Analyzing your photo");
        provider.ensure_ready().await?;
        let face = match provider.extract(Arc::clone(&query.image)).await? {
            FaceOutcome::Found(face) => face,
            FaceOutcome::NotFound => return Err(MatchError::NoFaceInQuery),
        };
        if face.embedding.len() != provider.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: provider.dimension(),
                actual: face.embedding.len(),
            });
        }

        let candidates: Vec<(usize, CharacterRecord)> = roster
            .into_iter()
            .take(self.matching.max_candidates)
            .enumerate()
            .collect();
        let attempted = candidates.len();
        self.report(
            generation,
            MatchState::ScoringCandidates,
            20,
            format!("Comparing against {} characters", attempted),
        );

        let outcomes = self.embed_candidates(generation, provider, candidates).await;

        let mut scored: Vec<(usize, CharacterRecord, f32)> = Vec::new();
        let mut skipped = Vec::new();
        for (roster_index, character, outcome) in outcomes {
            let reason = match outcome {
                CandidateOutcome::Embedded(embedding) => {
                    let distance = euclidean_distance(&face.embedding, &embedding).map_err(
                        |CompareError::DimensionMismatch { left, right }| {
                            MatchError::DimensionMismatch {
                                expected: left,
                                actual: right,
                            }
                        },
                    )?;
                    log::debug!("{}: distance {:.4}", character.name, distance);
                    scored.push((roster_index, character, distance));
                    continue;
                }
                CandidateOutcome::Fatal(e) => return Err(e),
                CandidateOutcome::NoFace => "No face found in portrait".to_string(),
                CandidateOutcome::Failed(reason) => reason,
            };
            log::warn!("Skipping {}: {}", character.name, reason);
            skipped.push(SkippedCandidate {
                character,
                roster_index,
                reason,
            });
        }

        if scored.is_empty() {
            return Err(MatchError::NoCandidatesScored {
                attempted,
                failed: attempted,
            });
        }

        let distances: Vec<f32> = scored.iter().map(|(_, _, d)| *d).collect();
        let ranked: Vec<CandidateScore> = rank_by_distance(&distances)
            .into_iter()
            .map(|i| {
                let (roster_index, character, distance) = &scored[i];
                CandidateScore {
                    character: character.clone(),
                    roster_index: *roster_index,
                    distance: Some(*distance),
                    similarity: similarity(*distance, &self.scoring),
                }
            })
            .collect();

        self.finish(generation, ranked, skipped, face.attributes, face.detection)
    }

    /// Embed every candidate, at most `max_concurrent` at a time, and wait
    /// for all of them. Results come back in roster order, one per candidate.
    async fn embed_candidates(
        &self,
        generation: u64,
        provider: &Arc<dyn EmbeddingProvider>,
        candidates: Vec<(usize, CharacterRecord)>,
    ) -> Vec<(usize, CharacterRecord, CandidateOutcome)> {
        let total = candidates.len();
        let semaphore = Arc::new(Semaphore::new(self.matching.max_concurrent));
        let budget = Duration::from_secs(self.matching.candidate_timeout_secs);
        let mut tasks = JoinSet::new();

        for (position, (_, character)) in candidates.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let job = CandidateJob {
                roster: Arc::clone(&self.roster),
                provider: Arc::clone(provider),
                cache: self.cache.clone(),
                character: character.clone(),
            };

            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => job.run(budget).await,
                    Err(_) => CandidateOutcome::Failed("Worker pool closed".to_string()),
                };
                (position, outcome)
            });
        }

        let mut outcomes: Vec<Option<CandidateOutcome>> = (0..total).map(|_| None).collect();
        let mut settled = 0;
        while let Some(joined) = tasks.join_next().await {
            settled += 1;
            match joined {
                Ok((position, outcome)) => outcomes[position] = Some(outcome),
                Err(e) => log::warn!("Candidate task failed: {}", e),
            }
            let progress = 20 + (70 * settled / total.max(1)) as u8;
            self.report(
                generation,
                MatchState::ScoringCandidates,
                progress,
                format!("Compared {} of {} characters", settled, total),
            );
        }

        candidates
            .into_iter()
            .zip(outcomes)
            .map(|((roster_index, character), outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    CandidateOutcome::Failed("Candidate task panicked".to_string())
                });
                (roster_index, character, outcome)
            })
            .collect()
    }

    async fn match_delegate(
        &self,
        generation: u64,
        delegate: &dyn MatchDelegate,
        query: &QueryImage,
    ) -> Result<MatchReport, MatchError> {
        self.report(
            generation,
            MatchState::ExtractingQuery,
            15,
            "Sending photo to matching service",
        );

        let answer = match delegate.match_image(query).await? {
            DelegateOutcome::Matched(answer) => answer,
            DelegateOutcome::NoFace => return Err(MatchError::NoFaceInQuery),
            DelegateOutcome::Unknown { considered } => {
                log::info!(
                    "Matching service found no confident match among {} candidates",
                    considered
                );
                return Err(MatchError::NoCandidatesScored {
                    attempted: considered,
                    failed: considered,
                });
            }
        };
        if answer.is_empty() {
            return Err(MatchError::NoCandidatesScored {
                attempted: 0,
                failed: 0,
            });
        }

        let ranked = answer
            .into_iter()
            .enumerate()
            .map(|(roster_index, candidate)| CandidateScore {
                character: candidate.character,
                roster_index,
                distance: None,
                similarity: candidate.similarity,
            })
            .collect();

        self.finish(generation, ranked, Vec::new(), None, None)
    }

    fn finish(
        &self,
        generation: u64,
        mut ranked: Vec<CandidateScore>,
        skipped: Vec<SkippedCandidate>,
        query_attributes: Option<FaceAttributes>,
        query_face: Option<DetectedFace>,
    ) -> Result<MatchReport, MatchError> {
        let scored = ranked.len();
        let winner = ranked.first().cloned().ok_or(MatchError::NoCandidatesScored {
            attempted: skipped.len(),
            failed: skipped.len(),
        })?;

        ranked.truncate(self.matching.top_k.max(1));
        for (place, candidate) in ranked.iter().enumerate() {
            log::info!(
                "#{} {} similarity {}%{}",
                place + 1,
                candidate.character.name,
                candidate.similarity,
                candidate
                    .distance
                    .map(|d| format!(" (distance {:.4})", d))
                    .unwrap_or_default()
            );
        }

        self.report(
            generation,
            MatchState::Ranked,
            95,
            format!("Ranked {} characters, {} skipped", scored, skipped.len()),
        );

        Ok(MatchReport {
            winner,
            ranked,
            scored,
            skipped,
            query_attributes,
            query_face,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DelegateCandidate, FaceData, InferenceSlot, InitCell};
    use crate::roster::RosterError;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use ndarray::arr1;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    
    const QUERY: u8 = 0;
    const SLOW_QUERY: u8 = 200;

    #[derive(Clone)]
    enum Behavior {
        Embed(Vec<f32>),
        NoFace,
        Fail,
        Hang,
        Panic,
        /// Embeds after 50ms
        Slow(Vec<f32>),
    }

    /// Answers by the red channel of pixel (0, 0)
    struct FakeProvider {
        behaviors: HashMap<u8, Behavior>,
        dimension: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        inits: Arc<AtomicUsize>,
        ready: InitCell<()>,
    }

    impl FakeProvider {
        fn new(behaviors: Vec<(u8, Behavior)>) -> Self {
            Self {
                behaviors: behaviors.into_iter().collect(),
                dimension: 2,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                inits: Arc::new(AtomicUsize::new(0)),
                ready: InitCell::new(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn answer(&self, key: u8) -> Result<FaceOutcome, ProviderError> {
            if key == SLOW_QUERY {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            match self.behaviors.get(&key).cloned() {
                Some(Behavior::Embed(values)) => Ok(found(&values)),
                Some(Behavior::Slow(values)) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(found(&values))
                }
                Some(Behavior::NoFace) => Ok(FaceOutcome::NotFound),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(FaceOutcome::NotFound)
                }
                Some(Behavior::Panic) => panic!("portrait decoder crashed on {}", key),
                Some(Behavior::Fail) | None => {
                    Err(ProviderError::Inference(format!("bad input {}", key)))
                }
            }
        }
    }

    fn found(values: &[f32]) -> FaceOutcome {
        FaceOutcome::Found(FaceData {
            embedding: arr1(values),
            attributes: None,
            detection: None,
        })
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        async fn ensure_ready(&self) -> Result<(), ProviderError> {
            let inits = Arc::clone(&self.inits);
            self.ready
                .get_or_init(move || async move {
                    inits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
                .map(|_| ())
        }

        async fn extract(&self, image: Arc<RgbImage>) -> Result<FaceOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = self.answer(image.get_pixel(0, 0)[0]).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// One inference at a time. The slot stays with the spawned work, so
    /// work abandoned by a timed-out caller keeps the gate until it ends.
    struct GatedProvider {
        gate: Arc<Semaphore>,
        work: HashMap<u8, Duration>,
    }

    #[async_trait]
    impl EmbeddingProvider for GatedProvider {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn ensure_ready(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn extract(&self, image: Arc<RgbImage>) -> Result<FaceOutcome, ProviderError> {
            let slot = self.reserve().await?;
            self.extract_reserved(slot, image).await
        }

        async fn reserve(&self) -> Result<InferenceSlot, ProviderError> {
            let permit = Arc::clone(&self.gate)
                .acquire_owned()
                .await
                .map_err(|e| ProviderError::Inference(e.to_string()))?;
            Ok(InferenceSlot::from_permit(permit))
        }

        async fn extract_reserved(
            &self,
            slot: InferenceSlot,
            image: Arc<RgbImage>,
        ) -> Result<FaceOutcome, ProviderError> {
            let key = image.get_pixel(0, 0)[0];
            let work = self.work.get(&key).copied().unwrap_or_default();

            tokio::spawn(async move {
                let _slot = slot;
                tokio::time::sleep(work).await;
                Ok::<_, ProviderError>(found(&[key as f32 / 100.0, 0.0]))
            })
            .await
            .map_err(|e| ProviderError::Inference(e.to_string()))?
        }
    }

    struct FakeRoster {
        characters: Vec<CharacterRecord>,
        unavailable: bool,
        portrait_fetches: AtomicUsize,
    }

    impl FakeRoster {
        fn new(ids: &[u8]) -> Self {
            Self {
                characters: ids.iter().map(|&id| character(id)).collect(),
                unavailable: false,
                portrait_fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RosterSource for FakeRoster {
        async fn fetch_roster(&self, limit: usize) -> Result<Vec<CharacterRecord>, RosterError> {
            if self.unavailable {
                return Err(RosterError::Unavailable("HTTP 503".to_string()));
            }
            Ok(self.characters.iter().take(limit).cloned().collect())
        }

        async fn fetch_portrait(
            &self,
            character: &CharacterRecord,
        ) -> Result<RgbImage, RosterError> {
            self.portrait_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(pixel_image(character.id as u8))
        }
    }

    struct FakeDelegate {
        outcome: DelegateOutcome,
    }

    #[async_trait]
    impl MatchDelegate for FakeDelegate {
        async fn match_image(&self, _query: &QueryImage) -> Result<DelegateOutcome, ProviderError> {
            Ok(self.outcome.clone())
        }
    }

    fn character(id: u8) -> CharacterRecord {
        CharacterRecord {
            id: id as u64,
            name: format!("Character {}", id),
            portrait_path: Some(format!("/character/{}.webp", id)),
            age: None,
            gender: None,
            occupation: None,
            status: None,
            phrases: Vec::new(),
        }
    }

    fn pixel_image(key: u8) -> RgbImage {
        RgbImage::from_pixel(2, 2, Rgb([key, 0, 0]))
    }

    fn query(key: u8) -> QueryImage {
        QueryImage::from_image(pixel_image(key)).unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.matching.cache_embeddings = false;
        config
    }

    fn matcher_with(provider: Arc<FakeProvider>, roster: Arc<FakeRoster>) -> Matcher {
        Matcher::new(Strategy::Embeddings(provider), roster, &test_config())
    }

    #[tokio::test]
    async fn test_picks_minimum_distance() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![1.0, 0.0])),
            (1, Behavior::Embed(vec![0.8, 0.0])),
            (2, Behavior::Embed(vec![0.5, 0.0])),
        ]));
        let roster = Arc::new(FakeRoster::new(&[1, 2]));
        let matcher = matcher_with(provider, roster);

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.winner.character.name, "Character 1");
        let a = &report.ranked[0];
        let b = &report.ranked[1];
        assert!((a.distance.unwrap() - 0.2).abs() < 1e-6);
        assert!((b.distance.unwrap() - 0.5).abs() < 1e-6);
        assert!(a.similarity >= b.similarity);
        assert!(b.similarity <= 100);
        assert_eq!(matcher.status().state, MatchState::Completed);
        assert_eq!(matcher.status().progress, 100);
    }

    #[tokio::test]
    async fn test_no_face_in_query_skips_candidates() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::NoFace),
            (1, Behavior::Embed(vec![1.0, 0.0])),
        ]));
        let roster = Arc::new(FakeRoster::new(&[1, 2, 3]));
        let matcher = matcher_with(Arc::clone(&provider), Arc::clone(&roster));

        let err = matcher.run(&query(QUERY)).await.unwrap_err();

        assert!(matches!(err, MatchError::NoFaceInQuery));
        assert_eq!(err.kind(), FailureKind::NoFace);
        assert_eq!(provider.calls(), 1);
        assert_eq!(roster.portrait_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(matcher.status().state, MatchState::Failed);
    }

    #[tokio::test]
    async fn test_partial_failures_still_rank() {
        let mut behaviors = vec![(QUERY, Behavior::Embed(vec![0.0, 0.0]))];
        for id in 1..=10u8 {
            let behavior = match id {
                2 | 5 => Behavior::Fail,
                9 => Behavior::NoFace,
                _ => Behavior::Embed(vec![id as f32, 0.0]),
            };
            behaviors.push((id, behavior));
        }

        let provider = Arc::new(FakeProvider::new(behaviors));
        let roster = Arc::new(FakeRoster::new(&[10, 9, 8, 7, 6, 5, 4, 3, 2, 1]));
        let matcher = matcher_with(provider, roster);

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.scored, 7);
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(report.winner.character.id, 1);
        let skipped: Vec<u64> = report.skipped.iter().map(|s| s.character.id).collect();
        assert_eq!(skipped, vec![9, 5, 2]);
        let ranked: Vec<u64> = report.ranked.iter().map(|c| c.character.id).collect();
        assert_eq!(ranked, vec![1, 3, 4, 6, 7]);
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let provider = Arc::new(FakeProvider::new(vec![(QUERY, Behavior::Embed(vec![1.0, 0.0]))]));
        let roster = Arc::new(FakeRoster::new(&[1, 2, 3, 4]));
        let matcher = matcher_with(provider, roster);

        let err = matcher.run(&query(QUERY)).await.unwrap_err();

        assert!(matches!(
            err,
            MatchError::NoCandidatesScored { attempted: 4, failed: 4 }
        ));
        assert_eq!(err.kind(), FailureKind::NoCandidates);
    }

    #[tokio::test]
    async fn test_ties_resolve_to_roster_order() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (1, Behavior::Embed(vec![0.0, 0.7])),
            (2, Behavior::Embed(vec![0.3, 0.0])),
            (3, Behavior::Embed(vec![0.0, 0.3])),
        ]));
        let roster = Arc::new(FakeRoster::new(&[1, 3, 2]));
        let matcher = matcher_with(provider, roster);

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.winner.character.id, 3);
        assert_eq!(report.ranked[1].character.id, 2);
        assert_eq!(report.ranked[0].roster_index, 1);
    }

    #[tokio::test]
    async fn test_candidate_cap_and_top_k() {
        let mut behaviors = vec![(QUERY, Behavior::Embed(vec![0.0, 0.0]))];
        behaviors.extend((1..=40u8).map(|id| (id, Behavior::Embed(vec![id as f32 / 100.0, 0.0]))));
        let provider = Arc::new(FakeProvider::new(behaviors));
        let roster = Arc::new(FakeRoster::new(&(1..=40u8).rev().collect::<Vec<_>>()));
        let matcher = matcher_with(Arc::clone(&provider), Arc::clone(&roster));

        let report = matcher.run(&query(QUERY)).await.unwrap();

        // Default cap of 30 takes ids 40..=11
        assert_eq!(report.scored, 30);
        assert_eq!(report.winner.character.id, 11);
        assert_eq!(report.ranked.len(), 5);
        assert_eq!(provider.calls(), 31);
    }

    #[tokio::test]
    async fn test_roster_unavailable() {
        let provider = Arc::new(FakeProvider::new(vec![(QUERY, Behavior::Embed(vec![1.0, 0.0]))]));
        let mut roster = FakeRoster::new(&[1]);
        roster.unavailable = true;
        let matcher = matcher_with(Arc::clone(&provider), Arc::new(roster));

        let err = matcher.run(&query(QUERY)).await.unwrap_err();
        assert!(matches!(err, MatchError::RosterUnavailable(_)));
        assert_eq!(err.kind(), FailureKind::Unavailable);
        assert_eq!(provider.calls(), 0);

        let empty = matcher_with(provider, Arc::new(FakeRoster::new(&[])));
        assert!(matches!(
            empty.run(&query(QUERY)).await,
            Err(MatchError::RosterUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_candidate_dimension_mismatch_aborts() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![1.0, 0.0])),
            (1, Behavior::Embed(vec![1.0, 0.0])),
            (2, Behavior::Embed(vec![1.0, 0.0, 0.0])),
        ]));
        let matcher = matcher_with(provider, Arc::new(FakeRoster::new(&[1, 2])));

        let err = matcher.run(&query(QUERY)).await.unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(err.kind(), FailureKind::Contract);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_candidate_times_out() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (1, Behavior::Hang),
            (2, Behavior::Embed(vec![0.4, 0.0])),
        ]));
        let matcher = matcher_with(provider, Arc::new(FakeRoster::new(&[1, 2])));

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.winner.character.id, 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("Timed out"));
    }

    #[tokio::test]
    async fn test_panicking_candidate_is_recorded_as_skipped() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (1, Behavior::Embed(vec![0.3, 0.0])),
            (2, Behavior::Panic),
            (3, Behavior::Embed(vec![0.1, 0.0])),
        ]));
        let matcher = matcher_with(provider, Arc::new(FakeRoster::new(&[1, 2, 3])));

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.scored, 2);
        assert_eq!(report.scored + report.skipped.len(), 3);
        assert_eq!(report.skipped[0].character.id, 2);
        assert_eq!(report.skipped[0].roster_index, 1);
        assert!(report.skipped[0].reason.contains("panicked"));
        assert_eq!(report.winner.character.id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_extractions_are_capped() {
        let mut behaviors = vec![(QUERY, Behavior::Embed(vec![0.0, 0.0]))];
        behaviors.extend((1..=10u8).map(|id| (id, Behavior::Slow(vec![id as f32, 0.0]))));
        let provider = Arc::new(FakeProvider::new(behaviors));
        let roster = Arc::new(FakeRoster::new(&(1..=10u8).collect::<Vec<_>>()));

        let mut config = test_config();
        config.matching.max_concurrent = 2;
        let matcher = Matcher::new(
            Strategy::Embeddings(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>),
            roster,
            &config,
        );

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.scored, 10);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_busy_provider_is_not_timed() {
        let mut work: HashMap<u8, Duration> =
            (1..=4u8).map(|id| (id, Duration::from_millis(400))).collect();
        work.insert(5, Duration::from_millis(1500));
        let provider = Arc::new(GatedProvider {
            gate: Arc::new(Semaphore::new(1)),
            work,
        });

        let mut config = test_config();
        config.matching.candidate_timeout_secs = 1;
        config.matching.max_concurrent = 5;
        let matcher = Matcher::new(
            Strategy::Embeddings(provider),
            Arc::new(FakeRoster::new(&[5, 1, 2, 3, 4])),
            &config,
        );

        let report = matcher.run(&query(QUERY)).await.unwrap();

        // Only the inference longer than the budget is dropped; the others
        // queue well past one second but each finishes within it
        assert_eq!(report.scored, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].character.id, 5);
        assert!(report.skipped[0].reason.contains("Timed out"));
        assert_eq!(report.winner.character.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_supersedes() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (SLOW_QUERY, Behavior::Embed(vec![1.0, 0.0])),
            (1, Behavior::Embed(vec![0.1, 0.0])),
        ]));
        let matcher = matcher_with(provider, Arc::new(FakeRoster::new(&[1])));
        let mut status = matcher.subscribe();

        let slow = query(SLOW_QUERY);
        let fast = query(QUERY);
        let (first, second) = tokio::join!(matcher.run(&slow), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            matcher.run(&fast).await
        });

        assert!(matches!(first, Err(MatchError::Superseded)));
        assert_eq!(first.unwrap_err().kind(), FailureKind::Stale);
        assert_eq!(second.unwrap().winner.character.id, 1);

        let last = status.borrow_and_update().clone();
        assert_eq!(last.generation, 2);
        assert_eq!(last.state, MatchState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let provider = Arc::new(FakeProvider::new(vec![
            (SLOW_QUERY, Behavior::Embed(vec![1.0, 0.0])),
            (1, Behavior::Embed(vec![0.1, 0.0])),
        ]));
        let matcher = matcher_with(provider, Arc::new(FakeRoster::new(&[1])));

        let slow = query(SLOW_QUERY);
        let (result, _) = tokio::join!(matcher.run(&slow), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            matcher.cancel();
        });

        assert!(matches!(result, Err(MatchError::Cancelled)));
        assert_ne!(matcher.status().state, MatchState::Completed);
    }

    #[tokio::test]
    async fn test_provider_initialised_once_across_runs() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (1, Behavior::Embed(vec![0.1, 0.0])),
        ]));
        let first = matcher_with(Arc::clone(&provider), Arc::new(FakeRoster::new(&[1])));
        let second = matcher_with(Arc::clone(&provider), Arc::new(FakeRoster::new(&[1])));

        let q = query(QUERY);
        let (a, b) = tokio::join!(first.run(&q), second.run(&q));
        assert!(a.is_ok() && b.is_ok());
        assert!(first.run(&q).await.is_ok());

        assert_eq!(provider.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_reused_between_runs() {
        let provider = Arc::new(FakeProvider::new(vec![
            (QUERY, Behavior::Embed(vec![0.0, 0.0])),
            (1, Behavior::Embed(vec![0.1, 0.0])),
            (2, Behavior::NoFace),
        ]));
        let roster = Arc::new(FakeRoster::new(&[1, 2]));
        let matcher = Matcher::new(
            Strategy::Embeddings(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>),
            Arc::clone(&roster) as Arc<dyn RosterSource>,
            &Config::default(),
        );

        matcher.run(&query(QUERY)).await.unwrap();
        matcher.run(&query(QUERY)).await.unwrap();

        // Character 2 has no face, so it is fetched again
        assert_eq!(roster.portrait_fetches.load(Ordering::SeqCst), 3);
        assert_eq!(matcher.cache().map(|c| c.len()), Some(1));
    }

    #[tokio::test]
    async fn test_delegate_strategy() {
        let mut homer = character(1);
        homer.name = "Homer Simpson".to_string();
        let delegate = Arc::new(FakeDelegate {
            outcome: DelegateOutcome::Matched(vec![
                DelegateCandidate {
                    character: homer,
                    similarity: 88,
                },
                DelegateCandidate {
                    character: character(2),
                    similarity: 71,
                },
            ]),
        });
        let roster = Arc::new(FakeRoster::new(&[]));
        let matcher = Matcher::new(
            Strategy::Delegate(delegate),
            roster.clone(),
            &Config::default(),
        );

        let report = matcher.run(&query(QUERY)).await.unwrap();

        assert_eq!(report.winner.character.name, "Homer Simpson");
        assert_eq!(report.winner.similarity, 88);
        assert!(report.winner.distance.is_none());
        assert_eq!(report.scored, 2);
    }

    #[tokio::test]
    async fn test_delegate_unknown_and_no_face() {
        let unknown = Matcher::new(
            Strategy::Delegate(Arc::new(FakeDelegate {
                outcome: DelegateOutcome::Unknown { considered: 3 },
            })),
            Arc::new(FakeRoster::new(&[])),
            &Config::default(),
        );
        assert!(matches!(
            unknown.run(&query(QUERY)).await,
            Err(MatchError::NoCandidatesScored { attempted: 3, failed: 3 })
        ));

        let no_face = Matcher::new(
            Strategy::Delegate(Arc::new(FakeDelegate {
                outcome: DelegateOutcome::NoFace,
            })),
            Arc::new(FakeRoster::new(&[])),
            &Config::default(),
        );
        assert!(matches!(
            no_face.run(&query(QUERY)).await,
            Err(MatchError::NoFaceInQuery)
        ));
    }

    #[test]
    fn test_session_generations() {
        let session = MatchSession::new();
        let first = session.begin();
        let second = session.begin();

        assert!(second > first);
        assert!(!session.is_current(first));
        assert!(session.is_current(second));

        session.cancel();
        assert!(!session.is_current(second));
    }

    #[test]
    fn test_failure_kinds_are_distinct() {
        assert_eq!(
            MatchError::from(ProviderError::ModelUnavailable("x".into())).kind(),
            FailureKind::Unavailable
        );
        assert_eq!(MatchError::NoFaceInQuery.kind(), FailureKind::NoFace);
        assert_ne!(
            MatchError::NoCandidatesScored { attempted: 1, failed: 1 }.kind(),
            MatchError::RosterUnavailable("down".into()).kind()
        );
    }
}
