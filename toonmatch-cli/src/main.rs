use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use toonmatch_core::config::Config;
use toonmatch_core::provider::local::save_debug_visualization;
use toonmatch_core::{Error, FailureKind, MatchReport, RosterSource, Toonmatch};

#[derive(Parser)]
#[command(name = "toonmatch")]
#[command(about = "Find the cartoon character you look most like", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to /etc/toonmatch or ~/.config/toonmatch)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Match a photo against the character roster
    Match {
        /// Photo to match
        photo: PathBuf,
        /// Number of ranked characters to show
        #[arg(short, long)]
        top: Option<usize>,
        /// Save a visualization of the detected face
        #[arg(long)]
        debug: Option<PathBuf>,
    },
    /// List the character roster
    Roster {
        /// Maximum number of characters (capped at roster.limit in the config)
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Match { photo, top, debug } => cmd_match(config, photo, top, debug).await,
        Commands::Roster { limit } => cmd_roster(config, limit).await,
        Commands::Config { validate } => cmd_config(config, validate),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(Config::load()?),
    }
}

async fn cmd_match(
    mut config: Config,
    photo: PathBuf,
    top: Option<usize>,
    debug: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(top) = top {
        config.matching.top_k = top.max(1);
    }

    let app = Toonmatch::new(config)?;
    println!("Matching {}...", photo.display());

    let mut status = app.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let update = status.borrow_and_update().clone();
            log::debug!("{:>3}% {}", update.progress, update.message);
            if update.state.is_terminal() {
                break;
            }
        }
    });

    let start = Instant::now();
    let report = match app.match_file(&photo).await {
        Ok(report) => report,
        Err(Error::Match(e)) => {
            let advice = match e.kind() {
                FailureKind::NoFace => {
                    "No face found in the photo. Try a clear, front-facing picture."
                }
                FailureKind::Unavailable => {
                    "The matching service is unavailable right now. Please try again later."
                }
                FailureKind::NoCandidates => "No character could be compared with your photo.",
                FailureKind::Contract => "The embedding provider returned inconsistent data.",
                FailureKind::Stale => "The request was replaced by a newer one.",
            };
            println!("\n✗ {}", advice);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    print_report(&report);
    println!("\nTotal time: {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
    if let Some(cache) = app.matcher().cache() {
        log::debug!("{} portrait embeddings cached", cache.len());
    }

    if let Some(debug_path) = debug {
        match &report.query_face {
            Some(face) => {
                let frame = image::open(&photo)?.to_rgb8();
                save_debug_visualization(&frame, face, &debug_path)?;
                println!("📷 Debug visualization saved to: {}", debug_path.display());
            }
            None => println!("No face location available for a debug visualization"),
        }
    }

    Ok(())
}

fn print_report(report: &MatchReport) {
    let winner = &report.winner;
    println!();
    println!("✓ You look like {}! ({}% similar)", winner.character.name, winner.similarity);
    if let Some(occupation) = &winner.character.occupation {
        println!("  Occupation: {}", occupation);
    }
    if let Some(phrase) = winner.character.phrases.first() {
        println!("  \"{}\"", phrase);
    }

    if let Some((expression, score)) = report
        .query_attributes
        .as_ref()
        .and_then(|a| a.dominant_expression())
    {
        println!("  Your expression: {} ({:.0}%)", expression, score * 100.0);
    }

    println!();
    println!("{:<4} {:<30} {:>10} {:>10}", "#", "Character", "Similarity", "Distance");
    println!("{}", "-".repeat(57));
    for (place, candidate) in report.ranked.iter().enumerate() {
        let distance = candidate
            .distance
            .map(|d| format!("{:.4}", d))
            .unwrap_or_else(|| "—".to_string());
        println!(
            "{:<4} {:<30} {:>9}% {:>10}",
            place + 1,
            candidate.character.name,
            candidate.similarity,
            distance
        );
    }

    if !report.skipped.is_empty() {
        println!(
            "\n{} of {} characters skipped",
            report.skipped.len(),
            report.scored + report.skipped.len()
        );
        for skipped in &report.skipped {
            log::debug!("  {}: {}", skipped.character.name, skipped.reason);
        }
    }
}

async fn cmd_roster(config: Config, limit: Option<usize>) -> anyhow::Result<()> {
    let limit = limit.unwrap_or(config.roster.limit);
    let app = Toonmatch::new(config)?;

    let roster = app.roster().fetch_roster(limit).await?;
    if roster.is_empty() {
        println!("The roster is empty");
        return Ok(());
    }

    println!("{:<6} {:<30} {:<30}", "ID", "Name", "Occupation");
    println!("{}", "-".repeat(66));
    for character in &roster {
        println!(
            "{:<6} {:<30} {:<30}",
            character.id,
            character.name,
            character.occupation.as_deref().unwrap_or("—")
        );
    }
    println!("\n{} characters", roster.len());

    Ok(())
}

fn cmd_config(config: Config, validate: bool) -> anyhow::Result<()> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration:");
    println!();

    println!("[provider]");
    println!("  mode = {:?}", config.provider.mode);
    println!();

    println!("[detection]");
    println!("  model = {:?}", config.detection.model_path);
    println!("  confidence_threshold = {}", config.detection.confidence_threshold);
    println!();

    println!("[embedding]");
    println!("  model = {:?}", config.embedding.model_path);
    println!("  dimension = {}", config.embedding.dimension);
    println!();

    println!("[remote]");
    println!("  embed_url = {}", config.remote.embed_url.as_deref().unwrap_or("(unset)"));
    println!("  match_url = {}", config.remote.match_url);
    println!("  timeout = {}s", config.remote.timeout_secs);
    println!();

    println!("[roster]");
    println!("  api_base = {}", config.roster.api_base);
    println!("  portrait_host = {}", config.roster.portrait_host);
    println!(
        "  pages = {} x {} (limit {})",
        config.roster.max_pages, config.roster.page_size, config.roster.limit
    );
    println!("  require_portrait = {}", config.roster.require_portrait);
    println!();

    println!("[matching]");
    println!("  max_candidates = {}", config.matching.max_candidates);
    println!("  max_concurrent = {}", config.matching.max_concurrent);
    println!("  candidate_timeout = {}s", config.matching.candidate_timeout_secs);
    println!("  top_k = {}", config.matching.top_k);
    println!("  cache_embeddings = {}", config.matching.cache_embeddings);
    println!();

    println!("[scoring]");
    println!(
        "  distance {} -> {}%, {} -> {}%",
        config.scoring.near_distance,
        config.scoring.near_similarity,
        config.scoring.far_distance,
        config.scoring.floor_similarity
    );
    println!();

    println!("[runtime]");
    match config.runtime.intra_threads {
        Some(threads) => println!("  intra_threads = {}", threads),
        None => println!("  intra_threads = auto"),
    }

    Ok(())
}
