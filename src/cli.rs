//! CLI parsing and orchestration: table of contents -> chapter fetches -> EPUB volumes.
//! Maps errors to exit codes.

use crate::config::{self, Config};
use crate::epub::EpubVersion;
use crate::model::chapter_count;
use crate::scraper::fetch::{EngineError, FetchPool, Reporter, RetryPolicy, DEFAULT_CONCURRENCY};
use crate::scraper::toc::{build_arcs, flatten, parse_toc_page};
use crate::scraper::{HttpClient, ScraperError, Transport, DEFAULT_TIMEOUT_SECS, DEFAULT_TOC_URL};
use crate::volume::{bind_all, plan_volumes, BindOptions, CoverSet, VolumeError};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Toc(#[from] ScraperError),

    #[error("{0}")]
    Fetch(#[from] EngineError),

    #[error("{0}")]
    Volume(#[from] VolumeError),

    #[error("{failed} of {total} volume(s) failed to bind")]
    Volumes { failed: usize, total: usize },

    #[error("{0}")]
    Output(String),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Toc(_) | CliRunError::Fetch(_) => 2,
            CliRunError::Volume(_) | CliRunError::Volumes { .. } | CliRunError::Output(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "worm-binder")]
#[command(about = "Download the Worm web serial and bind it into EPUB volumes")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, timeout_secs, concurrency, max_attempts, retry_delay_ms, toc_url) are read from ./worm-binder.toml or the user config dir. CLI flags override config."
)]
pub struct Args {
    /// Compile into a single file instead of one volume per book.
    #[arg(short, long)]
    pub single: bool,

    /// Cover set for the per-book volumes: sandara or TyrialFrost. Ignored with --single.
    #[arg(short, long, default_value = "sandara", value_parser = parse_covers)]
    pub covers: CoverSet,

    /// Generate a strict EPUB 2 instead of an EPUB 3.
    #[arg(long)]
    pub epub2: bool,

    /// Print a line per chapter (and per failed attempt) instead of a progress bar.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress progress output (errors only).
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Directory to write the EPUB files to (overrides config; default: current directory).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum chapter fetches in flight (overrides config; default 16).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Give up on a chapter after this many attempts (overrides config; default: retry forever).
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// HTTP User-Agent (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Request timeout in seconds (overrides config; default 30).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Page holding the table of contents (overrides config).
    #[arg(long)]
    pub toc_url: Option<String>,

    /// Parse the table of contents, print it as JSON, and exit without fetching chapters.
    #[arg(long)]
    pub dump_toc: bool,
}

fn parse_covers(s: &str) -> Result<CoverSet, String> {
    match s.to_lowercase().as_str() {
        "sandara" => Ok(CoverSet::Sandara),
        "tyrialfrost" => Ok(CoverSet::TyrialFrost),
        _ => Err(format!(
            "Invalid --covers value: '{}'. Use sandara or TyrialFrost.",
            s
        )),
    }
}

/// Settings after applying CLI flags over config over defaults.
#[derive(Debug)]
struct Settings {
    output_dir: PathBuf,
    user_agent: Option<String>,
    timeout_secs: u64,
    concurrency: usize,
    retry_policy: RetryPolicy,
    toc_url: String,
}

fn resolve_settings(args: &Args, config: Option<&Config>) -> Settings {
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from("."));
    let user_agent = args
        .user_agent
        .clone()
        .or_else(|| config.and_then(|c| c.user_agent.clone()));
    let timeout_secs = args
        .timeout
        .or_else(|| config.and_then(|c| c.timeout_secs))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let concurrency = args
        .concurrency
        .or_else(|| config.and_then(|c| c.concurrency))
        .unwrap_or(DEFAULT_CONCURRENCY);

    let mut retry_policy = RetryPolicy::unlimited();
    if let Some(n) = args.max_attempts.or_else(|| config.and_then(|c| c.max_attempts)) {
        retry_policy = retry_policy.with_max_attempts(n);
    }
    if let Some(ms) = config.and_then(|c| c.retry_delay_ms) {
        retry_policy = retry_policy.with_delay(Duration::from_millis(ms));
    }

    let toc_url = args
        .toc_url
        .clone()
        .or_else(|| config.and_then(|c| c.toc_url.clone()))
        .unwrap_or_else(|| DEFAULT_TOC_URL.to_string());

    Settings {
        output_dir,
        user_agent,
        timeout_secs,
        concurrency,
        retry_policy,
        toc_url,
    }
}

/// Output directory must already exist.
fn validate_output_dir(dir: &Path) -> Result<(), CliRunError> {
    if !dir.is_dir() {
        return Err(CliRunError::InvalidInput(format!(
            "Cannot write output: {}: directory does not exist.",
            dir.display()
        )));
    }
    Ok(())
}

fn progress_bar(total: usize) -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new(total as u64);
    let style = indicatif::ProgressStyle::default_bar()
        .template("{spinner} {msg} {elapsed} [{bar:40}] {percent}% - ({pos}/{len})")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .progress_chars("#>-");
    bar.set_style(style);
    bar.set_message("Processing Worm...");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub async fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config().map_err(CliRunError::InvalidInput)?;
    let settings = resolve_settings(args, config.as_ref());
    debug!(?settings, "resolved settings");

    let pool = FetchPool::new(settings.concurrency, settings.retry_policy.clone())
        .map_err(|e| CliRunError::InvalidInput(e.to_string()))?;
    if !args.dump_toc {
        validate_output_dir(&settings.output_dir)?;
    }

    let mut builder = HttpClient::builder().timeout_secs(settings.timeout_secs);
    if let Some(ua) = &settings.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    let client = builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

    // Phase 1: table of contents. Any failure here happens before chapter fetches start.
    info!(url = %settings.toc_url, "fetching table of contents");
    let toc_page = client.get_bytes(&settings.toc_url).await?;
    let descriptors = flatten(parse_toc_page(&String::from_utf8_lossy(&toc_page))?)?;

    if args.dump_toc {
        let stdout = std::io::stdout();
        serde_json::to_writer_pretty(stdout.lock(), &descriptors)
            .map_err(|e| CliRunError::Output(format!("Failed to write JSON: {}", e)))?;
        println!();
        return Ok(());
    }

    let mut arcs = build_arcs(descriptors)?;
    let total = chapter_count(&arcs);
    info!(arcs = arcs.len(), chapters = total, "table of contents parsed");

    // Phase 2: fetch and sanitize every chapter.
    let reporter = if args.verbose {
        Reporter::Log
    } else if args.quiet {
        Reporter::Quiet
    } else {
        Reporter::Bar(progress_bar(total))
    };
    let bar = match &reporter {
        Reporter::Bar(pb) => Some(pb.clone()),
        _ => None,
    };
    let transport: Arc<dyn Transport> = Arc::new(client.clone());
    let fetched = pool.fetch_all(Arc::clone(&transport), &mut arcs, reporter).await;
    if let Some(pb) = bar {
        pb.disable_steady_tick();
        pb.finish_and_clear();
    }
    let summary = fetched?;
    debug!(?summary, "fetch phase complete");

    // Phase 3: bind.
    let options = BindOptions {
        version: if args.epub2 {
            EpubVersion::Epub2
        } else {
            EpubVersion::Epub3
        },
        single: args.single,
        covers: args.covers,
        output_dir: settings.output_dir,
        modified: chrono::Utc::now(),
    };
    let volumes = plan_volumes(arcs.len(), options.single, options.covers)?;
    let results = bind_all(&volumes, &arcs, transport.as_ref(), &options).await;

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(path) => {
                if !args.quiet {
                    eprintln!("Wrote {}", path.display());
                }
            }
            Err(e) => {
                error!("{}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(CliRunError::Volumes {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}
