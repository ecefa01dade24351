//! Anime fetcher CLI application.

use anime_fetcher::{
    build_rate_limiter, Fetcher, HttpTransport, Provider, ResponseCache, RetryConfig, Scraper,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::{Config, DataPaths, LogConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Upstream to fetch from
    #[arg(short, long, value_enum)]
    provider: Provider,

    /// Comma-separated ids to fetch (not used by catalogue providers)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<u32>,

    /// File with one id per line (`#` starts a comment)
    #[arg(long)]
    ids_file: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Catalogue offset to start from (overrides `providers.anime365.start_offset`)
    #[arg(long)]
    offset: Option<u32>,

    /// Ids processed concurrently (overrides `fetch.workers`)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip ids whose primary record is already stored
    #[arg(long)]
    skip_existing: bool,

    /// Remove stored responses for this provider before running
    #[arg(long)]
    clear_cache: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(offset) = args.offset {
        config.providers.anime365.start_offset = offset;
    }

    let paths = DataPaths::from_config(&config);
    let provider = args.provider;

    // Initialize logging
    let mut log_config = LogConfig::from_settings(&config.logging, paths.logs_dir(), "anime-fetcher");
    if args.verbose {
        log_config.default_level = tracing::Level::DEBUG;
    }
    shared::logging::init(log_config)?;

    info!(provider = provider.as_str(), "Anime fetcher starting");
    info!(
        config_file = %args.config.display(),
        data_dir = %paths.root().display(),
        "Loaded configuration"
    );

    paths
        .create_dirs(provider.as_str())
        .context("Failed to create data directories")?;

    let ids = collect_ids(&args.ids, args.ids_file.as_deref())?;
    if provider.is_catalogue() {
        if !ids.is_empty() {
            warn!(ids = ids.len(), "Catalogue provider walks every page; ignoring ids");
        }
    } else if ids.is_empty() {
        bail!("No ids given; use --ids or --ids-file");
    }

    // Initialize response cache
    let cache = ResponseCache::new(
        paths.raw_dir(provider.as_str()),
        provider.extension(),
        config.cache.enabled,
    )
    .context("Failed to initialize response cache")?;

    if args.clear_cache {
        info!("Clearing stored responses");
        cache.clear().context("Failed to clear cache")?;
    }

    let cache_stats = cache.stats().context("Failed to get cache stats")?;
    info!(
        stored_files = cache_stats.total_files,
        stored_mb = cache_stats.total_size_bytes / 1_000_000,
        "Response cache statistics"
    );

    // One limiter per upstream, shared by every worker
    let limit = provider.rate_limit(&config);
    let rate_limiter = Arc::new(build_rate_limiter(limit).context("Invalid rate limit settings")?);
    info!(
        period_ms = rate_limiter.period().as_millis() as u64,
        per_minute = limit.requests_per_minute,
        window_mode = ?limit.window_mode,
        "Rate limiter ready"
    );

    let transport = HttpTransport::new(
        Duration::from_secs(config.fetch.request_timeout_secs),
        &config.fetch.user_agent,
    )
    .context("Failed to create HTTP client")?;

    let classifier = provider
        .classifier(&config.fetch)
        .context("Invalid soft-ban settings")?;

    let fetcher = Fetcher::new(
        transport,
        rate_limiter,
        classifier,
        RetryConfig::from_settings(&config.fetch),
    )
    .context("Invalid retry settings")?;

    let scraper = Scraper::new(provider, provider.endpoints(&config), fetcher, cache)
        .skip_existing(args.skip_existing)
        .workers(args.workers.unwrap_or(config.fetch.workers));

    // Ctrl-C aborts in-flight fetches and backoff sleeps
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight requests");
            let _ = cancel_tx.send(true);
        }
    });

    let stats = if provider.is_catalogue() {
        scraper.run_catalogue(&cancel_rx).await
    } else {
        scraper.run(&ids, &cancel_rx).await
    };

    info!("=== Fetching Complete ===");
    info!("Ids requested: {}", stats.total_ids);
    info!("Completed: {}", stats.completed);
    info!("Partially fetched: {}", stats.partial);
    info!("Failed: {}", stats.failed);
    info!("Skipped: {}", stats.skipped);
    info!("Responses stored: {}", stats.responses_stored);
    info!("Fetch errors: {}", stats.fetch_errors);
    info!("Still throttled after retries: {}", stats.throttled);
    info!("Storage errors: {}", stats.storage_errors);

    if stats.cancelled {
        warn!("Run was interrupted before all ids were processed");
    } else {
        info!("Anime fetcher finished successfully");
    }

    Ok(())
}

/// Merge ids from the command line and the optional ids file, keeping order
fn collect_ids(inline: &[u32], file: Option<&Path>) -> Result<Vec<u32>> {
    let mut ids = inline.to_vec();

    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ids file: {}", path.display()))?;
        ids.extend(
            parse_ids(&content)
                .with_context(|| format!("Failed to parse ids file: {}", path.display()))?,
        );
    }

    Ok(ids)
}

fn parse_ids(content: &str) -> Result<Vec<u32>> {
    content
        .lines()
        .enumerate()
        .filter_map(|(number, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            (!line.is_empty()).then_some((number, line))
        })
        .map(|(number, line)| {
            line.parse::<u32>()
                .with_context(|| format!("line {}: invalid id {:?}", number + 1, line))
        })
        .collect()
}
