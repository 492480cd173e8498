#![forbid(unsafe_code)]

//! Command-line entry point: loads the configuration, selects channels and
//! runs fetch, reconcile and download for each of them in order.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;

use tubesync::config::{ChannelConfig, Config, RuntimeOverrides};
use tubesync::downloader::YtDlpDownloader;
use tubesync::fetcher::YouTubeApiFetcher;
use tubesync::logging;
use tubesync::store::{StateStore, StateSummary};
use tubesync::sync::{RunSummary, Selection, SyncOptions, Syncer, select_channels};

#[derive(Parser, Debug)]
#[command(author, version, about = "Archive YouTube channels and playlists into local folders")]
struct Cli {
    /// `.env` file with runtime settings
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Channel definition file (overrides TUBESYNC_CHANNELS)
    #[arg(long, value_name = "PATH")]
    channels: Option<PathBuf>,
    /// State database (overrides TUBESYNC_STATE_DB)
    #[arg(long, value_name = "PATH")]
    state_db: Option<PathBuf>,
    /// Only sync this channel key or group
    #[arg(long, value_name = "KEY|GROUP")]
    channel: Option<String>,
    /// First channel key of the range to sync
    #[arg(long, value_name = "KEY")]
    start: Option<String>,
    /// Last channel key of the range to sync (inclusive)
    #[arg(long, value_name = "KEY")]
    stop: Option<String>,
    /// Give previously failed videos another attempt
    #[arg(long)]
    retry_failures: bool,
    /// Reconcile and persist the queue without downloading
    #[arg(long)]
    dry_run: bool,
    /// Print the selected channels with their state counts and exit
    #[arg(long)]
    list: bool,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            state_db: self.state_db.clone(),
            channels_file: self.channels.clone(),
            env_path: self.env_file.clone(),
        }
    }

    fn selection(&self) -> Selection {
        Selection {
            channel: self.channel.clone(),
            start: self.start.clone(),
            stop: self.stop.clone(),
        }
    }

    fn options(&self) -> SyncOptions {
        SyncOptions {
            retry_failures: self.retry_failures,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = Config::load(cli.overrides()).context("loading configuration")?;
    let selected = select_channels(&config.channels, &cli.selection())?;
    let store = StateStore::open(&config.runtime.state_db)
        .await
        .context("initializing state database")?;

    if cli.list {
        return list_channels(&store, &selected).await;
    }
    if selected.is_empty() {
        println!(
            "No active channels in {}.",
            config.runtime.channels_file.display()
        );
        return Ok(());
    }

    let api_key = config
        .runtime
        .api_key
        .clone()
        .context("YOUTUBE_API_KEY not set")?;
    let fetcher = YouTubeApiFetcher::new(api_key);
    let downloader = YtDlpDownloader::new(&config.runtime.yt_dlp, config.runtime.download_timeout)
        .with_cookies(config.runtime.cookies.clone());

    if !cli.dry_run {
        let version = downloader
            .version()
            .await
            .with_context(|| format!("running {} --version", config.runtime.yt_dlp.display()))?;
        println!("Using yt-dlp {version}");
    }
    println!("State database: {}", config.runtime.state_db.display());
    println!("Channels queued for sync:");
    for channel in &selected {
        println!("  - {} ({})", channel.key, channel.display_name());
    }

    let syncer = Syncer::new(&store, &fetcher, &downloader, cli.options());
    let summary = syncer.sync_all(&selected).await.context("sync aborted")?;
    print_summary(&summary, cli.dry_run);

    if !summary.skipped.is_empty() {
        bail!("{} channel(s) could not be synced", summary.skipped.len());
    }
    Ok(())
}

async fn list_channels(store: &StateStore, channels: &[&ChannelConfig]) -> Result<()> {
    for channel in channels {
        let state = store
            .load_state(&channel.key)
            .await
            .with_context(|| format!("reading state of {}", channel.key))?;
        let counts = StateSummary::from(&state);
        let last = store
            .last_synced(&channel.key)
            .await?
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<24} saved {:>5}  queued {:>4}  blocked {:>4}  last sync {}{}",
            channel.key,
            counts.saved,
            counts.queued,
            counts.blocked,
            last,
            if channel.active { "" } else { "  (inactive)" }
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    println!();
    for report in &summary.channels {
        if dry_run {
            println!(
                "{}: {} listed, {} would be downloaded, {} newly blocked",
                report.key,
                report.listed,
                report.reconciliation.queue.len(),
                report.reconciliation.newly_blocked.len()
            );
            continue;
        }
        println!(
            "{}: {} listed, {} saved, {} failed",
            report.key,
            report.listed,
            report.downloads.saved.len(),
            report.downloads.failed.len()
        );
        for failure in &report.downloads.failed {
            println!("    {} - {}", failure.video_id, failure.reason);
        }
    }
    for (key, err) in &summary.skipped {
        println!("{key}: skipped ({err})");
    }
    println!(
        "Done: {} saved, {} failed, {} channel(s) skipped.",
        summary.saved(),
        summary.failed(),
        summary.skipped.len()
    );
}
