#![forbid(unsafe_code)]

//! Channel orchestration: selection, then fetch, reconcile, persist and
//! download for every selected channel in configured order.

use anyhow::{Result, bail};
use chrono::Utc;
use std::path::Path;

use crate::config::ChannelConfig;
use crate::downloader::Downloader;
use crate::driver::{self, DriverReport};
use crate::error::{SyncError, SyncResult};
use crate::fetcher::ListingFetcher;
use crate::reconcile::{ReconcileOptions, Reconciliation, build_video_map, reconcile};
use crate::store::StateStore;

/// Which channels a run covers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// A channel key or a group name.
    pub channel: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
}

/// Resolves a selection against the configured channels, keeping their
/// order. Inactive channels are only included when named by key.
pub fn select_channels<'a>(
    channels: &'a [ChannelConfig],
    selection: &Selection,
) -> Result<Vec<&'a ChannelConfig>> {
    let position = |key: &str| {
        channels
            .iter()
            .position(|channel| channel.key == key)
            .ok_or_else(|| anyhow::anyhow!("unknown channel key {key}"))
    };
    let start = selection.start.as_deref().map(position).transpose()?;
    let stop = selection.stop.as_deref().map(position).transpose()?;
    if let (Some(start), Some(stop)) = (start, stop)
        && start > stop
    {
        bail!(
            "--start {} comes after --stop {}",
            channels[start].key,
            channels[stop].key
        );
    }
    let lower = start.unwrap_or(0);
    let upper = stop.unwrap_or(channels.len().saturating_sub(1));
    let in_range = |index: usize| index >= lower && index <= upper;

    let Some(wanted) = selection.channel.as_deref() else {
        return Ok(channels
            .iter()
            .enumerate()
            .filter(|(index, channel)| channel.active && in_range(*index))
            .map(|(_, channel)| channel)
            .collect());
    };

    if let Some(channel) = channels.iter().find(|channel| channel.key == wanted) {
        return Ok(vec![channel]);
    }
    let group: Vec<_> = channels
        .iter()
        .enumerate()
        .filter(|(index, channel)| {
            channel.active && channel.group.as_deref() == Some(wanted) && in_range(*index)
        })
        .map(|(_, channel)| channel)
        .collect();
    if group.is_empty() {
        bail!("no active channel or group named {wanted}");
    }
    Ok(group)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub retry_failures: bool,
    /// Reconcile and persist the queue without downloading.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelReport {
    pub key: String,
    pub listed: usize,
    pub reconciliation: Reconciliation,
    pub downloads: DriverReport,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub channels: Vec<ChannelReport>,
    /// Channels skipped because of a channel-scoped error.
    pub skipped: Vec<(String, SyncError)>,
}

impl RunSummary {
    pub fn saved(&self) -> usize {
        self.channels
            .iter()
            .map(|report| report.downloads.saved.len())
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.channels
            .iter()
            .map(|report| report.downloads.failed.len())
            .sum()
    }
}

pub struct Syncer<'a, F, D> {
    store: &'a StateStore,
    fetcher: &'a F,
    downloader: &'a D,
    options: SyncOptions,
}

impl<'a, F, D> Syncer<'a, F, D>
where
    F: ListingFetcher,
    D: Downloader,
{
    pub fn new(
        store: &'a StateStore,
        fetcher: &'a F,
        downloader: &'a D,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            downloader,
            options,
        }
    }

    /// Syncs channels one after another. Channel-scoped errors are logged
    /// and the channel skipped; persistence and filesystem errors abort.
    pub async fn sync_all(&self, channels: &[&ChannelConfig]) -> SyncResult<RunSummary> {
        let mut summary = RunSummary::default();
        for channel in channels {
            match self.sync_channel(channel).await {
                Ok(report) => summary.channels.push(report),
                Err(err) if !err.is_fatal() => {
                    tracing::error!(channel = %channel.key, error = %err, "skipping channel");
                    summary.skipped.push((channel.key.clone(), err));
                }
                Err(err) => {
                    tracing::error!(channel = %channel.key, error = %err, "aborting run");
                    return Err(err);
                }
            }
        }
        Ok(summary)
    }

    pub async fn sync_channel(&self, channel: &ChannelConfig) -> SyncResult<ChannelReport> {
        let key = channel.key.as_str();
        tracing::info!(channel = key, name = channel.display_name(), "syncing channel");

        let rules = channel.compile_rules()?;
        if !rules.is_empty() {
            tracing::debug!(
                channel = key,
                renames = channel.renames.len(),
                filters = channel.filters.len(),
                "rules compiled"
            );
        }
        let listing = self.fetcher.fetch_all(&channel.playlist_id).await?;
        let listed = listing.len();
        let videos = build_video_map(
            listing,
            &channel.output_folder,
            channel.media_kind(),
            &rules,
        )?;

        let mut state = self.store.load_state(key).await?;
        let reconciliation = reconcile(
            &videos,
            &mut state,
            &rules,
            ReconcileOptions {
                retry_failures: self.options.retry_failures,
            },
            Path::exists,
        );
        // Adopted files may predate their playlist entry.
        if let Some(playlist_file) = &channel.playlist_file {
            for video in videos
                .iter()
                .filter(|video| reconciliation.adopted.contains(&video.id))
            {
                driver::record_in_playlist(playlist_file, video.output_path())?;
            }
        }
        self.store.save_state(key, &state).await?;
        tracing::info!(
            channel = key,
            listed,
            unique = videos.len(),
            queued = reconciliation.queue.len(),
            adopted = reconciliation.adopted.len(),
            newly_blocked = reconciliation.newly_blocked.len(),
            released = reconciliation.released.len(),
            "reconciled"
        );

        let downloads = if self.options.dry_run {
            DriverReport::default()
        } else {
            let report = driver::run(
                channel,
                &reconciliation.queue,
                &videos,
                &mut state,
                self.store,
                self.downloader,
            )
            .await?;
            self.store.record_sync(key, Utc::now()).await?;
            report
        };

        Ok(ChannelReport {
            key: key.to_owned(),
            listed,
            reconciliation,
            downloads,
        })
    }
}
