#![forbid(unsafe_code)]

//! Download driver: walks the queue in order and checkpoints the channel
//! state after every video.

use std::collections::HashMap;
use std::path::Path;

use crate::config::ChannelConfig;
use crate::downloader::{DownloadOutcome, Downloader};
use crate::error::{SyncError, SyncResult};
use crate::model::{ChannelState, VideoRecord, VideoStatus};
use crate::playlist;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDownload {
    pub video_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub saved: Vec<String>,
    pub failed: Vec<FailedDownload>,
}

/// Downloads every queued id. A failed video is blocked and never retried
/// within the run; only persistence and playlist errors abort.
///
/// `state` must already be persisted: each outcome is checkpointed by
/// updating only that video's row.
pub async fn run<D: Downloader>(
    channel: &ChannelConfig,
    queue: &[String],
    videos: &[VideoRecord],
    state: &mut ChannelState,
    store: &StateStore,
    downloader: &D,
) -> SyncResult<DriverReport> {
    let by_id: HashMap<&str, &VideoRecord> =
        videos.iter().map(|video| (video.id.as_str(), video)).collect();
    let mut report = DriverReport::default();

    for (position, id) in queue.iter().enumerate() {
        let Some(video) = by_id.get(id.as_str()) else {
            tracing::warn!(channel = %channel.key, video = %id, "queued id missing from listing");
            continue;
        };
        tracing::info!(
            channel = %channel.key,
            video = %id,
            position = position + 1,
            total = queue.len(),
            title = video.title(),
            "downloading"
        );

        let status = match downloader
            .download(id, video.output_path(), video.kind().is_audio())
            .await
        {
            DownloadOutcome::Saved { path } => {
                state.mark_saved(id);
                if let Some(playlist_file) = &channel.playlist_file {
                    record_in_playlist(playlist_file, &path)?;
                }
                tracing::info!(channel = %channel.key, video = %id, path = %path.display(), "saved");
                report.saved.push(id.clone());
                VideoStatus::Saved
            }
            DownloadOutcome::Failed { reason } => {
                state.mark_blocked(id);
                tracing::warn!(channel = %channel.key, video = %id, %reason, "download failed");
                report.failed.push(FailedDownload {
                    video_id: id.clone(),
                    reason,
                });
                VideoStatus::Blocked
            }
        };

        store.set_status(&channel.key, id, status).await?;
    }

    Ok(report)
}

/// Appends the absolute form of `media` to the playlist unless present.
pub(crate) fn record_in_playlist(playlist_file: &Path, media: &Path) -> SyncResult<()> {
    let absolute = std::path::absolute(media)
        .map_err(|err| SyncError::io(format!("resolving {}", media.display()), err))?;
    if playlist::append_if_absent(playlist_file, &absolute.to_string_lossy())? {
        tracing::debug!(playlist = %playlist_file.display(), "playlist entry added");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_channels;
    use crate::model::{MediaKind, RemoteVideo};
    use crate::reconcile::{ReconcileOptions, build_video_map, reconcile};
    use crate::rules::RuleSet;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    /// Succeeds by writing the destination file unless the id is listed as
    /// failing. When given a store, snapshots the persisted state before
    /// every download.
    struct FakeDownloader<'a> {
        failing: HashSet<&'static str>,
        store: Option<(&'a StateStore, &'a str)>,
        calls: Mutex<Vec<String>>,
        snapshots: Mutex<Vec<ChannelState>>,
    }

    impl<'a> FakeDownloader<'a> {
        fn new(failing: &[&'static str]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                store: None,
                calls: Mutex::new(Vec::new()),
                snapshots: Mutex::new(Vec::new()),
            }
        }

        fn observing(mut self, store: &'a StateStore, key: &'a str) -> Self {
            self.store = Some((store, key));
            self
        }
    }

    impl Downloader for FakeDownloader<'_> {
        async fn download(&self, video_id: &str, dest: &Path, _as_audio: bool) -> DownloadOutcome {
            if let Some((store, key)) = self.store {
                let snapshot = store.load_state(key).await.unwrap();
                self.snapshots.lock().unwrap().push(snapshot);
            }
            self.calls.lock().unwrap().push(video_id.to_string());
            if self.failing.contains(video_id) {
                return DownloadOutcome::Failed {
                    reason: "ERROR: unavailable".into(),
                };
            }
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, video_id).unwrap();
            DownloadOutcome::Saved {
                path: dest.to_path_buf(),
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        channel: ChannelConfig,
        store: StateStore,
    }

    async fn fixture(with_playlist: bool) -> Result<Fixture> {
        let dir = tempdir()?;
        let playlist = if with_playlist {
            format!("playlist_file = {:?}\n", dir.path().join("lists/chan.m3u"))
        } else {
            String::new()
        };
        let toml = format!(
            "[[channel]]\nkey = \"chan\"\nplaylist_id = \"PL1\"\noutput_folder = {:?}\nsave_as_audio = true\n{playlist}",
            dir.path().join("media")
        );
        let channel = parse_channels(&toml)?.remove(0);
        let store = StateStore::open(&dir.path().join("state.db")).await?;
        Ok(Fixture {
            dir,
            channel,
            store,
        })
    }

    fn remote(id: &str, title: &str, day: u32) -> RemoteVideo {
        RemoteVideo {
            id: id.into(),
            title: title.into(),
            published_at: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
        }
    }

    fn records(channel: &ChannelConfig, listing: Vec<RemoteVideo>) -> Vec<VideoRecord> {
        build_video_map(
            listing,
            &channel.output_folder,
            MediaKind::Audio,
            &RuleSet::default(),
        )
        .unwrap()
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn duplicate_title_scenario_saves_first_upload_once() -> Result<()> {
        let Fixture {
            dir,
            channel,
            store,
        } = fixture(true).await?;
        let videos = records(&channel, vec![remote("a", "Ep1", 1), remote("b", "Ep1", 2)]);
        let mut state = ChannelState::default();
        let plan = reconcile(
            &videos,
            &mut state,
            &RuleSet::default(),
            ReconcileOptions::default(),
            Path::exists,
        );
        assert_eq!(plan.queue, ids(&["a"]));

        let downloader = FakeDownloader::new(&[]);
        let report = run(&channel, &plan.queue, &videos, &mut state, &store, &downloader).await?;

        assert_eq!(report.saved, ids(&["a"]));
        assert!(report.failed.is_empty());
        assert_eq!(state, ChannelState::from_sets(ids(&["a"]), ids(&[]), ids(&[])));
        assert_eq!(store.load_state("chan").await?, state);

        let playlist = fs::read_to_string(dir.path().join("lists/chan.m3u"))?;
        let expected = std::path::absolute(dir.path().join("media/Ep1.mp3"))?;
        assert_eq!(playlist, format!("{}\n", expected.display()));
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_blocked_and_run_continues() -> Result<()> {
        let Fixture { channel, store, .. } = fixture(false).await?;
        let videos = records(
            &channel,
            vec![remote("a", "A", 1), remote("b", "B", 2), remote("c", "C", 3)],
        );
        let mut state = ChannelState::from_sets(ids(&[]), ids(&["a", "b", "c"]), ids(&[]));

        let downloader = FakeDownloader::new(&["b"]);
        let queue = ids(&["a", "b", "c"]);
        let report = run(&channel, &queue, &videos, &mut state, &store, &downloader).await?;

        assert_eq!(*downloader.calls.lock().unwrap(), queue);
        assert_eq!(report.saved, ids(&["a", "c"]));
        assert_eq!(
            report.failed,
            vec![FailedDownload {
                video_id: "b".into(),
                reason: "ERROR: unavailable".into(),
            }]
        );
        assert_eq!(state, ChannelState::from_sets(ids(&["a", "c"]), ids(&[]), ids(&["b"])));
        assert!(state.is_disjoint());
        Ok(())
    }

    #[tokio::test]
    async fn state_is_checkpointed_before_each_next_download() -> Result<()> {
        let Fixture { channel, store, .. } = fixture(false).await?;
        let videos = records(
            &channel,
            vec![remote("a", "A", 1), remote("b", "B", 2), remote("c", "C", 3)],
        );
        let queue = ids(&["a", "b", "c"]);
        let mut state = ChannelState::from_sets(ids(&[]), queue.clone(), ids(&[]));
        store.save_state("chan", &state).await?;

        let downloader = FakeDownloader::new(&["b"]).observing(&store, "chan");
        run(&channel, &queue, &videos, &mut state, &store, &downloader).await?;
        assert_eq!(store.load_state("chan").await?, state);

        let snapshots = downloader.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0], ChannelState::from_sets(ids(&[]), queue.clone(), ids(&[])));
        assert_eq!(
            snapshots[1],
            ChannelState::from_sets(ids(&["a"]), ids(&["b", "c"]), ids(&[]))
        );
        assert_eq!(
            snapshots[2],
            ChannelState::from_sets(ids(&["a"]), ids(&["c"]), ids(&["b"]))
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_queue_ids_are_skipped() -> Result<()> {
        let Fixture { channel, store, .. } = fixture(false).await?;
        let videos = records(&channel, vec![remote("a", "A", 1)]);
        let mut state = ChannelState::default();
        let downloader = FakeDownloader::new(&[]);

        let report = run(
            &channel,
            &ids(&["ghost", "a"]),
            &videos,
            &mut state,
            &store,
            &downloader,
        )
        .await?;
        assert_eq!(report.saved, ids(&["a"]));
        assert_eq!(*downloader.calls.lock().unwrap(), ids(&["a"]));
        Ok(())
    }

    #[tokio::test]
    async fn playlist_is_not_duplicated_across_runs() -> Result<()> {
        let Fixture {
            dir,
            channel,
            store,
        } = fixture(true).await?;
        let videos = records(&channel, vec![remote("a", "A", 1)]);
        let downloader = FakeDownloader::new(&[]);

        for _ in 0..2 {
            let mut state = ChannelState::default();
            run(&channel, &ids(&["a"]), &videos, &mut state, &store, &downloader).await?;
        }

        let playlist: PathBuf = dir.path().join("lists/chan.m3u");
        assert_eq!(playlist::load_entries(&playlist)?.len(), 1);
        Ok(())
    }
}
