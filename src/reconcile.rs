#![forbid(unsafe_code)]

//! Queue reconciliation: diffs a freshly fetched listing against the
//! persisted [`ChannelState`] and decides what to download next.
//!
//! The algorithm is deliberately order-sensitive and idempotent:
//!
//! 1. the listing is sorted oldest first, renamed, and deduplicated by title
//!    (first seen wins),
//! 2. files already on disk are adopted into `saved`,
//! 3. everything neither saved nor blocked is queued,
//! 4. filters block matching videos and pull them out of the queue,
//! 5. the persisted `queued` set is replaced by the new queue.
//!
//! A saved video whose file vanished is never queued again here; that needs an
//! explicit operator action.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use crate::error::SyncResult;
use crate::model::{ChannelState, MediaKind, RemoteVideo, VideoRecord};
use crate::rules::RuleSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Release blocked videos whose output file is missing so they get
    /// another download attempt (filters still apply).
    pub retry_failures: bool,
}

/// What a reconciliation pass decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Ids to download, oldest first.
    pub queue: Vec<String>,
    /// Ids adopted into `saved` because their file already existed.
    pub adopted: Vec<String>,
    /// Ids that became blocked during this pass.
    pub newly_blocked: Vec<String>,
    /// Blocked ids released by the retry option.
    pub released: Vec<String>,
}

/// Builds the working map for one run: chronological order, rename rules
/// applied, one record per id and per title.
pub fn build_video_map(
    mut listing: Vec<RemoteVideo>,
    output_dir: &Path,
    kind: MediaKind,
    rules: &RuleSet,
) -> SyncResult<Vec<VideoRecord>> {
    listing.sort_by_key(|video| video.published_at);

    let mut seen_ids = HashSet::new();
    let mut videos: Vec<VideoRecord> = listing
        .into_iter()
        .filter(|video| seen_ids.insert(video.id.clone()))
        .map(|video| VideoRecord::new(video, output_dir, kind))
        .collect();

    rules.rename_all(&mut videos)?;
    Ok(dedup_by_title(videos))
}

/// Keeps the first record for every title. Renamed re-uploads therefore map
/// onto the video that was already archived.
pub fn dedup_by_title(videos: Vec<VideoRecord>) -> Vec<VideoRecord> {
    let mut seen = HashSet::new();
    videos
        .into_iter()
        .filter(|video| seen.insert(video.title().to_owned()))
        .collect()
}

/// Recomputes the queue and updates `state` in place.
pub fn reconcile(
    videos: &[VideoRecord],
    state: &mut ChannelState,
    rules: &RuleSet,
    options: ReconcileOptions,
    file_exists: impl Fn(&Path) -> bool,
) -> Reconciliation {
    let mut result = Reconciliation::default();
    let previously_blocked: BTreeSet<String> = state.blocked().clone();

    if options.retry_failures {
        for video in videos {
            if state.blocked().contains(&video.id)
                && !file_exists(video.output_path())
                && state.release_blocked(&video.id)
            {
                result.released.push(video.id.clone());
            }
        }
    }

    for video in videos {
        if !state.saved().contains(&video.id) && file_exists(video.output_path()) {
            state.mark_saved(&video.id);
            result.adopted.push(video.id.clone());
        }
        if !state.saved().contains(&video.id) && !state.blocked().contains(&video.id) {
            result.queue.push(video.id.clone());
        }
    }

    for video in videos {
        if state.saved().contains(&video.id) || !rules.blocks(video) {
            continue;
        }
        state.mark_blocked(&video.id);
        result.queue.retain(|id| id != &video.id);
        if !previously_blocked.contains(&video.id) {
            result.newly_blocked.push(video.id.clone());
        }
    }

    state.replace_queue(result.queue.iter().map(String::as_str));
    debug_assert!(state.is_disjoint());
    result
}
