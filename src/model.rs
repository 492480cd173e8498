#![forbid(unsafe_code)]

//! Core records: the per-run video map entries and the persisted per-channel
//! ID sets.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Characters that cannot appear in a file name on at least one of the
/// platforms we write to.
const ILLEGAL_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Whether a channel is archived as audio or as video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_audio_flag(save_as_audio: bool) -> Self {
        if save_as_audio {
            MediaKind::Audio
        } else {
            MediaKind::Video
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Audio => "mp3",
            MediaKind::Video => "mp4",
        }
    }

    pub fn is_audio(self) -> bool {
        self == MediaKind::Audio
    }
}

/// Listing entry exactly as the remote source reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
    pub id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
}

/// A fetched video inside the working map of a single run.
///
/// The output path is derived from the title, so the title is only changed
/// through [`VideoRecord::set_title`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
    pub id: String,
    pub published_at: DateTime<Utc>,
    title: String,
    output_dir: PathBuf,
    kind: MediaKind,
    output_path: PathBuf,
}

impl VideoRecord {
    pub fn new(remote: RemoteVideo, output_dir: &Path, kind: MediaKind) -> Self {
        let mut record = Self {
            id: remote.id,
            published_at: remote.published_at,
            title: String::new(),
            output_dir: output_dir.to_path_buf(),
            kind,
            output_path: PathBuf::new(),
        };
        record.set_title(remote.title);
        record
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Replaces the title and recomputes the output path.
    pub fn set_title(&mut self, title: String) {
        self.output_path = self
            .output_dir
            .join(format!("{}.{}", sanitize_title(&title), self.kind.extension()));
        self.title = title;
    }

    /// Stores the filesystem-safe form of the current title.
    pub fn sanitize(&mut self) {
        let clean = sanitize_title(&self.title);
        if clean != self.title {
            self.set_title(clean);
        }
    }
}

/// Replaces characters that are illegal in file names with `_` and strips
/// trailing dots and spaces (rejected by Windows).
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|ch| {
            if ch.is_control() || ILLEGAL_PATH_CHARS.contains(&ch) {
                '_'
            } else {
                ch
            }
        })
        .collect();
    let trimmed = replaced.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    Saved,
    Queued,
    Blocked,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoStatus::Saved => "saved",
            VideoStatus::Queued => "queued",
            VideoStatus::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "saved" => Some(VideoStatus::Saved),
            "queued" => Some(VideoStatus::Queued),
            "blocked" => Some(VideoStatus::Blocked),
            _ => None,
        }
    }
}

/// Persisted identity sets of one channel.
///
/// The three sets stay pairwise disjoint: every mutator removes the id from
/// the other two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    saved: BTreeSet<String>,
    queued: BTreeSet<String>,
    blocked: BTreeSet<String>,
}

impl ChannelState {
    /// Builds a state from raw sets. Overlaps are resolved saved first, then
    /// blocked, then queued.
    pub fn from_sets(
        saved: impl IntoIterator<Item = String>,
        queued: impl IntoIterator<Item = String>,
        blocked: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut state = Self::default();
        for id in queued {
            state.queued.insert(id);
        }
        for id in blocked {
            state.mark_blocked(&id);
        }
        for id in saved {
            state.mark_saved(&id);
        }
        state
    }

    pub fn saved(&self) -> &BTreeSet<String> {
        &self.saved
    }

    pub fn queued(&self) -> &BTreeSet<String> {
        &self.queued
    }

    pub fn blocked(&self) -> &BTreeSet<String> {
        &self.blocked
    }

    pub fn status(&self, id: &str) -> Option<VideoStatus> {
        if self.saved.contains(id) {
            Some(VideoStatus::Saved)
        } else if self.blocked.contains(id) {
            Some(VideoStatus::Blocked)
        } else if self.queued.contains(id) {
            Some(VideoStatus::Queued)
        } else {
            None
        }
    }

    /// Every tracked id with its status, in id order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, VideoStatus)> {
        self.saved
            .iter()
            .map(|id| (id.as_str(), VideoStatus::Saved))
            .chain(self.queued.iter().map(|id| (id.as_str(), VideoStatus::Queued)))
            .chain(
                self.blocked
                    .iter()
                    .map(|id| (id.as_str(), VideoStatus::Blocked)),
            )
    }

    pub fn is_disjoint(&self) -> bool {
        self.saved.is_disjoint(&self.queued)
            && self.saved.is_disjoint(&self.blocked)
            && self.queued.is_disjoint(&self.blocked)
    }

    pub(crate) fn mark_saved(&mut self, id: &str) {
        self.queued.remove(id);
        self.blocked.remove(id);
        self.saved.insert(id.to_owned());
    }

    pub(crate) fn mark_blocked(&mut self, id: &str) {
        self.queued.remove(id);
        self.saved.remove(id);
        self.blocked.insert(id.to_owned());
    }

    pub(crate) fn release_blocked(&mut self, id: &str) -> bool {
        self.blocked.remove(id)
    }

    /// Replaces the queued set. Ids that are saved or blocked are skipped.
    pub(crate) fn replace_queue<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        self.queued.clear();
        for id in ids {
            if !self.saved.contains(id) && !self.blocked.contains(id) {
                self.queued.insert(id.to_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn remote(id: &str, title: &str) -> RemoteVideo {
        RemoteVideo {
            id: id.into(),
            title: title.into(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn sanitize_title_replaces_illegal_characters() {
        assert_eq!(sanitize_title("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_title("trailing dots..."), "trailing dots");
        assert_eq!(sanitize_title("tab\there"), "tab_here");
        assert_eq!(sanitize_title("..."), "_");
    }

    #[test]
    fn output_path_follows_title_changes() {
        let mut record = VideoRecord::new(
            remote("a", "Ep1"),
            Path::new("/music/show"),
            MediaKind::Audio,
        );
        assert_eq!(record.output_path(), Path::new("/music/show/Ep1.mp3"));

        record.set_title("Episode 1".into());
        assert_eq!(record.output_path(), Path::new("/music/show/Episode 1.mp3"));
    }

    #[test]
    fn output_path_is_always_filesystem_safe() {
        let mut record = VideoRecord::new(
            remote("a", "Q&A | Part 1"),
            Path::new("/videos"),
            MediaKind::Video,
        );
        assert_eq!(record.output_path(), Path::new("/videos/Q&A _ Part 1.mp4"));
        record.sanitize();
        assert_eq!(record.title(), "Q&A _ Part 1");
    }

    #[test]
    fn from_sets_resolves_overlaps() {
        let state = ChannelState::from_sets(
            ["a".to_string(), "b".to_string()],
            ["a".to_string(), "c".to_string(), "d".to_string()],
            ["b".to_string(), "d".to_string()],
        );
        assert!(state.is_disjoint());
        assert_eq!(state.status("a"), Some(VideoStatus::Saved));
        assert_eq!(state.status("b"), Some(VideoStatus::Saved));
        assert_eq!(state.status("c"), Some(VideoStatus::Queued));
        assert_eq!(state.status("d"), Some(VideoStatus::Blocked));
        assert_eq!(state.status("e"), None);
    }

    #[test]
    fn transitions_keep_sets_disjoint() {
        let mut state = ChannelState::default();
        state.replace_queue(["a", "b", "c"]);
        state.mark_saved("a");
        state.mark_blocked("b");
        assert!(state.is_disjoint());
        assert_eq!(state.queued().len(), 1);
        assert_eq!(state.entries().count(), 3);
    }

    #[test]
    fn replace_queue_skips_saved_and_blocked() {
        let mut state =
            ChannelState::from_sets(["a".to_string()], Vec::new(), ["b".to_string()]);
        state.replace_queue(["a", "b", "c"]);
        assert_eq!(
            state.queued().iter().cloned().collect::<Vec<_>>(),
            vec!["c".to_string()]
        );
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [VideoStatus::Saved, VideoStatus::Queued, VideoStatus::Blocked] {
            assert_eq!(VideoStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VideoStatus::parse("gone"), None);
    }
}
