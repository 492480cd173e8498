#![forbid(unsafe_code)]

//! Remote listing fetch.
//!
//! A listing is only useful when complete: every page is drained before the
//! result is returned, and any failure (including a server that repeats a
//! page token) discards the partial data.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::model::RemoteVideo;

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: &str = "50";
/// Upper bound on pages per playlist; protects against a server that keeps
/// handing out page tokens.
const MAX_PAGES: usize = 2_000;

pub trait ListingFetcher {
    /// Returns every video of the playlist in source order.
    fn fetch_all(
        &self,
        playlist_id: &str,
    ) -> impl Future<Output = SyncResult<Vec<RemoteVideo>>> + Send;
}

/// Minimal view of a `playlistItems.list` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistPage {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Option<Snippet>,
    content_details: Option<ContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: Option<String>,
    published_at: Option<DateTime<Utc>>,
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    video_id: Option<String>,
    video_published_at: Option<DateTime<Utc>>,
}

impl PlaylistItem {
    /// Converts an item, skipping private and deleted placeholders which
    /// carry no publish date of their own.
    fn into_remote(self) -> Option<RemoteVideo> {
        let snippet = self.snippet?;
        let details = self.content_details;
        let id = details
            .as_ref()
            .and_then(|details| details.video_id.clone())
            .or_else(|| snippet.resource_id.and_then(|resource| resource.video_id))?;
        let title = snippet.title?;
        if matches!(title.as_str(), "Private video" | "Deleted video") {
            return None;
        }
        let published_at = details
            .and_then(|details| details.video_published_at)
            .or(snippet.published_at)?;
        Some(RemoteVideo {
            id,
            title,
            published_at,
        })
    }
}

/// Drives pagination. `fetch_page` receives the token of the page to load
/// (`None` for the first one).
fn collect_pages<F>(mut fetch_page: F) -> Result<Vec<RemoteVideo>, String>
where
    F: FnMut(Option<&str>) -> Result<PlaylistPage, String>,
{
    let mut videos = Vec::new();
    let mut token: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let page = fetch_page(token.as_deref())?;
        videos.extend(page.items.into_iter().filter_map(PlaylistItem::into_remote));
        match page.next_page_token {
            Some(next) if !next.is_empty() => {
                if token.as_deref() == Some(next.as_str()) {
                    return Err(format!("page token {next:?} repeated; listing incomplete"));
                }
                token = Some(next);
            }
            _ => return Ok(videos),
        }
    }

    Err(format!("listing exceeded {MAX_PAGES} pages"))
}

/// Fetches playlists through the YouTube Data API v3.
#[derive(Debug, Clone)]
pub struct YouTubeApiFetcher {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl YouTubeApiFetcher {
    pub fn new(api_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: YOUTUBE_API_BASE.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn fetch_blocking(&self, playlist_id: &str) -> Result<Vec<RemoteVideo>, String> {
        let url = format!("{}/playlistItems", self.base_url.trim_end_matches('/'));
        collect_pages(|token| {
            let mut request = self
                .agent
                .get(&url)
                .query("part", "snippet,contentDetails")
                .query("maxResults", PAGE_SIZE)
                .query("playlistId", playlist_id)
                .query("key", &self.api_key);
            if let Some(token) = token {
                request = request.query("pageToken", token);
            }
            let response = request.call().map_err(describe_ureq_error)?;
            response
                .into_json::<PlaylistPage>()
                .map_err(|err| format!("decoding playlist page: {err}"))
        })
    }
}

fn describe_ureq_error(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let body = body.trim();
            if body.is_empty() {
                format!("HTTP {code}")
            } else {
                format!("HTTP {code}: {}", body.chars().take(300).collect::<String>())
            }
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

impl ListingFetcher for YouTubeApiFetcher {
    async fn fetch_all(&self, playlist_id: &str) -> SyncResult<Vec<RemoteVideo>> {
        let fetcher = self.clone();
        let id = playlist_id.to_owned();
        let videos = tokio::task::spawn_blocking(move || fetcher.fetch_blocking(&id))
            .await
            .map_err(|err| SyncError::fetch(playlist_id, err))?
            .map_err(|reason| SyncError::fetch(playlist_id, reason))?;
        tracing::debug!(playlist = playlist_id, count = videos.len(), "fetched listing");
        Ok(videos)
    }
}
