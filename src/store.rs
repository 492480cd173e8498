//! Persistence layer for per-channel state.
//!
//! Every channel's saved/queued/blocked ids live in one SQLite table keyed by
//! `(channel_key, video_id)`, so a video carries exactly one status per
//! channel at rest. Video titles and paths are never stored; they are rebuilt
//! from the remote listing on every run. Reconciliation rewrites a channel
//! wholesale; download checkpoints upsert one row.

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, params};

use crate::error::{SyncError, SyncResult};
use crate::model::{ChannelState, VideoStatus};

async fn configure_connection(conn: &Connection) -> Result<(), libsql::Error> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<(), libsql::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channel_videos (
            channel_key TEXT NOT NULL,
            video_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('saved', 'queued', 'blocked')),
            PRIMARY KEY (channel_key, video_id)
        );

        CREATE TABLE IF NOT EXISTS channel_runs (
            channel_key TEXT PRIMARY KEY,
            last_synced TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_channel_videos_status
            ON channel_videos(channel_key, status);
        "#,
    )
    .await?;
    Ok(())
}

/// Counts of tracked ids per status, used for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub saved: usize,
    pub queued: usize,
    pub blocked: usize,
}

impl From<&ChannelState> for StateSummary {
    fn from(state: &ChannelState) -> Self {
        Self {
            saved: state.saved().len(),
            queued: state.queued().len(),
            blocked: state.blocked().len(),
        }
    }
}

/// Wrapper around the SQLite-compatible connection holding channel state.
#[derive(Debug)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                SyncError::io(format!("creating state directory {}", parent.display()), err)
            })?;
        }

        let context = || format!("opening state DB {}", path.display());
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|err| SyncError::persistence(context(), err))?;
        let conn = db
            .connect()
            .map_err(|err| SyncError::persistence(context(), err))?;
        configure_connection(&conn)
            .await
            .map_err(|err| SyncError::persistence(context(), err))?;
        ensure_schema(&conn)
            .await
            .map_err(|err| SyncError::persistence(context(), err))?;

        Ok(Self { conn })
    }

    /// Loads the persisted sets of one channel. Unknown channels start empty.
    pub async fn load_state(&self, channel_key: &str) -> SyncResult<ChannelState> {
        self.read_state(channel_key)
            .await
            .map_err(|err| SyncError::persistence(format!("loading state of {channel_key}"), err))
    }

    async fn read_state(&self, channel_key: &str) -> Result<ChannelState, libsql::Error> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, status
                FROM channel_videos
                WHERE channel_key = ?1
                "#,
                params![channel_key],
            )
            .await?;

        let mut saved = Vec::new();
        let mut queued = Vec::new();
        let mut blocked = Vec::new();
        while let Some(row) = rows.next().await? {
            let video_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            match VideoStatus::parse(&status) {
                Some(VideoStatus::Saved) => saved.push(video_id),
                Some(VideoStatus::Queued) => queued.push(video_id),
                Some(VideoStatus::Blocked) => blocked.push(video_id),
                None => tracing::warn!(
                    channel = channel_key,
                    video = %video_id,
                    status = %status,
                    "ignoring row with unknown status"
                ),
            }
        }
        Ok(ChannelState::from_sets(saved, queued, blocked))
    }

    /// Replaces every stored id of `channel_key` in one transaction so a crash
    /// never leaves a half-written state behind.
    pub async fn save_state(&self, channel_key: &str, state: &ChannelState) -> SyncResult<()> {
        self.write_state(channel_key, state)
            .await
            .map_err(|err| SyncError::persistence(format!("saving state of {channel_key}"), err))
    }

    async fn write_state(
        &self,
        channel_key: &str,
        state: &ChannelState,
    ) -> Result<(), libsql::Error> {
        let tx = self.conn.transaction().await?;
        tx.execute(
            "DELETE FROM channel_videos WHERE channel_key = ?1",
            params![channel_key],
        )
        .await?;

        for (video_id, status) in state.entries() {
            tx.execute(
                r#"
                INSERT INTO channel_videos (channel_key, video_id, status)
                VALUES (?1, ?2, ?3)
                "#,
                params![channel_key, video_id, status.as_str()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upserts the status of a single id, leaving the rest of the channel
    /// untouched.
    pub async fn set_status(
        &self,
        channel_key: &str,
        video_id: &str,
        status: VideoStatus,
    ) -> SyncResult<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO channel_videos (channel_key, video_id, status)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(channel_key, video_id) DO UPDATE SET
                    status = excluded.status
                "#,
                params![channel_key, video_id, status.as_str()],
            )
            .await
            .map_err(|err| {
                SyncError::persistence(
                    format!("checkpointing {video_id} of {channel_key}"),
                    err,
                )
            })?;
        Ok(())
    }

    /// Records the completion time of a channel sync.
    pub async fn record_sync(&self, channel_key: &str, at: DateTime<Utc>) -> SyncResult<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO channel_runs (channel_key, last_synced)
                VALUES (?1, ?2)
                ON CONFLICT(channel_key) DO UPDATE SET
                    last_synced = excluded.last_synced
                "#,
                params![channel_key, at.to_rfc3339()],
            )
            .await
            .map_err(|err| {
                SyncError::persistence(format!("recording sync time of {channel_key}"), err)
            })?;
        Ok(())
    }

    pub async fn last_synced(&self, channel_key: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let context = || format!("reading sync time of {channel_key}");
        let mut rows = self
            .conn
            .query(
                "SELECT last_synced FROM channel_runs WHERE channel_key = ?1",
                params![channel_key],
            )
            .await
            .map_err(|err| SyncError::persistence(context(), err))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|err| SyncError::persistence(context(), err))?
        else {
            return Ok(None);
        };
        let raw: String = row
            .get(0)
            .map_err(|err| SyncError::persistence(context(), err))?;
        Ok(DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|value| value.with_timezone(&Utc)))
    }
}
