#![forbid(unsafe_code)]

//! Error taxonomy shared by the sync engine.
//!
//! Errors carry their own scope: channel-scoped errors abort the current
//! channel and the run moves on, fatal errors abort the whole process because
//! the persisted state can no longer be trusted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching playlist {playlist_id} failed: {reason}")]
    Fetch { playlist_id: String, reason: String },

    #[error("title {title:?} does not match strict pattern {pattern:?}")]
    StrictPatternMismatch { title: String, pattern: String },

    #[error("invalid rule for channel {channel}: {reason}")]
    InvalidRule { channel: String, reason: String },

    #[error("{context}")]
    Persistence {
        context: String,
        #[source]
        source: libsql::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn fetch(playlist_id: &str, reason: impl ToString) -> Self {
        Self::Fetch {
            playlist_id: playlist_id.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(context: impl Into<String>, source: libsql::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error leaves local state untrustworthy and the whole run
    /// must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Io { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
