#![forbid(unsafe_code)]

//! Personal channel archiver: mirrors remote playlists into local folders,
//! remembering per channel which videos are saved, queued or blocked.

pub mod config;
pub mod downloader;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod model;
pub mod playlist;
pub mod process;
pub mod reconcile;
pub mod rules;
pub mod store;
pub mod sync;
