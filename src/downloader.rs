#![forbid(unsafe_code)]

//! External media downloader.
//!
//! The sync engine only needs a yes/no answer per video, so [`Downloader`]
//! implementations never return errors: every problem (missing binary,
//! non-zero exit, timeout, no output file) becomes [`DownloadOutcome::Failed`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::process::run_captured;

pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Saved { path: PathBuf },
    Failed { reason: String },
}

impl DownloadOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, DownloadOutcome::Saved { .. })
    }
}

pub trait Downloader {
    /// Fetches `video_id` into `dest`. The file at `dest` must exist for the
    /// outcome to be [`DownloadOutcome::Saved`].
    fn download(
        &self,
        video_id: &str,
        dest: &Path,
        as_audio: bool,
    ) -> impl Future<Output = DownloadOutcome> + Send;
}

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Runs yt-dlp once per video.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: PathBuf,
    cookies: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            cookies: None,
            timeout,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Runs `<program> --version`; used to fail loudly before a run starts
    /// when the binary is missing.
    pub async fn version(&self) -> std::io::Result<String> {
        let mut command = Command::new(&self.program);
        command.arg("--version");
        let output = run_captured(command, Duration::from_secs(30)).await?;
        if !output.success() {
            return Err(std::io::Error::other(format!(
                "{} --version exited unsuccessfully",
                self.program.display()
            )));
        }
        Ok(output.stdout.first().cloned().unwrap_or_default())
    }

    fn build_args(&self, url: &str, dest: &Path, as_audio: bool) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--no-overwrites".to_string(),
            "--output".to_string(),
            output_template(dest),
        ];

        if as_audio {
            args.extend(["-x", "--audio-format", "mp3"].map(String::from));
        } else {
            args.extend(
                [
                    "--format",
                    "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b",
                    "--merge-output-format",
                    "mp4",
                    "--remux-video",
                    "mp4",
                ]
                .map(String::from),
            );
        }

        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push(url.to_string());
        args
    }
}

/// yt-dlp output template for `dest`: the extension is left to yt-dlp and
/// literal `%` characters are escaped.
fn output_template(dest: &Path) -> String {
    dest.with_extension("")
        .to_string_lossy()
        .replace('%', "%%")
        + ".%(ext)s"
}

impl Downloader for YtDlpDownloader {
    async fn download(&self, video_id: &str, dest: &Path, as_audio: bool) -> DownloadOutcome {
        if let Some(parent) = dest.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            return DownloadOutcome::Failed {
                reason: format!("creating {}: {err}", parent.display()),
            };
        }

        let url = video_url(video_id);
        let mut command = Command::new(&self.program);
        command.args(self.build_args(&url, dest, as_audio));
        tracing::debug!(video = video_id, dest = %dest.display(), "invoking downloader");

        let output = match run_captured(command, self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                return DownloadOutcome::Failed {
                    reason: format!("could not start {}: {err}", self.program.display()),
                };
            }
        };

        if output.success() && dest.exists() {
            return DownloadOutcome::Saved {
                path: dest.to_path_buf(),
            };
        }

        let reason = if output.timed_out {
            format!("timed out after {}s", self.timeout.as_secs())
        } else if !output.success() {
            output
                .last_error_line()
                .map(str::to_owned)
                .unwrap_or_else(|| match output.status {
                    Some(status) => format!("exited with {status}"),
                    None => "exited abnormally".to_string(),
                })
        } else {
            format!("finished without producing {}", dest.display())
        };
        DownloadOutcome::Failed { reason }
    }
}
