#![forbid(unsafe_code)]

//! Configuration: runtime settings from `.env` plus the process environment,
//! and channel definitions from a TOML file.
//!
//! Precedence for runtime settings is CLI override, then environment
//! variable, then `.env` file, then default.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::SyncResult;
use crate::model::MediaKind;
use crate::rules::{FilterRule, RenameRule, RuleSet};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CHANNELS_PATH: &str = "channels.toml";
pub const DEFAULT_YT_DLP: &str = crate::downloader::DEFAULT_YT_DLP;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub state_db: PathBuf,
    pub channels_file: PathBuf,
    pub api_key: Option<String>,
    pub yt_dlp: PathBuf,
    pub cookies: Option<PathBuf>,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub state_db: Option<PathBuf>,
    pub channels_file: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let state_db = overrides
        .state_db
        .or_else(|| lookup("TUBESYNC_STATE_DB").map(PathBuf::from))
        .ok_or_else(|| anyhow!("TUBESYNC_STATE_DB not set"))?;
    let channels_file = overrides
        .channels_file
        .or_else(|| lookup("TUBESYNC_CHANNELS").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CHANNELS_PATH));
    let api_key = lookup("YOUTUBE_API_KEY");
    let yt_dlp = lookup("YT_DLP_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));
    let cookies = lookup("YT_DLP_COOKIES").map(PathBuf::from);
    let timeout_secs = lookup("DOWNLOAD_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);

    Ok(RuntimeSettings {
        state_db,
        channels_file,
        api_key,
        yt_dlp,
        cookies,
        download_timeout: Duration::from_secs(timeout_secs),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Parses `KEY=value` lines, tolerating `export`, quotes and comments. A
/// missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

fn default_active() -> bool {
    true
}

/// One archived playlist or channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub playlist_id: String,
    pub output_folder: PathBuf,
    #[serde(default)]
    pub save_as_audio: bool,
    /// Text file that collects the absolute path of every saved file.
    #[serde(default)]
    pub playlist_file: Option<PathBuf>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub renames: Vec<RenameRule>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
}

impl ChannelConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.key)
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_audio_flag(self.save_as_audio)
    }

    pub fn compile_rules(&self) -> SyncResult<RuleSet> {
        RuleSet::compile(&self.key, &self.renames, &self.filters)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.output_folder.is_relative() {
            self.output_folder = base.join(&self.output_folder);
        }
        if let Some(playlist) = &self.playlist_file
            && playlist.is_relative()
        {
            self.playlist_file = Some(base.join(playlist));
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    #[serde(default, rename = "channel")]
    channels: Vec<ChannelConfig>,
}

/// Parses channel definitions and checks keys. Rules are compiled here too
/// so a bad pattern is reported before anything runs.
pub fn parse_channels(content: &str) -> Result<Vec<ChannelConfig>> {
    let file: ChannelsFile = toml::from_str(content).context("parsing channel definitions")?;
    let mut seen = HashSet::new();
    for channel in &file.channels {
        if channel.key.trim().is_empty() {
            bail!("channel with playlist {} has an empty key", channel.playlist_id);
        }
        if channel.playlist_id.trim().is_empty() {
            bail!("channel {} has an empty playlist_id", channel.key);
        }
        if !seen.insert(channel.key.as_str()) {
            bail!("duplicate channel key {}", channel.key);
        }
        channel.compile_rules()?;
    }
    Ok(file.channels)
}

/// Loads `channels.toml`; relative folders are resolved against the file's
/// directory.
pub fn load_channels(path: &Path) -> Result<Vec<ChannelConfig>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut channels =
        parse_channels(&content).with_context(|| format!("Loading {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for channel in &mut channels {
        channel.resolve_paths(base);
    }
    Ok(channels)
}

/// Everything a run needs, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeSettings,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub fn load(overrides: RuntimeOverrides) -> Result<Self> {
        let runtime = resolve_runtime_settings(overrides)?;
        let channels = load_channels(&runtime.channels_file)?;
        Ok(Self { runtime, channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{DateOp, TextMatch};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn settings_apply_defaults() {
        let settings = settings_from("TUBESYNC_STATE_DB=\"/var/lib/tubesync.db\"\n");
        assert_eq!(settings.state_db, PathBuf::from("/var/lib/tubesync.db"));
        assert_eq!(settings.channels_file, PathBuf::from(DEFAULT_CHANNELS_PATH));
        assert_eq!(settings.yt_dlp, PathBuf::from(DEFAULT_YT_DLP));
        assert!(settings.api_key.is_none());
        assert!(settings.cookies.is_none());
        assert_eq!(
            settings.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
    }

    #[test]
    fn settings_require_state_db() {
        let vars = read_env_file(make_config("YOUTUBE_API_KEY=abc\n").path()).unwrap();
        let err = build_runtime_settings(&vars, |_| None, RuntimeOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("TUBESYNC_STATE_DB"));
    }

    #[test]
    fn settings_read_every_key() {
        let settings = settings_from(
            r#"
            export TUBESYNC_STATE_DB="/s.db"
            TUBESYNC_CHANNELS='/etc/tubesync/channels.toml'
            YOUTUBE_API_KEY = "secret"
            YT_DLP_PATH=/opt/yt-dlp
            YT_DLP_COOKIES="/cookies.txt"
            DOWNLOAD_TIMEOUT_SECS=90
            # comment
            INVALID_LINE
            "#,
        );
        assert_eq!(settings.channels_file, PathBuf::from("/etc/tubesync/channels.toml"));
        assert_eq!(settings.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.yt_dlp, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.cookies, Some(PathBuf::from("/cookies.txt")));
        assert_eq!(settings.download_timeout, Duration::from_secs(90));
    }

    #[test]
    fn invalid_timeout_falls_back_to_default() {
        for raw in ["nope", "0", "-5"] {
            let settings = settings_from(&format!(
                "TUBESYNC_STATE_DB=/s.db\nDOWNLOAD_TIMEOUT_SECS={raw}\n"
            ));
            assert_eq!(
                settings.download_timeout,
                Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
            );
        }
    }

    #[test]
    fn blank_file_values_count_as_unset() {
        let settings = settings_from("TUBESYNC_STATE_DB=/s.db\nYOUTUBE_API_KEY=\"  \"\n");
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn precedence_is_override_then_env_then_file() {
        let mut vars = HashMap::new();
        vars.insert("TUBESYNC_STATE_DB".to_string(), "/file.db".to_string());
        vars.insert("TUBESYNC_CHANNELS".to_string(), "/file.toml".to_string());
        vars.insert("YOUTUBE_API_KEY".to_string(), "file-key".to_string());

        let settings = build_runtime_settings(
            &vars,
            |key| match key {
                "TUBESYNC_STATE_DB" => Some("/env.db".to_string()),
                "YOUTUBE_API_KEY" => Some("env-key".to_string()),
                _ => None,
            },
            RuntimeOverrides {
                state_db: Some(PathBuf::from("/override.db")),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();

        assert_eq!(settings.state_db, PathBuf::from("/override.db"));
        assert_eq!(settings.channels_file, PathBuf::from("/file.toml"));
        assert_eq!(settings.api_key.as_deref(), Some("env-key"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    const CHANNELS: &str = r#"
        [[channel]]
        key = "lofi"
        display_name = "Lo-fi Beats"
        playlist_id = "PLlofi"
        output_folder = "music/lofi"
        save_as_audio = true
        playlist_file = "playlists/lofi.m3u"
        group = "music"

        [[channel.renames]]
        kind = "replace"
        from = " (Official Audio)"
        to = ""

        [[channel.filters]]
        kind = "title"
        match = "contains"
        value = "live"

        [[channel]]
        key = "talks"
        playlist_id = "UUtalks"
        output_folder = "/srv/talks"
        active = false

        [[channel.filters]]
        kind = "date"
        op = "before"
        date = "2020-01-01"
    "#;

    #[test]
    fn parse_channels_reads_rules_and_defaults() {
        let channels = parse_channels(CHANNELS).unwrap();
        assert_eq!(channels.len(), 2);

        let lofi = &channels[0];
        assert_eq!(lofi.display_name(), "Lo-fi Beats");
        assert_eq!(lofi.media_kind(), MediaKind::Audio);
        assert!(lofi.active);
        assert_eq!(lofi.group.as_deref(), Some("music"));
        assert_eq!(lofi.renames.len(), 1);
        assert!(matches!(
            lofi.filters[0],
            FilterRule::Title { mode: TextMatch::Contains, .. }
        ));

        let talks = &channels[1];
        assert_eq!(talks.display_name(), "talks");
        assert_eq!(talks.media_kind(), MediaKind::Video);
        assert!(!talks.active);
        assert!(matches!(talks.filters[0], FilterRule::Date { op: DateOp::Before, .. }));
    }

    #[test]
    fn parse_channels_rejects_duplicate_keys() {
        let err = parse_channels(
            r#"
            [[channel]]
            key = "a"
            playlist_id = "P1"
            output_folder = "/a"

            [[channel]]
            key = "a"
            playlist_id = "P2"
            output_folder = "/b"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate channel key a"));
    }

    #[test]
    fn parse_channels_rejects_invalid_rules() {
        let err = parse_channels(
            r#"
            [[channel]]
            key = "a"
            playlist_id = "P1"
            output_folder = "/a"

            [[channel.renames]]
            kind = "regex_replace"
            pattern = "(unclosed"
            replacement = ""
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid rule for channel a"));
    }

    #[test]
    fn load_channels_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.toml");
        fs::write(&path, CHANNELS).unwrap();

        let channels = load_channels(&path).unwrap();
        assert_eq!(channels[0].output_folder, dir.path().join("music/lofi"));
        assert_eq!(
            channels[0].playlist_file,
            Some(dir.path().join("playlists/lofi.m3u"))
        );
        assert_eq!(channels[1].output_folder, PathBuf::from("/srv/talks"));
    }

    #[test]
    fn sample_channel_file_parses() {
        let channels = parse_channels(include_str!("../demos/channels.toml")).unwrap();
        let keys: Vec<_> = channels.iter().map(|channel| channel.key.as_str()).collect();
        assert_eq!(keys, ["lofi", "podcast", "lectures"]);
    }

    #[test]
    fn empty_channel_file_is_valid() {
        assert!(parse_channels("").unwrap().is_empty());
    }
}
