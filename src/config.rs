//! Engine configuration.
//!
//! Loaded once at startup from a TOML file. Every field has a default so a
//! missing or partial file still yields a runnable engine; `normalize`
//! applies the derived rules (interval floors, path resolution, limit
//! clamping) so the rest of the crate can trust the values it reads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub stream: StreamConfig,
    pub connectivity: ConnectivityConfig,
    pub playback: PlaybackConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub alerts: AlertsConfig,
    pub upload: UploadConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Media root. Relative playlist entries and bumper paths resolve here.
    pub base: PathBuf,
    pub playlist: PathBuf,
    pub play_index: PathBuf,
    pub play_history: Option<PathBuf>,
    pub schedule: Option<PathBuf>,
    pub alt_names: Option<PathBuf>,
    pub encoder_log: Option<PathBuf>,
    pub relay_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base: PathBuf::from("/media/videos"),
            playlist: PathBuf::from("playlist.txt"),
            play_index: PathBuf::from("play_index.txt"),
            play_history: Some(PathBuf::from("play_history.txt")),
            schedule: Some(PathBuf::from("schedule.json")),
            alt_names: None,
            encoder_log: None,
            relay_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub encoder_program: String,
    /// Argument list; `{file}`, `{skip_time}` and `{video_padding}` are
    /// substituted per entry.
    pub encoder_args: Vec<String>,
    pub relay_program: String,
    pub relay_args: Vec<String>,
    /// Seconds of padding the encoder appends after every entry.
    pub video_padding: u64,
    /// Session runtime ceiling in minutes. Zero disables forced restarts.
    pub restart_after_minutes: u64,
    /// Seconds to wait between tearing the relay down and starting it again.
    pub restart_wait: u64,
    /// Minimum session age, in minutes, before `%RESTART` is honored.
    pub restart_minimum_minutes: u64,
    pub restart_before_video: Option<PathBuf>,
    pub restart_after_video: Option<PathBuf>,
    /// Seconds to wait before retrying an entry whose encoder failed.
    pub wait_after_retry: u64,
    pub stop_after_last_video: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let encoder_args = [
            "-hide_banner", "-loglevel", "fatal", "-re",
            "-ss", "{skip_time}", "-i", "{file}",
            "-filter_complex",
            "[0:v]scale=1280x720,fps=30[scaled];[scaled]tpad=stop_duration={video_padding};apad=pad_dur={video_padding}",
            "-c:v", "libx264", "-b:v", "4000k", "-acodec", "aac", "-b:a", "192k",
            "-ar", "48000", "-f", "flv", "-g", "60", "rtmp://localhost:1935/live/",
        ];
        let relay_args = [
            "-hide_banner", "-loglevel", "fatal",
            "-i", "rtmp://localhost:1935/live",
            "-vcodec", "copy", "-acodec", "copy", "-f", "flv",
            "rtmp://localhost:1935/live/",
        ];
        Self {
            encoder_program: "ffmpeg".into(),
            encoder_args: encoder_args.iter().map(|s| s.to_string()).collect(),
            relay_program: "ffmpeg".into(),
            relay_args: relay_args.iter().map(|s| s.to_string()).collect(),
            video_padding: 2,
            restart_after_minutes: 1440,
            restart_wait: 10,
            restart_minimum_minutes: 30,
            restart_before_video: None,
            restart_after_video: None,
            wait_after_retry: 15,
            stop_after_last_video: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Probe targets. Empty disables connectivity monitoring.
    pub urls: Vec<String>,
    /// Seconds between checks, floored by `normalize`.
    pub interval: u64,
    pub strict: bool,
    /// Per-request timeout in seconds.
    pub timeout: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            urls: vec![
                "https://google.com".into(),
                "https://github.com".into(),
                "https://one.one.one.one".into(),
            ],
            interval: 60,
            strict: true,
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Seconds between throttled saves of the playback cursor.
    pub save_interval: u64,
    /// Seconds to rewind when resuming an interrupted entry.
    pub rewind: u64,
    /// Lines kept in the play history file.
    pub history_length: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { save_interval: 30, rewind: 30, history_length: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub min_videos: usize,
    pub max_videos: usize,
    pub upcoming_minutes: u64,
    /// Entries shorter than this many seconds are folded into the next start.
    pub min_duration: u64,
    pub previous_min_videos: usize,
    pub previous_max_videos: usize,
    pub previous_minutes: u64,
    pub previous_prune_tight: bool,
    /// Case-insensitive path prefixes kept off the published schedule.
    pub exclude_patterns: Vec<String>,
    /// Signed shift, in seconds, applied to every published timestamp.
    pub offset: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_videos: 1,
            max_videos: 15,
            upcoming_minutes: 240,
            min_duration: 0,
            previous_min_videos: 1,
            previous_max_videos: 3,
            previous_minutes: 30,
            previous_prune_tight: false,
            exclude_patterns: Vec::new(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for a missing media file; negative retries forever.
    pub attempts: i64,
    /// Seconds between attempts.
    pub delay: u64,
    pub exit_on_file_not_found: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { attempts: 0, delay: 5, exit_on_file_not_found: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    /// Optional JSON webhook every delivered alert is POSTed to.
    pub webhook_url: Option<String>,
    /// Seconds between two alerts of the same kind (unless bypassed).
    pub rate_limit: u64,
    pub on_stream_down: bool,
    pub on_stream_resume: bool,
    pub on_stream_restart: bool,
    pub on_command: bool,
    pub on_file_not_found: bool,
    pub on_program_error: bool,
    pub on_playlist_loop: bool,
    pub on_playlist_stop: bool,
    pub on_playlist_end: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            rate_limit: 3600,
            on_stream_down: true,
            on_stream_resume: true,
            on_stream_restart: false,
            on_command: true,
            on_file_not_found: true,
            on_program_error: true,
            on_playlist_loop: false,
            on_playlist_stop: true,
            on_playlist_end: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Program run after each schedule write, e.g. `scp`. Unset disables upload.
    pub program: Option<String>,
    /// Arguments; `{file}` is replaced with the schedule path.
    pub args: Vec<String>,
    pub attempts: u32,
    pub delay: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { program: None, args: Vec::new(), attempts: 5, delay: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Status API bind address. Empty disables the server.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:3000".into() }
    }
}

impl Config {
    /// Read and normalize `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Config>(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("config file {} not found, using defaults", path.display());
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Read { path: path.to_path_buf(), source });
            }
        };
        cfg.normalize()
    }

    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        let base = self.paths.base.clone();
        self.paths.play_index = resolve(&base, &self.paths.play_index);
        self.paths.play_history = self.paths.play_history.take().and_then(|p| non_empty(&base, p));
        self.stream.restart_before_video =
            self.stream.restart_before_video.take().and_then(|p| non_empty(&base, p));
        self.stream.restart_after_video =
            self.stream.restart_after_video.take().and_then(|p| non_empty(&base, p));
        self.paths.schedule = self.paths.schedule.take().filter(|p| !p.as_os_str().is_empty());
        self.paths.alt_names = self.paths.alt_names.take().filter(|p| !p.as_os_str().is_empty());

        self.connectivity.urls = self
            .connectivity
            .urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        let floor = (self.connectivity.urls.len() as u64 * 5).max(10);
        if !self.connectivity.urls.is_empty() && self.connectivity.interval < floor {
            warn!(
                "connectivity interval {}s is below the floor for {} url(s); using {}s",
                self.connectivity.interval,
                self.connectivity.urls.len(),
                floor
            );
            self.connectivity.interval = floor;
        }
        if self.connectivity.timeout == 0 {
            self.connectivity.timeout = 5;
        }

        let s = &mut self.schedule;
        s.min_videos = s.min_videos.max(1);
        s.max_videos = s.max_videos.max(1);
        if s.max_videos < s.min_videos {
            return Err(ConfigError::Invalid(format!(
                "schedule.max_videos ({}) is less than schedule.min_videos ({})",
                s.max_videos, s.min_videos
            )));
        }
        if s.previous_max_videos < s.previous_min_videos {
            return Err(ConfigError::Invalid(format!(
                "schedule.previous_max_videos ({}) is less than schedule.previous_min_videos ({})",
                s.previous_max_videos, s.previous_min_videos
            )));
        }
        s.exclude_patterns = s
            .exclude_patterns
            .iter()
            .map(|p| normalize_pattern(p))
            .filter(|p| !p.is_empty())
            .collect();

        if self.retry.delay == 0 {
            self.retry.delay = 5;
        }
        if self.upload.attempts == 0 {
            self.upload.attempts = 1;
        }
        Ok(self)
    }

    pub fn restart_ceiling_secs(&self) -> f64 {
        (self.stream.restart_after_minutes * 60) as f64
    }

    pub fn restart_minimum_secs(&self) -> f64 {
        (self.stream.restart_minimum_minutes * 60) as f64
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.interval)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity.timeout)
    }
}

/// Case-fold and use forward slashes so patterns compare against entry paths.
pub fn normalize_pattern(p: &str) -> String {
    p.trim().to_lowercase().replace('\\', "/")
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn non_empty(base: &Path, p: PathBuf) -> Option<PathBuf> {
    if p.as_os_str().is_empty() {
        None
    } else {
        Some(resolve(base, &p))
    }
}
