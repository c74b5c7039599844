//! Playback controller: the per-entry turn loop.
//!
//! One controller owns the cursor, the session budget and the stream
//! processes. Connectivity and shutdown arrive over `watch` channels; the
//! controller is the only writer of playback state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertDispatcher, AlertKind};
use crate::api::{Counters, NowPlaying, SharedStatus, StatusSnapshot};
use crate::budget::SessionBudget;
use crate::config::Config;
use crate::connectivity::LinkStatus;
use crate::error::{ControllerError, MediaError};
use crate::history::PlayHistory;
use crate::media::{AltNames, DurationLookup};
use crate::playlist::{Command, EntryKind, Playlist, PlaylistEntry};
use crate::publish::{PublishRequest, SchedulePublisher};
use crate::retry::{with_retry, RetryPolicy};
use crate::schedule::{AiredLog, BackwardLimits, CursorSnapshot, ForwardLimits, ItemKind, RestartProjection, ScheduleEntry};
use crate::state_store::{PlaybackState, StateStore};
use crate::supervisor::{EncodeRequest, EncoderExit, StreamSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Stopped,
    Loading,
    Playing,
    Paused,
    RestartingSession,
}

/// Why `run` returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    StopCommand,
    PlaylistEnd,
}

/// Position to resume from after rewinding, never below zero.
pub fn rewound_elapsed(elapsed: f64, rewind: f64, penalty: f64) -> f64 {
    (elapsed - rewind - penalty).max(0.0)
}

/// Start position for an entry loaded with `elapsed` already played.
///
/// Elapsed times past the end, or shorter than one rewind, start over. Never
/// resumes earlier than `floor`, the last point playback was resumed from.
pub fn resume_position(elapsed: f64, rewind: f64, duration: Option<f64>, floor: f64) -> f64 {
    if duration.is_some_and(|d| elapsed >= d) {
        return 0.0;
    }
    if floor > 0.0 && elapsed <= floor {
        return floor;
    }
    if elapsed < rewind {
        return 0.0;
    }
    rewound_elapsed(elapsed, rewind, 0.0).max(floor)
}

pub fn fmt_hms(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

pub struct ControllerDeps {
    pub supervisor: Box<dyn StreamSupervisor>,
    pub durations: Arc<dyn DurationLookup>,
    pub names: Arc<AltNames>,
    pub alerts: AlertDispatcher,
    pub history: PlayHistory,
    pub publisher: Option<SchedulePublisher>,
    pub link: watch::Receiver<LinkStatus>,
    pub shutdown: watch::Receiver<bool>,
    pub status: SharedStatus,
}

enum Flow {
    Continue,
    Finished(RunOutcome),
}

enum MediaCheck {
    Found,
    Skipped,
    Shutdown,
}

enum EncodeOutcome {
    Exit(EncoderExit),
    LinkDown { timed_out: bool },
    Shutdown,
}

enum WatchEvent {
    Exit(EncoderExit),
    LinkDown { timed_out: bool },
    Tick,
    Shutdown,
}

pub struct PlaybackController {
    cfg: Config,
    playlist: Arc<Playlist>,
    store: StateStore,
    cursor: PlaybackState,
    /// Earliest position the current entry may be resumed from.
    resume_floor: f64,
    budget: SessionBudget,
    state: ControllerState,
    now_playing: Option<NowPlaying>,
    counters: Counters,
    session_id: Uuid,
    session_started_at: OffsetDateTime,
    program_start: OffsetDateTime,
    program_started: Instant,
    restart_overhead: f64,
    /// Missing playable entries since the last one that was found.
    missing_streak: usize,
    aired: AiredLog,

    supervisor: Box<dyn StreamSupervisor>,
    durations: Arc<dyn DurationLookup>,
    names: Arc<AltNames>,
    alerts: AlertDispatcher,
    history: PlayHistory,
    publisher: Option<SchedulePublisher>,
    link: watch::Receiver<LinkStatus>,
    shutdown: watch::Receiver<bool>,
    status: SharedStatus,
}

impl PlaybackController {
    pub fn new(cfg: Config, playlist: Playlist, deps: ControllerDeps) -> Self {
        let store = StateStore::new(
            cfg.paths.play_index.clone(),
            Duration::from_secs(cfg.playback.save_interval),
        );
        let budget = SessionBudget::new(cfg.restart_ceiling_secs());
        let aired = AiredLog::new(cfg.schedule.previous_max_videos.max(cfg.schedule.previous_min_videos));
        let now = OffsetDateTime::now_utc();
        Self {
            cfg,
            playlist: Arc::new(playlist),
            store,
            cursor: PlaybackState::default(),
            resume_floor: 0.0,
            budget,
            state: ControllerState::Stopped,
            now_playing: None,
            counters: Counters::default(),
            session_id: Uuid::new_v4(),
            session_started_at: now,
            program_start: now,
            program_started: Instant::now(),
            restart_overhead: 0.0,
            missing_streak: 0,
            aired,
            supervisor: deps.supervisor,
            durations: deps.durations,
            names: deps.names,
            alerts: deps.alerts,
            history: deps.history,
            publisher: deps.publisher,
            link: deps.link,
            shutdown: deps.shutdown,
            status: deps.status,
        }
    }

    /// Play until shutdown, `%STOP`, end of playlist (with stop-on-end) or a
    /// fatal error. The cursor is saved on every exit path.
    pub async fn run(mut self) -> Result<RunOutcome, ControllerError> {
        match self.run_loop().await {
            Ok(outcome) => {
                self.finish().await;
                Ok(outcome)
            }
            Err(e) => {
                error!("fatal error, terminating stream: {e}");
                self.alerts.send(Alert::new(AlertKind::ProgramError).message(e.to_string()));
                self.history.record(&format!("Stream stopped due to error: {e}"));
                self.finish().await;
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<RunOutcome, ControllerError> {
        if self.playlist.playable_count() == 0 {
            return Err(ControllerError::EmptyPlaylist);
        }

        let loaded = self.store.load_or_default();
        self.cursor = if loaded.index < self.playlist.len() {
            loaded
        } else {
            warn!(
                "saved playlist index {} is past the end of a {}-entry playlist; starting over",
                loaded.index,
                self.playlist.len()
            );
            PlaybackState::default()
        };
        info!("resuming at playlist index {} ({:.0}s in)", self.cursor.index, self.cursor.elapsed);

        self.restart_overhead = self.compute_restart_overhead().await;
        if !self.start_relay_when_up().await? {
            return Ok(RunOutcome::Shutdown);
        }

        loop {
            if *self.shutdown.borrow() {
                return Ok(RunOutcome::Shutdown);
            }
            if let Flow::Finished(outcome) = self.turn().await? {
                return Ok(outcome);
            }
        }
    }

    async fn turn(&mut self) -> Result<Flow, ControllerError> {
        let playlist = self.playlist.clone();
        let Some(entry) = playlist.get(self.cursor.index) else {
            self.cursor = PlaybackState::default();
            return Ok(Flow::Continue);
        };

        match &entry.kind {
            EntryKind::Separator { extra_info } => {
                info!("line {}: {extra_info}", entry.line);
                Ok(self.advance())
            }
            EntryKind::Command(cmd) => self.run_command(cmd, entry).await,
            EntryKind::Playable { .. } => self.play_entry(entry).await,
        }
    }

    /// Move past the current line, wrapping or stopping at the end.
    fn advance(&mut self) -> Flow {
        let next = self.cursor.index + 1;
        self.resume_floor = 0.0;
        if next >= self.playlist.len() {
            self.cursor = PlaybackState::default();
            if self.cfg.stream.stop_after_last_video {
                info!("end of playlist reached; stopping stream");
                self.alerts.send(Alert::new(AlertKind::PlaylistEnd));
                return Flow::Finished(RunOutcome::PlaylistEnd);
            }
            info!("end of playlist reached; looping");
            self.alerts.send(Alert::new(AlertKind::PlaylistLoop));
        } else {
            self.cursor = PlaybackState { index: next, elapsed: 0.0 };
        }
        self.persist(true);
        Flow::Continue
    }

    async fn run_command(&mut self, cmd: &Command, entry: &PlaylistEntry) -> Result<Flow, ControllerError> {
        let line = entry.line;
        match cmd {
            Command::Mail(text) => {
                info!("line {line}: sending manual alert");
                let mut alert = Alert::new(AlertKind::MailCommand).line(line);
                if let Some(text) = text {
                    alert = alert.message(text.clone());
                }
                self.alerts.send(alert);
                Ok(self.advance())
            }
            Command::Unknown(keyword) => {
                warn!("line {line}: unknown command %{keyword}; skipping");
                Ok(self.advance())
            }
            Command::Stop => {
                info!("line {line}: executing %STOP");
                self.history.record(&format!("{line}. %STOP"));
                self.cursor = PlaybackState { index: self.cursor.index + 1, elapsed: 0.0 };
                self.alerts.send(Alert::new(AlertKind::PlaylistStop).line(line));
                Ok(Flow::Finished(RunOutcome::StopCommand))
            }
            Command::InstantRestart => {
                info!("line {line}: executing %INSTANT_RESTART");
                self.history.record(&format!("{line}. %INSTANT_RESTART"));
                if let Flow::Finished(outcome) = self.advance() {
                    return Ok(Flow::Finished(outcome));
                }
                self.restart_flow(false).await
            }
            Command::Restart => {
                let age = self.budget.session_age().as_secs_f64();
                let minimum = self.cfg.restart_minimum_secs();
                if age < minimum {
                    info!(
                        "line {line}: %RESTART ignored; session has run {} of the required {}",
                        fmt_hms(age),
                        fmt_hms(minimum)
                    );
                    return Ok(self.advance());
                }
                info!("line {line}: executing %RESTART");
                self.history.record(&format!("{line}. %RESTART"));
                if let Flow::Finished(outcome) = self.advance() {
                    return Ok(Flow::Finished(outcome));
                }
                self.restart_flow(true).await
            }
        }
    }

    async fn play_entry(&mut self, entry: &PlaylistEntry) -> Result<Flow, ControllerError> {
        let EntryKind::Playable { source, path, extra_info, excluded_from_schedule } = &entry.kind else {
            return Ok(self.advance());
        };
        self.set_state(ControllerState::Loading).await;

        match self.ensure_media(path, entry.line).await? {
            MediaCheck::Found => self.missing_streak = 0,
            MediaCheck::Skipped => {
                self.missing_streak += 1;
                if self.missing_streak >= self.playlist.playable_count() {
                    error!("no playable media found in a full playlist pass");
                    self.missing_streak = 0;
                    if !self.sleep_or_shutdown(Duration::from_secs(self.cfg.retry.delay)).await {
                        return Ok(Flow::Finished(RunOutcome::Shutdown));
                    }
                }
                return Ok(self.advance());
            }
            MediaCheck::Shutdown => return Ok(Flow::Finished(RunOutcome::Shutdown)),
        }

        let duration = match self.lookup_duration(path).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("line {}: {e}; playing without a known duration", entry.line);
                None
            }
        };
        let padding = self.cfg.stream.video_padding as f64;
        let rewind = self.cfg.playback.rewind as f64;

        let start_at = resume_position(self.cursor.elapsed, rewind, duration, self.resume_floor);
        self.cursor.elapsed = start_at;
        let remaining = duration.map_or(0.0, |d| (d - start_at).max(0.0)) + padding;
        if self.budget.should_restart_before(remaining) {
            info!("session runtime ceiling reached before line {}", entry.line);
            self.budget.mark_restart_pending();
            self.resume_floor = start_at;
            return self.restart_flow(true).await;
        }

        let name = entry.name().map(|n| self.names.display_name(&n)).unwrap_or_default();
        match duration {
            Some(d) => info!("line {}: {} - length {}", entry.line, source, fmt_hms(d)),
            None => info!("line {}: {}", entry.line, source),
        }
        if start_at > 0.0 {
            info!("starting from {}", fmt_hms(start_at));
        }
        if let Some(left) = self.budget.remaining() {
            debug!("{} left before the next forced restart", fmt_hms(left - remaining));
        }
        self.history.record(&format!("{}. {}", entry.line, source));

        let mut retried = false;
        let mut aired_start = None;
        loop {
            if retried && self.cfg.stream.wait_after_retry > 0 {
                info!("waiting {}s before retrying", self.cfg.stream.wait_after_retry);
                if !self.sleep_or_shutdown(Duration::from_secs(self.cfg.stream.wait_after_retry)).await {
                    return Ok(Flow::Finished(RunOutcome::Shutdown));
                }
            }

            // This attempt has not aired yet; its start position stands.
            let down = self.link.borrow().is_down();
            if down {
                warn!("line {}: connectivity is down; holding the entry until it returns", entry.line);
                if !self.recover_stream().await? {
                    return Ok(Flow::Finished(RunOutcome::Shutdown));
                }
            }

            if !*excluded_from_schedule {
                self.publish_schedule();
            }
            if retried {
                self.alerts.send(Alert::new(AlertKind::StreamResume));
            }

            let base = self.cursor.elapsed;
            let started_at = OffsetDateTime::now_utc() - time::Duration::seconds_f64(base);
            let aired_at = *aired_start.get_or_insert(started_at);
            self.now_playing = Some(NowPlaying {
                line: entry.line,
                name: name.clone(),
                extra_info: extra_info.clone(),
                duration: duration.unwrap_or(0.0),
                started_at,
            });
            self.set_state(ControllerState::Playing).await;

            self.supervisor
                .start_encoder(&EncodeRequest { path: path.clone(), skip_seconds: base })
                .await?;
            let started = Instant::now();
            let outcome = self.watch_encoder(base, started).await;
            let ran = started.elapsed().as_secs_f64();
            self.cursor.elapsed = base + ran;

            match outcome {
                EncodeOutcome::Exit(EncoderExit::Finished) => {
                    info!("line {}: encoded successfully", entry.line);
                    self.budget.record_elapsed(ran);
                    self.counters.videos_since_restart += 1;
                    self.counters.total_videos += 1;
                    self.now_playing = None;
                    debug!("session runtime {}", fmt_hms(self.budget.accumulated()));
                    if let Some(full) = duration {
                        if !*excluded_from_schedule && full >= self.cfg.schedule.min_duration as f64 {
                            self.aired.record(
                                self.cursor.index,
                                ScheduleEntry {
                                    kind: ItemKind::Normal,
                                    name: name.clone(),
                                    start: aired_at,
                                    duration: full,
                                    extra_info: extra_info.clone(),
                                },
                            );
                        }
                    }
                    return Ok(self.advance());
                }
                EncodeOutcome::Exit(EncoderExit::Failed(code)) => {
                    self.counters.retries += 1;
                    self.budget.record_partial(ran);
                    self.rewind_after_interruption(0.0);
                    warn!(
                        "encoding failed (exit code {code:?}); retrying from {}",
                        fmt_hms(self.cursor.elapsed)
                    );
                    let left = duration.map_or(0.0, |d| (d - self.cursor.elapsed).max(0.0)) + padding;
                    if self.budget.should_restart_before(left) {
                        warn!("insufficient session time left to retry; restarting stream");
                        self.budget.mark_restart_pending();
                        return self.restart_flow(true).await;
                    }
                    retried = true;
                }
                EncodeOutcome::Exit(EncoderExit::RelayExited(code)) => {
                    self.interrupted(&format!("relay process exited (code {code:?})"), ran);
                    self.rewind_after_interruption(0.0);
                    if !self.recover_stream().await? {
                        return Ok(Flow::Finished(RunOutcome::Shutdown));
                    }
                    retried = true;
                }
                EncodeOutcome::LinkDown { timed_out } => {
                    self.interrupted("connectivity check failed", ran);
                    let penalty = if timed_out { self.check_timeout() } else { 0.0 };
                    self.rewind_after_interruption(penalty);
                    if !self.recover_stream().await? {
                        return Ok(Flow::Finished(RunOutcome::Shutdown));
                    }
                    retried = true;
                }
                EncodeOutcome::Shutdown => return Ok(Flow::Finished(RunOutcome::Shutdown)),
            }
        }
    }

    /// Wait for the encoder while saving the cursor on a timer and watching
    /// connectivity and shutdown.
    async fn watch_encoder(&mut self, base: f64, started: Instant) -> EncodeOutcome {
        let every = Duration::from_secs(self.cfg.playback.save_interval.max(1));
        let mut tick = tokio::time::interval_at(started + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                exit = self.supervisor.wait_encoder() => WatchEvent::Exit(exit),
                timed_out = link_lost(&mut self.link) => WatchEvent::LinkDown { timed_out },
                _ = tick.tick() => WatchEvent::Tick,
                _ = shutdown_requested(&mut self.shutdown) => WatchEvent::Shutdown,
            };
            match event {
                WatchEvent::Exit(exit) => return EncodeOutcome::Exit(exit),
                WatchEvent::LinkDown { timed_out } => {
                    self.supervisor.stop_encoder().await;
                    return EncodeOutcome::LinkDown { timed_out };
                }
                WatchEvent::Shutdown => {
                    self.supervisor.stop_encoder().await;
                    return EncodeOutcome::Shutdown;
                }
                WatchEvent::Tick => {
                    self.cursor.elapsed = base + started.elapsed().as_secs_f64();
                    self.persist(false);
                    self.publish_status().await;
                }
            }
        }
    }

    fn interrupted(&mut self, reason: &str, ran: f64) {
        error!("stream interrupted: {reason}");
        self.counters.retries += 1;
        self.budget.record_partial(ran);
        self.history.record(&format!("Stream interrupted: {reason}"));
        self.alerts.send(Alert::new(AlertKind::StreamDown).message(reason));
    }

    /// Step back from the interruption point, never before the last resume.
    fn rewind_after_interruption(&mut self, penalty: f64) {
        let rewound = rewound_elapsed(self.cursor.elapsed, self.cfg.playback.rewind as f64, penalty);
        self.cursor.elapsed = rewound.max(self.resume_floor).min(self.cursor.elapsed);
        self.resume_floor = self.cursor.elapsed;
        self.persist(true);
    }

    /// Tear the stream down, wait for connectivity and bring the relay back.
    /// Returns false when shutdown was requested meanwhile.
    async fn recover_stream(&mut self) -> Result<bool, ControllerError> {
        self.set_state(ControllerState::Paused).await;
        let paused_at = Instant::now();
        self.supervisor.stop_encoder().await;
        self.supervisor.stop_relay().await;
        self.new_session();
        let resumed = self.start_relay_when_up().await?;
        self.counters.downtime_secs += paused_at.elapsed().as_secs_f64();
        if resumed {
            info!("stream resumed from {}", fmt_hms(self.cursor.elapsed));
            self.history.record("Stream resumed.");
        }
        Ok(resumed)
    }

    async fn restart_flow(&mut self, bumpers: bool) -> Result<Flow, ControllerError> {
        if self.restart_session(bumpers).await? {
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Finished(RunOutcome::Shutdown))
        }
    }

    /// Full session restart. Returns false when shutdown was requested.
    async fn restart_session(&mut self, bumpers: bool) -> Result<bool, ControllerError> {
        self.set_state(ControllerState::RestartingSession).await;
        let forced = self.budget.restart_pending();
        self.counters.restarts += 1;
        self.alerts.send(Alert::new(AlertKind::StreamRestart));
        info!(
            session = %self.session_id,
            videos = self.counters.videos_since_restart,
            forced,
            "restarting stream after {} of runtime",
            fmt_hms(self.budget.accumulated())
        );

        if bumpers {
            if let Some(before) = self.cfg.stream.restart_before_video.clone() {
                if !self.play_bumper(&before, "before", false).await? {
                    return Ok(false);
                }
            }
        }

        self.supervisor.stop_encoder().await;
        self.supervisor.stop_relay().await;
        let wait = Duration::from_secs(self.cfg.stream.restart_wait);
        info!("waiting {}s to restart", wait.as_secs());
        if !self.sleep_or_shutdown(wait).await {
            return Ok(false);
        }

        self.new_session();
        if !self.start_relay_when_up().await? {
            return Ok(false);
        }

        if bumpers {
            if let Some(after) = self.cfg.stream.restart_after_video.clone() {
                if !self.play_bumper(&after, "after", true).await? {
                    return Ok(false);
                }
            }
        }

        info!("stream restarted");
        self.history.record("Stream restarted.");
        Ok(true)
    }

    /// Bumpers before the restart count toward the ending session; bumpers after
    /// it are not charged to the new one.
    async fn play_bumper(&mut self, path: &Path, label: &str, after_restart: bool) -> Result<bool, ControllerError> {
        if !self.durations.exists(path) {
            error!("{label} restart bumper {} not found", path.display());
            self.alerts
                .send(Alert::new(AlertKind::FileNotFound).message(path.display().to_string()));
            return Ok(true);
        }
        info!("playing {label} restart bumper {}", path.display());
        self.history.record(&format!("Restart bumper ({label}): {}", path.display()));

        self.supervisor
            .start_encoder(&EncodeRequest { path: path.to_path_buf(), skip_seconds: 0.0 })
            .await?;
        let started = Instant::now();
        let exit = tokio::select! {
            exit = self.supervisor.wait_encoder() => Some(exit),
            _ = shutdown_requested(&mut self.shutdown) => None,
        };
        let Some(exit) = exit else {
            self.supervisor.stop_encoder().await;
            return Ok(false);
        };
        if !after_restart {
            self.budget.record_bumper(started.elapsed().as_secs_f64());
        }

        match exit {
            EncoderExit::Finished => {}
            EncoderExit::Failed(code) => warn!("{label} restart bumper failed (exit code {code:?})"),
            EncoderExit::RelayExited(code) => {
                warn!("relay exited during {label} restart bumper (code {code:?})");
                if after_restart && !self.start_relay_when_up().await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Start the relay once connectivity is up. Returns false on shutdown.
    async fn start_relay_when_up(&mut self) -> Result<bool, ControllerError> {
        if !self.link.borrow().is_up() {
            self.set_state(ControllerState::Paused).await;
            info!("waiting for connectivity before starting the relay");
            let up = tokio::select! {
                up = link_up(&mut self.link) => Some(up),
                _ = shutdown_requested(&mut self.shutdown) => None,
            };
            match up {
                None => return Ok(false),
                Some(false) => warn!("connectivity monitor is gone; starting the relay anyway"),
                Some(true) => info!("connectivity restored"),
            }
        }
        self.supervisor.start_relay().await?;
        Ok(true)
    }

    async fn ensure_media(&mut self, path: &Path, line: usize) -> Result<MediaCheck, ControllerError> {
        let policy = RetryPolicy::from_signed(self.cfg.retry.attempts, Duration::from_secs(self.cfg.retry.delay));
        let durations = self.durations.clone();
        let lookup = with_retry(policy, "media lookup", || {
            let found = durations.exists(path);
            async move {
                if found {
                    Ok(())
                } else {
                    Err(MediaError::NotFound(path.to_path_buf()))
                }
            }
        });

        let result = tokio::select! {
            r = lookup => Some(r),
            _ = shutdown_requested(&mut self.shutdown) => None,
        };
        match result {
            None => Ok(MediaCheck::Shutdown),
            Some(Ok(())) => Ok(MediaCheck::Found),
            Some(Err(e)) => {
                error!("line {line}: {e}");
                self.alerts.send(
                    Alert::new(AlertKind::FileNotFound)
                        .message(path.display().to_string())
                        .line(line),
                );
                if self.cfg.retry.exit_on_file_not_found {
                    return Err(ControllerError::MissingMedia(path.to_path_buf()));
                }
                warn!("line {line}: skipping missing entry");
                Ok(MediaCheck::Skipped)
            }
        }
    }

    async fn sleep_or_shutdown(&mut self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = shutdown_requested(&mut self.shutdown) => false,
        }
    }

    fn new_session(&mut self) {
        self.budget.reset();
        self.session_id = Uuid::new_v4();
        self.session_started_at = OffsetDateTime::now_utc();
        self.counters.videos_since_restart = 0;
        debug!("new stream session {}", self.session_id);
    }

    fn check_timeout(&self) -> f64 {
        self.cfg.check_timeout().as_secs_f64()
    }

    async fn compute_restart_overhead(&self) -> f64 {
        let padding = self.cfg.stream.video_padding as f64;
        let bumpers: Vec<PathBuf> = [&self.cfg.stream.restart_before_video, &self.cfg.stream.restart_after_video]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        let mut overhead = self.cfg.stream.restart_wait as f64;
        for bumper in bumpers {
            if let Ok(d) = self.lookup_duration(&bumper).await {
                overhead += d + padding;
            }
        }
        overhead
    }

    /// ffprobe shells out, so lookups run on the blocking pool.
    async fn lookup_duration(&self, path: &Path) -> Result<f64, MediaError> {
        let durations = self.durations.clone();
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || durations.duration(&owned))
            .await
            .unwrap_or_else(|e| Err(MediaError::Probe { path: path.to_path_buf(), reason: e.to_string() }))
    }

    fn publish_schedule(&mut self) {
        if self.publisher.is_none() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let mut forward = ForwardLimits::from_config(&self.cfg);
        if self.budget.ceiling() > 0.0 {
            forward.restart = Some(RestartProjection::from_budget(
                &self.budget,
                self.cfg.restart_minimum_secs(),
                self.restart_overhead,
                self.cfg.stream.restart_wait as f64,
                now,
            ));
        }
        let req = PublishRequest {
            playlist: self.playlist.clone(),
            cursor: CursorSnapshot { index: self.cursor.index, elapsed: self.cursor.elapsed, now },
            forward,
            backward: BackwardLimits::from_config(&self.cfg),
            aired: self.aired.snapshot(),
            program_start: self.program_start,
        };
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.publish(req);
        }
    }

    fn persist(&mut self, force: bool) {
        let result = if force {
            self.store.force_save(self.cursor).map(|_| true)
        } else {
            self.store.save(self.cursor)
        };
        if let Err(e) = result {
            error!("unable to save playback position to {}: {e}", self.store.path().display());
        }
    }

    async fn set_state(&mut self, state: ControllerState) {
        if self.state != state {
            debug!("controller state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish_status().await;
    }

    async fn publish_status(&self) {
        let snapshot = StatusSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.state,
            now_playing: self.now_playing.clone(),
            index: self.cursor.index,
            elapsed: self.cursor.elapsed,
            session_id: self.session_id,
            session_started_at: self.session_started_at,
            session_runtime_secs: self.budget.accumulated(),
            program_start_time: self.program_start,
            counters: self.counters.clone(),
        };
        *self.status.write().await = snapshot;
    }

    async fn finish(&mut self) {
        self.supervisor.stop_encoder().await;
        self.supervisor.stop_relay().await;
        self.persist(true);
        let total = fmt_hms(self.program_started.elapsed().as_secs_f64());
        self.history.record(&format!("Stream ended after {total}."));
        info!(
            total_videos = self.counters.total_videos,
            restarts = self.counters.restarts,
            retries = self.counters.retries,
            "stream ended after {total}"
        );
        self.now_playing = None;
        self.set_state(ControllerState::Stopped).await;
    }
}

/// Resolves once shutdown is requested; pends forever if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Resolves when the link goes down, yielding whether the probe timed out.
async fn link_lost(rx: &mut watch::Receiver<LinkStatus>) -> bool {
    let timed_out = match rx.wait_for(|s| s.is_down()).await {
        Ok(status) => Some(matches!(*status, LinkStatus::Down { timed_out: true })),
        Err(_) => None,
    };
    match timed_out {
        Some(t) => t,
        None => std::future::pending().await,
    }
}

/// Resolves when the link is up; false if the monitor went away.
async fn link_up(rx: &mut watch::Receiver<LinkStatus>) -> bool {
    rx.wait_for(|s| s.is_up()).await.is_ok()
}
