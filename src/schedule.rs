//! Forward and backward timetables projected from the playlist.
//!
//! The generator only reads a cursor snapshot; it never touches live
//! playback state. Durations come from a [`DurationLookup`] and display
//! names from [`AltNames`].

use std::collections::VecDeque;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::budget::SessionBudget;
use crate::config::Config;
use crate::media::{AltNames, DurationLookup};
use crate::playlist::{Command, EntryKind, Playlist, PlaylistEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Normal,
    Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub name: String,
    #[serde(rename = "timestamp", with = "time::serde::timestamp")]
    pub start: OffsetDateTime,
    /// Seconds, without inter-entry padding.
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
}

impl ScheduleEntry {
    pub fn end(&self) -> OffsetDateTime {
        self.start + Duration::seconds_f64(self.duration)
    }
}

/// Where playback is right now.
#[derive(Debug, Clone, Copy)]
pub struct CursorSnapshot {
    pub index: usize,
    /// Seconds already played of the entry at `index`.
    pub elapsed: f64,
    pub now: OffsetDateTime,
}

/// Session budget carried through the forward walk so that upcoming forced
/// and commanded restarts push later start times back.
#[derive(Debug, Clone)]
pub struct RestartProjection {
    pub ceiling: f64,
    /// Session age, in seconds, before `%RESTART` is honored.
    pub minimum: f64,
    pub accumulated: f64,
    pub entries_played: u32,
    /// Wall-clock start of the projected session.
    pub session_start: OffsetDateTime,
    /// Bumpers, their padding and the restart wait.
    pub overhead: f64,
    pub wait: f64,
}

impl RestartProjection {
    pub fn from_budget(
        budget: &SessionBudget,
        minimum: f64,
        overhead: f64,
        wait: f64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            ceiling: budget.ceiling(),
            minimum,
            accumulated: budget.accumulated(),
            entries_played: budget.entries_played(),
            session_start: now - Duration::seconds_f64(budget.session_age().as_secs_f64()),
            overhead,
            wait,
        }
    }

    fn before_entry(&mut self, at: OffsetDateTime, step: f64) -> f64 {
        if self.ceiling > 0.0 && self.entries_played > 0 && self.accumulated + step > self.ceiling {
            self.reset(at, self.overhead)
        } else {
            0.0
        }
    }

    fn after_entry(&mut self, step: f64) {
        self.accumulated += step;
        self.entries_played += 1;
    }

    /// Same rule the controller applies: wall-clock session age.
    fn commanded(&mut self, at: OffsetDateTime) -> f64 {
        if (at - self.session_start).as_seconds_f64() >= self.minimum {
            self.reset(at, self.overhead)
        } else {
            0.0
        }
    }

    fn instant(&mut self, at: OffsetDateTime) -> f64 {
        self.reset(at, self.wait)
    }

    /// Start a new projected session once `delay` has passed; returns `delay`.
    fn reset(&mut self, at: OffsetDateTime, delay: f64) -> f64 {
        self.accumulated = 0.0;
        self.entries_played = 0;
        self.session_start = at + Duration::seconds_f64(delay);
        delay
    }
}

/// An entry that went on air, with its playlist index.
#[derive(Debug, Clone, PartialEq)]
pub struct AiredEntry {
    pub index: usize,
    pub entry: ScheduleEntry,
}

/// Bounded record of what actually aired this run, oldest first.
#[derive(Debug, Clone)]
pub struct AiredLog {
    capacity: usize,
    items: VecDeque<AiredEntry>,
}

impl AiredLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, items: VecDeque::with_capacity(capacity) }
    }

    pub fn record(&mut self, index: usize, entry: ScheduleEntry) {
        if self.capacity == 0 {
            return;
        }
        self.items.push_back(AiredEntry { index, entry });
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<AiredEntry> {
        self.items.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ForwardLimits {
    pub min_videos: usize,
    pub max_videos: usize,
    pub upcoming_secs: f64,
    pub min_duration: f64,
    pub padding: f64,
    pub stop_at_end: bool,
    pub offset_secs: i64,
    pub restart: Option<RestartProjection>,
}

impl ForwardLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_videos: cfg.schedule.min_videos,
            max_videos: cfg.schedule.max_videos,
            upcoming_secs: (cfg.schedule.upcoming_minutes * 60) as f64,
            min_duration: cfg.schedule.min_duration as f64,
            padding: cfg.stream.video_padding as f64,
            stop_at_end: cfg.stream.stop_after_last_video,
            offset_secs: cfg.schedule.offset,
            restart: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackwardLimits {
    pub min_videos: usize,
    pub max_videos: usize,
    pub max_secs: f64,
    pub min_duration: f64,
    pub padding: f64,
    /// Tight allows one entry past `max_secs`; loose never crosses it.
    pub tight: bool,
    pub offset_secs: i64,
}

impl BackwardLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_videos: cfg.schedule.previous_min_videos,
            max_videos: cfg.schedule.previous_max_videos,
            max_secs: (cfg.schedule.previous_minutes * 60) as f64,
            min_duration: cfg.schedule.min_duration as f64,
            padding: cfg.stream.video_padding as f64,
            tight: cfg.schedule.previous_prune_tight,
            offset_secs: cfg.schedule.offset,
        }
    }
}

pub struct ScheduleGenerator<'a> {
    playlist: &'a Playlist,
    durations: &'a dyn DurationLookup,
    names: &'a AltNames,
}

impl<'a> ScheduleGenerator<'a> {
    pub fn new(playlist: &'a Playlist, durations: &'a dyn DurationLookup, names: &'a AltNames) -> Self {
        Self { playlist, durations, names }
    }

    /// Upcoming entries starting with the one under the cursor.
    pub fn forward(&self, cursor: &CursorSnapshot, limits: &ForwardLimits) -> Vec<ScheduleEntry> {
        let entries = self.playlist.entries();
        let len = entries.len();
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }

        let mut projection = limits.restart.clone();
        let mut t = cursor.now - Duration::seconds_f64(cursor.elapsed.max(0.0));
        let mut idx = if cursor.index < len { cursor.index } else { 0 };
        let mut cumulative = 0.0;
        let mut emitted = 0usize;
        let mut steps_since_emit = 0usize;
        let mut first = true;

        loop {
            if emitted >= limits.min_videos
                && (emitted >= limits.max_videos || cumulative >= limits.upcoming_secs)
            {
                break;
            }
            // A full pass without a single emission means nothing is schedulable.
            if steps_since_emit >= len {
                debug!("no schedulable entries in a full playlist pass");
                break;
            }
            steps_since_emit += 1;

            let entry = &entries[idx];
            match &entry.kind {
                EntryKind::Separator { extra_info } => out.push(ScheduleEntry {
                    kind: ItemKind::Extra,
                    name: String::new(),
                    start: t,
                    duration: 0.0,
                    extra_info: Some(extra_info.clone()),
                }),
                EntryKind::Command(Command::Stop) => break,
                EntryKind::Command(Command::Restart) => {
                    if let Some(p) = projection.as_mut() {
                        t += Duration::seconds_f64(p.commanded(t));
                    }
                }
                EntryKind::Command(Command::InstantRestart) => {
                    if let Some(p) = projection.as_mut() {
                        t += Duration::seconds_f64(p.instant(t));
                    }
                }
                EntryKind::Command(Command::Mail(_) | Command::Unknown(_)) => {}
                EntryKind::Playable { excluded_from_schedule, extra_info, .. } => {
                    if let Some(full) = self.lookup(entry) {
                        let step = full + limits.padding;
                        if !first {
                            if let Some(p) = projection.as_mut() {
                                t += Duration::seconds_f64(p.before_entry(t, step));
                            }
                        }
                        if *excluded_from_schedule || full < limits.min_duration {
                            debug!("line {}: kept off the schedule", entry.line);
                        } else {
                            out.push(ScheduleEntry {
                                kind: ItemKind::Normal,
                                name: self.display_name(entry),
                                start: t,
                                duration: full,
                                extra_info: extra_info.clone(),
                            });
                            emitted += 1;
                            steps_since_emit = 0;
                        }
                        let already_played = if first { cursor.elapsed.clamp(0.0, step) } else { 0.0 };
                        cumulative += step - already_played;
                        t += Duration::seconds_f64(step);
                        if let Some(p) = projection.as_mut() {
                            // Only the unplayed part of the current entry is still ahead.
                            p.after_entry(step - already_played);
                        }
                    }
                }
            }

            first = false;
            idx += 1;
            if idx >= len {
                if limits.stop_at_end {
                    break;
                }
                idx = 0;
            }
        }

        shift(&mut out, limits.offset_secs);
        out
    }

    /// Previously aired entries, most recent first.
    ///
    /// `aired` carries real start times and comes first. Past its oldest
    /// entry the walk continues backward through the playlist, wrapping as
    /// often as the limits ask for, with start times projected from there.
    pub fn backward(
        &self,
        cursor: &CursorSnapshot,
        aired: &[AiredEntry],
        limits: &BackwardLimits,
    ) -> Vec<ScheduleEntry> {
        let anchor = cursor.now - Duration::seconds_f64(cursor.elapsed.max(0.0));
        let mut out: Vec<ScheduleEntry> = Vec::new();
        // Seconds from the oldest kept start to the current entry's start.
        let mut reach = 0.0;

        for item in aired.iter().rev() {
            let age = (anchor - item.entry.start).as_seconds_f64();
            if !keep_previous(out.len(), reach, age, limits) {
                shift(&mut out, limits.offset_secs);
                return out;
            }
            out.push(item.entry.clone());
            reach = age;
        }

        let entries = self.playlist.entries();
        let len = entries.len();
        if len == 0 {
            shift(&mut out, limits.offset_secs);
            return out;
        }
        let (mut idx, mut end) = match aired.first() {
            Some(oldest) => (oldest.index.min(len - 1), oldest.entry.start),
            None => (if cursor.index < len { cursor.index } else { 0 }, anchor),
        };
        let mut steps_since_emit = 0usize;

        loop {
            // A full pass without a single emission means nothing is schedulable.
            if steps_since_emit >= len {
                debug!("no schedulable entries in a full backward pass");
                break;
            }
            steps_since_emit += 1;
            idx = (idx + len - 1) % len;

            let entry = &entries[idx];
            match &entry.kind {
                EntryKind::Command(Command::Stop) => break,
                EntryKind::Playable { excluded_from_schedule, extra_info, .. } => {
                    let Some(full) = self.lookup(entry) else { continue };
                    let start = end - Duration::seconds_f64(full + limits.padding);
                    end = start;
                    if *excluded_from_schedule || full < limits.min_duration {
                        continue;
                    }
                    let age = (anchor - start).as_seconds_f64();
                    if !keep_previous(out.len(), reach, age, limits) {
                        break;
                    }
                    out.push(ScheduleEntry {
                        kind: ItemKind::Normal,
                        name: self.display_name(entry),
                        start,
                        duration: full,
                        extra_info: extra_info.clone(),
                    });
                    reach = age;
                    steps_since_emit = 0;
                }
                _ => {}
            }
        }

        shift(&mut out, limits.offset_secs);
        out
    }

    fn lookup(&self, entry: &PlaylistEntry) -> Option<f64> {
        let EntryKind::Playable { path, .. } = &entry.kind else {
            return None;
        };
        match self.durations.duration(path) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("line {}: not adding to schedule: {e}", entry.line);
                None
            }
        }
    }

    fn display_name(&self, entry: &PlaylistEntry) -> String {
        entry.name().map(|n| self.names.display_name(&n)).unwrap_or_default()
    }
}

/// Whether one more previous entry, starting `age` seconds before the current
/// one, fits. `reach` is the age of the oldest entry kept so far.
fn keep_previous(count: usize, reach: f64, age: f64, limits: &BackwardLimits) -> bool {
    if count < limits.min_videos {
        return true;
    }
    if count >= limits.max_videos || reach >= limits.max_secs {
        return false;
    }
    limits.tight || age <= limits.max_secs
}

fn shift(items: &mut [ScheduleEntry], offset_secs: i64) {
    if offset_secs == 0 {
        return;
    }
    let offset = Duration::seconds(offset_secs);
    for item in items {
        item.start += offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::playlist::ParseOptions;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    struct Durations(HashMap<PathBuf, f64>);

    impl DurationLookup for Durations {
        fn duration(&self, path: &Path) -> Result<f64, MediaError> {
            self.0.get(path).copied().ok_or_else(|| MediaError::NotFound(path.to_path_buf()))
        }
    }

    fn fixture(text: &str, lengths: &[(&str, f64)]) -> (Playlist, Durations) {
        let opts = ParseOptions { base: PathBuf::from("/m"), exclude_patterns: vec!["bumpers/".into()] };
        let playlist = Playlist::parse(text, &opts).unwrap();
        let durations = lengths.iter().map(|(p, d)| (PathBuf::from("/m").join(p), *d)).collect();
        (playlist, Durations(durations))
    }

    fn limits(min: usize, max: usize, upcoming: f64) -> ForwardLimits {
        ForwardLimits {
            min_videos: min,
            max_videos: max,
            upcoming_secs: upcoming,
            min_duration: 0.0,
            padding: 0.0,
            stop_at_end: false,
            offset_secs: 0,
            restart: None,
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn wraps_and_stops_at_max_videos() {
        let (pl, d) = fixture("a.mp4\nb.mp4\n", &[("a.mp4", 10.0), ("b.mp4", 20.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 1, elapsed: 5.0, now: now() };
        let out = gen.forward(&cursor, &limits(1, 3, 1e9));
        let names: Vec<_> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["b", "a", "b"]);
        assert_eq!(out[0].start, now() - Duration::seconds(5));
        assert_eq!(out[1].start, now() + Duration::seconds(15));
    }

    #[test]
    fn min_floor_keeps_walking_past_upcoming_budget() {
        let (pl, d) = fixture("a.mp4\nb.mp4\nc.mp4\n", &[("a.mp4", 1000.0), ("b.mp4", 1000.0), ("c.mp4", 1.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        assert_eq!(gen.forward(&cursor, &limits(3, 10, 10.0)).len(), 3);
        assert_eq!(gen.forward(&cursor, &limits(1, 10, 10.0)).len(), 1);
    }

    #[test]
    fn stop_on_end_truncates_and_stop_command_ends_walk() {
        let (pl, d) = fixture("a.mp4\nb.mp4\n", &[("a.mp4", 10.0), ("b.mp4", 10.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 1, elapsed: 0.0, now: now() };
        let mut l = limits(1, 10, 1e9);
        l.stop_at_end = true;
        assert_eq!(gen.forward(&cursor, &l).len(), 1);

        let (pl, d) = fixture("a.mp4\n%STOP\nb.mp4\n", &[("a.mp4", 10.0), ("b.mp4", 10.0)]);
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        assert_eq!(gen.forward(&cursor, &limits(1, 10, 1e9)).len(), 1);
    }

    #[test]
    fn nothing_schedulable_terminates() {
        let (pl, d) = fixture("bumpers/x.mp4\n:note\n", &[("bumpers/x.mp4", 10.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        let out = gen.forward(&cursor, &limits(1, 10, 100.0));
        assert!(out.iter().all(|e| e.kind == ItemKind::Extra));
    }

    #[test]
    fn forced_restart_pushes_later_entries_back() {
        let (pl, d) = fixture("a.mp4\nb.mp4\n", &[("a.mp4", 600.0), ("b.mp4", 600.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        let mut l = limits(2, 2, 1e9);
        l.restart = Some(RestartProjection {
            ceiling: 1000.0,
            minimum: 0.0,
            accumulated: 0.0,
            entries_played: 0,
            session_start: now(),
            overhead: 40.0,
            wait: 10.0,
        });
        let out = gen.forward(&cursor, &l);
        assert_eq!(out[1].start, now() + Duration::seconds(640));
    }

    #[test]
    fn restart_command_projection_follows_session_age() {
        let (pl, d) = fixture("a.mp4\n%RESTART\nb.mp4\n", &[("a.mp4", 100.0), ("b.mp4", 100.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        let projection = |age: i64| RestartProjection {
            ceiling: 1e9,
            minimum: 300.0,
            accumulated: 0.0,
            entries_played: 0,
            session_start: now() - Duration::seconds(age),
            overhead: 40.0,
            wait: 10.0,
        };

        // Only 100s of runtime is projected, but the session has been up
        // long enough by the time the command is reached.
        let mut l = limits(2, 2, 1e9);
        l.restart = Some(projection(250));
        assert_eq!(gen.forward(&cursor, &l)[1].start, now() + Duration::seconds(140));

        l.restart = Some(projection(0));
        assert_eq!(gen.forward(&cursor, &l)[1].start, now() + Duration::seconds(100));
    }

    #[test]
    fn aired_log_keeps_the_newest_entries() {
        let entry = |name: &str| ScheduleEntry {
            kind: ItemKind::Normal,
            name: name.into(),
            start: now(),
            duration: 1.0,
            extra_info: None,
        };
        let mut log = AiredLog::new(2);
        log.record(0, entry("a"));
        log.record(1, entry("b"));
        log.record(2, entry("c"));
        let kept: Vec<_> = log.snapshot().into_iter().map(|a| (a.index, a.entry.name)).collect();
        assert_eq!(kept, [(1, "b".to_string()), (2, "c".to_string())]);

        let mut off = AiredLog::new(0);
        off.record(0, entry("a"));
        assert!(off.is_empty());
    }

    #[test]
    fn offset_shifts_every_timestamp() {
        let (pl, d) = fixture("a.mp4\nb.mp4\n", &[("a.mp4", 10.0), ("b.mp4", 10.0)]);
        let names = AltNames::default();
        let gen = ScheduleGenerator::new(&pl, &d, &names);
        let cursor = CursorSnapshot { index: 0, elapsed: 0.0, now: now() };
        let mut l = limits(2, 2, 1e9);
        l.offset_secs = -30;
        let out = gen.forward(&cursor, &l);
        assert_eq!(out[0].start, now() - Duration::seconds(30));
        assert_eq!(out[1].start, now() - Duration::seconds(20));
    }
}
