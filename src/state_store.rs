//! Persisted playback cursor.
//!
//! The state file holds two lines: the playlist index and the elapsed seconds
//! inside that entry. Writes go through a temp file and a rename so a crash
//! mid-write never leaves a half-written cursor behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackState {
    pub index: usize,
    pub elapsed: f64,
}

pub struct StateStore {
    path: PathBuf,
    save_interval: Duration,
    last_persisted_at: Option<Instant>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, save_interval: Duration) -> Self {
        Self { path: path.into(), save_interval, last_persisted_at: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_persisted_at(&self) -> Option<Instant> {
        self.last_persisted_at
    }

    /// A missing file is a fresh start, not an error.
    pub fn load(&self) -> Result<PlaybackState, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PlaybackState::default()),
            Err(e) => return Err(e.into()),
        };
        parse_state(&text).map_err(|reason| StoreError::CorruptState { path: self.path.clone(), reason })
    }

    /// `load`, falling back to the default cursor on any failure.
    pub fn load_or_default(&self) -> PlaybackState {
        match self.load() {
            Ok(s) => s,
            Err(e) => {
                warn!("{e}; starting from the top of the playlist");
                PlaybackState::default()
            }
        }
    }

    /// Throttled save. Returns whether the file was written.
    pub fn save(&mut self, state: PlaybackState) -> Result<bool, StoreError> {
        if let Some(at) = self.last_persisted_at {
            if at.elapsed() < self.save_interval {
                return Ok(false);
            }
        }
        self.force_save(state)?;
        Ok(true)
    }

    pub fn force_save(&mut self, state: PlaybackState) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n{}\n", state.index, state.elapsed))?;
        std::fs::rename(&tmp, &self.path)?;
        self.last_persisted_at = Some(Instant::now());
        debug!("saved cursor {}@{:.1}s", state.index, state.elapsed);
        Ok(())
    }
}

fn parse_state(text: &str) -> Result<PlaybackState, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let index = lines
        .next()
        .ok_or("empty file")?
        .parse::<usize>()
        .map_err(|e| format!("bad index: {e}"))?;
    let elapsed = match lines.next() {
        Some(l) => l.parse::<f64>().map_err(|e| format!("bad elapsed time: {e}"))?,
        None => 0.0,
    };
    if !elapsed.is_finite() || elapsed < 0.0 {
        return Err(format!("bad elapsed time: {elapsed}"));
    }
    Ok(PlaybackState { index, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("play_index.txt"), Duration::from_secs(30));
        assert_eq!(store.load().unwrap(), PlaybackState::default());
    }

    #[test]
    fn corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("play_index.txt");
        std::fs::write(&path, "seven\n12\n").unwrap();
        let store = StateStore::new(&path, Duration::from_secs(30));
        assert!(matches!(store.load(), Err(StoreError::CorruptState { .. })));
        assert_eq!(store.load_or_default(), PlaybackState::default());
    }

    #[test]
    fn accepts_integer_and_float_elapsed() {
        assert_eq!(parse_state("4\n17\n").unwrap(), PlaybackState { index: 4, elapsed: 17.0 });
        assert_eq!(parse_state("4\n17.25").unwrap(), PlaybackState { index: 4, elapsed: 17.25 });
        assert_eq!(parse_state("9").unwrap(), PlaybackState { index: 9, elapsed: 0.0 });
        assert!(parse_state("1\n-3").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn saves_are_throttled_until_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("play_index.txt");
        let mut store = StateStore::new(&path, Duration::from_secs(30));

        assert!(store.save(PlaybackState { index: 1, elapsed: 5.0 }).unwrap());
        assert!(!store.save(PlaybackState { index: 1, elapsed: 10.0 }).unwrap());
        assert_eq!(store.load().unwrap().elapsed, 5.0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.save(PlaybackState { index: 2, elapsed: 0.5 }).unwrap());
        assert_eq!(store.load().unwrap(), PlaybackState { index: 2, elapsed: 0.5 });

        store.force_save(PlaybackState { index: 3, elapsed: 1.0 }).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3\n1\n");
    }
}
