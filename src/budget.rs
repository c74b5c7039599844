//! Session runtime budget.
//!
//! Tracks on-air time since the last stream (re)start and decides when the
//! next entry would push the session past the configured ceiling.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SessionBudget {
    /// Seconds; zero disables forced restarts.
    ceiling: f64,
    accumulated: f64,
    started_at: Instant,
    entries_played: u32,
    restart_pending: bool,
}

impl SessionBudget {
    pub fn new(ceiling_secs: f64) -> Self {
        Self {
            ceiling: ceiling_secs.max(0.0),
            accumulated: 0.0,
            started_at: Instant::now(),
            entries_played: 0,
            restart_pending: false,
        }
    }

    /// True when playing `next_secs` more would exceed the ceiling. Never true
    /// before an entry has been recorded this session.
    pub fn should_restart_before(&self, next_secs: f64) -> bool {
        self.ceiling > 0.0 && self.entries_played > 0 && self.accumulated + next_secs > self.ceiling
    }

    /// Record a completed (or interrupted) run of a playlist entry.
    pub fn record_elapsed(&mut self, secs: f64) {
        self.accumulated += secs.max(0.0);
        self.entries_played += 1;
    }

    /// Bumpers count toward the runtime but not toward the played entries.
    pub fn record_bumper(&mut self, secs: f64) {
        self.accumulated += secs.max(0.0);
    }

    /// Add runtime without marking an entry as played, e.g. a failed encode.
    pub fn record_partial(&mut self, secs: f64) {
        self.accumulated += secs.max(0.0);
    }

    pub fn reset(&mut self) {
        self.accumulated = 0.0;
        self.entries_played = 0;
        self.started_at = Instant::now();
        self.restart_pending = false;
    }

    pub fn mark_restart_pending(&mut self) {
        self.restart_pending = true;
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn accumulated(&self) -> f64 {
        self.accumulated
    }

    pub fn entries_played(&self) -> u32 {
        self.entries_played
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Seconds left before the ceiling, or `None` when unlimited.
    pub fn remaining(&self) -> Option<f64> {
        (self.ceiling > 0.0).then(|| (self.ceiling - self.accumulated).max(0.0))
    }

    pub fn session_age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_always_plays() {
        let budget = SessionBudget::new(10.0);
        assert!(!budget.should_restart_before(10_000.0));
    }

    #[test]
    fn ceiling_exceeded_after_first_entry() {
        let mut budget = SessionBudget::new(1000.0);
        budget.record_elapsed(950.0);
        assert!(budget.should_restart_before(100.0));
        assert!(!budget.should_restart_before(50.0));

        budget.reset();
        assert_eq!(budget.accumulated(), 0.0);
        assert!(!budget.should_restart_before(100.0));
    }

    #[test]
    fn zero_ceiling_never_restarts() {
        let mut budget = SessionBudget::new(0.0);
        budget.record_elapsed(1e9);
        assert!(!budget.should_restart_before(1e9));
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn bumpers_count_runtime_but_not_entries() {
        let mut budget = SessionBudget::new(100.0);
        budget.record_bumper(150.0);
        assert_eq!(budget.entries_played(), 0);
        assert!(!budget.should_restart_before(1.0));
        budget.record_elapsed(0.0);
        assert!(budget.should_restart_before(1.0));
        assert_eq!(budget.remaining(), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn session_age_tracks_reset() {
        let mut budget = SessionBudget::new(0.0);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(budget.session_age(), Duration::from_secs(600));
        budget.mark_restart_pending();
        budget.reset();
        assert!(!budget.restart_pending());
        assert_eq!(budget.session_age(), Duration::ZERO);
    }
}
