//! Periodic reachability checks.
//!
//! The monitor runs as its own task and publishes the latest [`LinkStatus`]
//! on a `watch` channel. The playback controller only ever reads it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Re-check cadence while the link is down.
const DOWN_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Failed(String),
    TimedOut,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// Any HTTP response counts as reachable; only transport errors fail.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(_) => ProbeOutcome::Reachable,
            Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Reachable,
    Unreachable { timed_out: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Unknown,
    Up,
    Down {
        timed_out: bool,
    },
}

impl LinkStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkStatus::Up)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, LinkStatus::Down { .. })
    }
}

pub struct ConnectivityChecker {
    urls: Vec<String>,
    strict: bool,
    timeout: Duration,
    probe: Arc<dyn Probe>,
}

impl ConnectivityChecker {
    pub fn new(urls: Vec<String>, strict: bool, timeout: Duration, probe: Arc<dyn Probe>) -> Self {
        Self { urls, strict, timeout, probe }
    }

    pub fn is_enabled(&self) -> bool {
        !self.urls.is_empty()
    }

    /// One check cycle over the configured URLs in random order.
    ///
    /// Strict mode probes every URL and fails on the first failure. Lenient
    /// mode succeeds on the first reachable URL and fails only when none is.
    pub async fn check(&self) -> CheckResult {
        if self.urls.is_empty() {
            return CheckResult::Reachable;
        }
        let mut order: Vec<&str> = self.urls.iter().map(String::as_str).collect();
        fastrand::shuffle(&mut order);

        let mut any_timed_out = false;
        for url in order {
            match self.probe.probe(url, self.timeout).await {
                ProbeOutcome::Reachable => {
                    debug!("connection to {url} succeeded");
                    if !self.strict {
                        return CheckResult::Reachable;
                    }
                }
                ProbeOutcome::TimedOut => {
                    warn!("connection to {url} timed out after {:?}", self.timeout);
                    if self.strict {
                        return CheckResult::Unreachable { timed_out: true };
                    }
                    any_timed_out = true;
                }
                ProbeOutcome::Failed(e) => {
                    warn!("could not establish connection to {url}: {e}");
                    if self.strict {
                        return CheckResult::Unreachable { timed_out: false };
                    }
                }
            }
        }
        if self.strict {
            CheckResult::Reachable
        } else {
            CheckResult::Unreachable { timed_out: any_timed_out }
        }
    }
}

/// Spawn the periodic monitor. With no URLs configured the link is reported
/// up once and no task loop runs.
pub fn spawn_monitor(
    checker: ConnectivityChecker,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<LinkStatus>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(LinkStatus::Unknown);
    if !checker.is_enabled() {
        tx.send_replace(LinkStatus::Up);
        let handle = tokio::spawn(async move {
            // Keep the sender alive so receivers never observe a closed channel.
            let _ = shutdown.wait_for(|stop| *stop).await;
            drop(tx);
        });
        return (rx, handle);
    }

    let handle = tokio::spawn(async move {
        loop {
            let status = match checker.check().await {
                CheckResult::Reachable => LinkStatus::Up,
                CheckResult::Unreachable { timed_out } => LinkStatus::Down { timed_out },
            };
            let changed = tx.send_if_modified(|current| {
                if *current != status {
                    *current = status;
                    true
                } else {
                    false
                }
            });
            if changed {
                match status {
                    LinkStatus::Up => info!("connectivity check succeeded"),
                    LinkStatus::Down { timed_out } => {
                        warn!("connectivity check failed (timed out: {timed_out})")
                    }
                    LinkStatus::Unknown => {}
                }
            }

            let wait = if status.is_down() { interval.min(DOWN_RECHECK) } else { interval };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("connectivity monitor stopped");
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeProbe {
        outcomes: Mutex<HashMap<String, ProbeOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(outcomes: &[(&str, ProbeOutcome)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().map(|(u, o)| (u.to_string(), o.clone())).collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, url: &str, outcome: ProbeOutcome) {
            self.outcomes.lock().unwrap().insert(url.to_string(), outcome);
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
            self.calls.lock().unwrap().push(url.to_string());
            self.outcomes.lock().unwrap().get(url).cloned().unwrap_or(ProbeOutcome::Reachable)
        }
    }

    fn urls() -> Vec<String> {
        vec!["https://a".into(), "https://b".into(), "https://c".into()]
    }

    #[tokio::test]
    async fn strict_fails_when_any_url_times_out() {
        let probe = FakeProbe::new(&[("https://b", ProbeOutcome::TimedOut)]);
        let checker = ConnectivityChecker::new(urls(), true, Duration::from_secs(5), probe.clone());
        for _ in 0..10 {
            assert_eq!(checker.check().await, CheckResult::Unreachable { timed_out: true });
        }
    }

    #[tokio::test]
    async fn lenient_succeeds_on_any_reachable_url() {
        let probe = FakeProbe::new(&[
            ("https://a", ProbeOutcome::TimedOut),
            ("https://b", ProbeOutcome::Failed("refused".into())),
        ]);
        let checker = ConnectivityChecker::new(urls(), false, Duration::from_secs(5), probe.clone());
        assert_eq!(checker.check().await, CheckResult::Reachable);

        probe.set("https://c", ProbeOutcome::Failed("refused".into()));
        assert_eq!(checker.check().await, CheckResult::Unreachable { timed_out: true });
        assert_eq!(probe.calls.lock().unwrap().iter().filter(|u| u.as_str() == "https://c").count(), 2);
    }

    #[tokio::test]
    async fn no_urls_is_always_reachable() {
        let checker = ConnectivityChecker::new(Vec::new(), true, Duration::from_secs(5), FakeProbe::new(&[]));
        assert_eq!(checker.check().await, CheckResult::Reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_transitions_and_keeps_checking() {
        let probe = FakeProbe::new(&[]);
        let checker = ConnectivityChecker::new(urls(), true, Duration::from_secs(5), probe.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (mut status, handle) = spawn_monitor(checker, Duration::from_secs(60), stop_rx);

        status.wait_for(|s| s.is_up()).await.unwrap();

        probe.set("https://a", ProbeOutcome::Failed("unreachable".into()));
        status.wait_for(|s| s.is_down()).await.unwrap();
        assert_eq!(*status.borrow(), LinkStatus::Down { timed_out: false });

        probe.set("https://a", ProbeOutcome::Reachable);
        status.wait_for(|s| s.is_up()).await.unwrap();

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
