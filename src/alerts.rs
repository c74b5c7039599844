//! Fire-and-forget operator alerts.
//!
//! The controller pushes [`Alert`]s onto a bounded queue; a background task
//! rate-limits them per kind and hands them to every configured sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AlertsConfig;

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StreamDown,
    StreamResume,
    StreamRestart,
    FileNotFound,
    PlaylistLoop,
    PlaylistStop,
    PlaylistEnd,
    MailCommand,
    ProgramError,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Playlist line the alert refers to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip)]
    pub bypass_interval: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

impl Alert {
    pub fn new(kind: AlertKind) -> Self {
        Self {
            kind,
            message: None,
            line: None,
            bypass_interval: matches!(
                kind,
                AlertKind::MailCommand | AlertKind::StreamDown | AlertKind::StreamResume
            ),
            raised_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Structured log line per alert.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!(
            kind = ?alert.kind,
            line = ?alert.line,
            "alert: {}",
            alert.message.as_deref().unwrap_or("")
        );
        Ok(())
    }
}

/// POSTs each alert as JSON.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client.post(&self.url).json(alert).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Per-kind minimum spacing between deliveries.
pub struct RateLimiter {
    interval: Duration,
    last_sent: HashMap<AlertKind, Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_sent: HashMap::new() }
    }

    pub fn allow(&mut self, alert: &Alert) -> bool {
        let now = Instant::now();
        if !alert.bypass_interval {
            if let Some(at) = self.last_sent.get(&alert.kind) {
                if now.duration_since(*at) < self.interval {
                    return false;
                }
            }
        }
        self.last_sent.insert(alert.kind, now);
        true
    }
}

#[derive(Clone)]
pub struct AlertDispatcher {
    tx: Option<mpsc::Sender<Alert>>,
    cfg: Arc<AlertsConfig>,
}

impl AlertDispatcher {
    /// Dispatcher that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None, cfg: Arc::new(AlertsConfig::default()) }
    }

    pub fn spawn(cfg: &AlertsConfig, sinks: Vec<Arc<dyn AlertSink>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Alert>(QUEUE_DEPTH);
        let mut limiter = RateLimiter::new(Duration::from_secs(cfg.rate_limit));
        let handle = tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if !limiter.allow(&alert) {
                    debug!("alert {:?} suppressed by rate limit", alert.kind);
                    continue;
                }
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&alert).await {
                        error!("alert delivery failed: {e:#}");
                    }
                }
            }
            debug!("alert dispatcher stopped");
        });
        (Self { tx: Some(tx), cfg: Arc::new(cfg.clone()) }, handle)
    }

    pub fn from_config(cfg: &AlertsConfig) -> (Self, Option<JoinHandle<()>>) {
        if !cfg.enabled {
            return (Self::disabled(), None);
        }
        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if let Some(url) = cfg.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            match WebhookSink::new(url) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(e) => error!("alert webhook disabled: {e:#}"),
            }
        }
        info!("alerts enabled ({} sink(s))", sinks.len());
        let (dispatcher, handle) = Self::spawn(cfg, sinks);
        (dispatcher, Some(handle))
    }

    pub fn wants(&self, kind: AlertKind) -> bool {
        let c = &self.cfg;
        self.tx.is_some()
            && match kind {
                AlertKind::StreamDown => c.on_stream_down,
                AlertKind::StreamResume => c.on_stream_resume,
                AlertKind::StreamRestart => c.on_stream_restart,
                AlertKind::FileNotFound => c.on_file_not_found,
                AlertKind::PlaylistLoop => c.on_playlist_loop,
                AlertKind::PlaylistStop => c.on_playlist_stop,
                AlertKind::PlaylistEnd => c.on_playlist_end,
                AlertKind::MailCommand => c.on_command,
                AlertKind::ProgramError => c.on_program_error,
            }
    }

    /// Never blocks; a full queue drops the alert.
    pub fn send(&self, alert: Alert) {
        if !self.wants(alert.kind) {
            return;
        }
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(alert) {
                warn!("alert queue unavailable, dropping alert: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AlertKind>>);

    #[async_trait]
    impl AlertSink for Collect {
        async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(alert.kind);
            Ok(())
        }
    }

    fn enabled() -> AlertsConfig {
        AlertsConfig { enabled: true, on_playlist_loop: false, ..AlertsConfig::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_applies_per_kind_unless_bypassed() {
        let sink = Arc::new(Collect::default());
        let (dispatcher, handle) = AlertDispatcher::spawn(&enabled(), vec![sink.clone() as Arc<dyn AlertSink>]);

        dispatcher.send(Alert::new(AlertKind::FileNotFound).message("a.mp4"));
        dispatcher.send(Alert::new(AlertKind::FileNotFound).message("b.mp4"));
        dispatcher.send(Alert::new(AlertKind::MailCommand));
        dispatcher.send(Alert::new(AlertKind::MailCommand));
        dispatcher.send(Alert::new(AlertKind::PlaylistLoop));
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![AlertKind::FileNotFound, AlertKind::MailCommand, AlertKind::MailCommand]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_reopens_after_interval() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3600));
        let alert = Alert::new(AlertKind::ProgramError);
        assert!(limiter.allow(&alert));
        assert!(!limiter.allow(&alert));
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(limiter.allow(&alert));
    }

    #[test]
    fn disabled_dispatcher_wants_nothing() {
        let d = AlertDispatcher::disabled();
        assert!(!d.wants(AlertKind::ProgramError));
        d.send(Alert::new(AlertKind::ProgramError));
    }
}
