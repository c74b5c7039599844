//! Schedule document generation, atomic write and optional upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::media::{AltNames, DurationLookup};
use crate::playlist::Playlist;
use crate::retry::{with_retry, RetryPolicy};
use crate::schedule::{AiredEntry, BackwardLimits, CursorSnapshot, ForwardLimits, ScheduleEntry, ScheduleGenerator};

pub type SharedSchedule = Arc<RwLock<Option<ScheduleDocument>>>;

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDocument {
    #[serde(with = "time::serde::rfc3339")]
    pub program_start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub video_start_time: OffsetDateTime,
    /// Seconds added to every timestamp below.
    pub offset_time: i64,
    pub coming_up_next: Vec<ScheduleEntry>,
    pub previous_files: Vec<ScheduleEntry>,
    pub script_version: String,
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub playlist: Arc<Playlist>,
    pub cursor: CursorSnapshot,
    pub forward: ForwardLimits,
    pub backward: BackwardLimits,
    /// What aired this run, oldest first.
    pub aired: Vec<AiredEntry>,
    pub program_start: OffsetDateTime,
}

pub fn build_document(
    req: &PublishRequest,
    durations: &dyn DurationLookup,
    names: &AltNames,
) -> ScheduleDocument {
    let generator = ScheduleGenerator::new(&req.playlist, durations, names);
    ScheduleDocument {
        program_start_time: req.program_start,
        video_start_time: req.cursor.now - time::Duration::seconds_f64(req.cursor.elapsed.max(0.0)),
        offset_time: req.forward.offset_secs,
        coming_up_next: generator.forward(&req.cursor, &req.forward),
        previous_files: generator.backward(&req.cursor, &req.aired, &req.backward),
        script_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub struct SchedulePublisher {
    path: Option<PathBuf>,
    upload: UploadConfig,
    durations: Arc<dyn DurationLookup>,
    names: Arc<AltNames>,
    latest: SharedSchedule,
    in_flight: Option<JoinHandle<()>>,
}

impl SchedulePublisher {
    pub fn new(
        path: Option<PathBuf>,
        upload: UploadConfig,
        durations: Arc<dyn DurationLookup>,
        names: Arc<AltNames>,
        latest: SharedSchedule,
    ) -> Self {
        Self { path, upload, durations, names, latest, in_flight: None }
    }

    /// Generate and publish in the background. An unfinished previous
    /// publish is aborted first.
    pub fn publish(&mut self, req: PublishRequest) {
        if let Some(prev) = self.in_flight.take() {
            if !prev.is_finished() {
                warn!("aborting schedule publish for the previous entry");
                prev.abort();
            }
        }

        let durations = self.durations.clone();
        let names = self.names.clone();
        let latest = self.latest.clone();
        let path = self.path.clone();
        let upload = self.upload.clone();

        self.in_flight = Some(tokio::spawn(async move {
            let doc = match tokio::task::spawn_blocking(move || build_document(&req, durations.as_ref(), &names)).await {
                Ok(doc) => doc,
                Err(e) => {
                    error!("schedule generation failed: {e}");
                    return;
                }
            };
            debug!(
                "schedule generated: {} upcoming, {} previous",
                doc.coming_up_next.len(),
                doc.previous_files.len()
            );

            let json = match serde_json::to_string_pretty(&doc) {
                Ok(j) => j,
                Err(e) => {
                    error!("schedule serialization failed: {e}");
                    return;
                }
            };
            *latest.write().await = Some(doc);

            let Some(path) = path else { return };
            if let Err(e) = write_atomic(&path, json.as_bytes()).await {
                error!("unable to write schedule to {}: {e:#}", path.display());
                return;
            }
            info!("schedule written to {}", path.display());

            if let Some(program) = upload.program.clone() {
                let policy = RetryPolicy::from_attempts(upload.attempts, Duration::from_secs(upload.delay));
                let result = with_retry(policy, "schedule upload", || run_upload(&program, &upload.args, &path)).await;
                match result {
                    Ok(()) => info!("schedule uploaded"),
                    Err(e) => error!("schedule upload failed: {e}"),
                }
            }
        }));
    }

    /// Wait for the in-flight publish, if any.
    pub async fn flush(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            let _ = handle.await;
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await.with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path).await.with_context(|| format!("renaming {}", tmp.display()))?;
    Ok(())
}

async fn run_upload(program: &str, args: &[String], file: &Path) -> anyhow::Result<()> {
    let file = file.to_string_lossy();
    let args: Vec<String> = args.iter().map(|a| a.replace("{file}", &file)).collect();
    let status = tokio::process::Command::new(program)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .with_context(|| format!("launching {program}"))?;
    if !status.success() {
        anyhow::bail!("{program} exited with {status}");
    }
    Ok(())
}
