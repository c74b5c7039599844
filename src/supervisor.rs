//! External encoder and relay processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{Config, StreamConfig};
use crate::error::SupervisorError;

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub path: PathBuf,
    pub skip_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderExit {
    Finished,
    Failed(Option<i32>),
    /// The relay died while the encoder was running; the encoder is killed.
    RelayExited(Option<i32>),
}

/// Drives the processes behind one logical stream. At most one encoder and
/// one relay exist at a time.
#[async_trait]
pub trait StreamSupervisor: Send {
    async fn start_relay(&mut self) -> Result<(), SupervisorError>;
    async fn stop_relay(&mut self);
    async fn start_encoder(&mut self, req: &EncodeRequest) -> Result<(), SupervisorError>;
    /// Resolves when the encoder exits. Cancel-safe; pends while no encoder
    /// is running.
    async fn wait_encoder(&mut self) -> EncoderExit;
    async fn stop_encoder(&mut self);
}

pub struct FfmpegSupervisor {
    stream: StreamConfig,
    encoder_log: Option<PathBuf>,
    relay_log: Option<PathBuf>,
    encoder: Option<Child>,
    relay: Option<Child>,
}

impl FfmpegSupervisor {
    pub fn new(cfg: &Config) -> Self {
        let mut stream = cfg.stream.clone();
        if let Ok(ffmpeg) = std::env::var("LOOPCAST_FFMPEG") {
            if stream.encoder_program == "ffmpeg" {
                stream.encoder_program = ffmpeg.clone();
            }
            if stream.relay_program == "ffmpeg" {
                stream.relay_program = ffmpeg;
            }
        }
        Self {
            stream,
            encoder_log: cfg.paths.encoder_log.clone(),
            relay_log: cfg.paths.relay_log.clone(),
            encoder: None,
            relay: None,
        }
    }

    fn spawn(&self, program: &str, args: &[String], log: Option<&Path>, tag: &'static str) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        match log {
            Some(path) => {
                let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                let err = file.try_clone()?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::piped());
            }
        }

        info!("launching {tag}: {program} {}", redact_args(args).join(" "));
        let mut child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Spawn { program: program.to_string(), source })?;

        if let Some(stderr) = child.stderr.take() {
            let secrets = stream_keys(args);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let sanitized = sanitize_line(&line, &secrets);
                    if !sanitized.trim().is_empty() {
                        debug!("{tag}: {sanitized}");
                    }
                }
            });
        }
        Ok(child)
    }
}

#[async_trait]
impl StreamSupervisor for FfmpegSupervisor {
    async fn start_relay(&mut self) -> Result<(), SupervisorError> {
        self.stop_relay().await;
        let child = self.spawn(&self.stream.relay_program, &self.stream.relay_args, self.relay_log.as_deref(), "relay")?;
        self.relay = Some(child);
        Ok(())
    }

    async fn stop_relay(&mut self) {
        if let Some(mut child) = self.relay.take() {
            let _ = child.kill().await;
            info!("relay process stopped");
        }
    }

    async fn start_encoder(&mut self, req: &EncodeRequest) -> Result<(), SupervisorError> {
        self.stop_encoder().await;
        let args = substitute(&self.stream.encoder_args, req, self.stream.video_padding);
        let child = self.spawn(&self.stream.encoder_program, &args, self.encoder_log.as_deref(), "encoder")?;
        self.encoder = Some(child);
        Ok(())
    }

    async fn wait_encoder(&mut self) -> EncoderExit {
        let Some(encoder) = self.encoder.as_mut() else {
            return std::future::pending().await;
        };

        let exit = match self.relay.as_mut() {
            Some(relay) => tokio::select! {
                status = encoder.wait() => match status {
                    Ok(s) if s.success() => EncoderExit::Finished,
                    Ok(s) => EncoderExit::Failed(s.code()),
                    Err(e) => {
                        warn!("waiting on encoder failed: {e}");
                        EncoderExit::Failed(None)
                    }
                },
                status = relay.wait() => EncoderExit::RelayExited(status.ok().and_then(|s| s.code())),
            },
            None => match encoder.wait().await {
                Ok(s) if s.success() => EncoderExit::Finished,
                Ok(s) => EncoderExit::Failed(s.code()),
                Err(e) => {
                    warn!("waiting on encoder failed: {e}");
                    EncoderExit::Failed(None)
                }
            },
        };

        match exit {
            EncoderExit::RelayExited(_) => {
                self.relay = None;
                self.stop_encoder().await;
            }
            _ => self.encoder = None,
        }
        exit
    }

    async fn stop_encoder(&mut self) {
        if let Some(mut child) = self.encoder.take() {
            let _ = child.kill().await;
            debug!("encoder process stopped");
        }
    }
}

/// Fill `{file}`, `{skip_time}` and `{video_padding}` placeholders.
pub fn substitute(args: &[String], req: &EncodeRequest, padding: u64) -> Vec<String> {
    let file = req.path.to_string_lossy();
    let skip = format!("{:.3}", req.skip_seconds.max(0.0));
    let padding = padding.to_string();
    args.iter()
        .map(|a| {
            a.replace("{file}", &file)
                .replace("{skip_time}", &skip)
                .replace("{video_padding}", &padding)
        })
        .collect()
}

/// The last path segment of every URL argument is treated as a stream key.
fn stream_keys(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|a| a.contains("://"))
        .filter_map(|a| {
            let (_, rest) = a.split_once("://")?;
            let (_, key) = rest.rsplit_once('/')?;
            (!key.is_empty()).then(|| key.to_string())
        })
        .collect()
}

fn redact_args(args: &[String]) -> Vec<String> {
    let keys = stream_keys(args);
    args.iter().map(|a| sanitize_line(a, &keys)).collect()
}

fn sanitize_line(line: &str, secrets: &[String]) -> String {
    let mut s = line.to_string();
    for secret in secrets {
        s = s.replace(secret.as_str(), "****");
    }
    s
}
