use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loopcast_engine::alerts::AlertDispatcher;
use loopcast_engine::api::{self, AppState, SharedStatus, StatusSnapshot};
use loopcast_engine::config::Config;
use loopcast_engine::connectivity::{spawn_monitor, ConnectivityChecker, HttpProbe};
use loopcast_engine::controller::{ControllerDeps, PlaybackController, RunOutcome};
use loopcast_engine::history::PlayHistory;
use loopcast_engine::media::{AltNames, DurationLookup, FfprobeDurations};
use loopcast_engine::playlist::{ParseOptions, Playlist};
use loopcast_engine::publish::{SchedulePublisher, SharedSchedule};
use loopcast_engine::supervisor::FfmpegSupervisor;

#[derive(Parser, Debug)]
#[command(version, about = "Plays a playlist into a live stream and publishes its schedule")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "LOOPCAST_CONFIG", default_value = "loopcast.toml")]
    config: PathBuf,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref(), &cli.log_level))
        .init();

    let cfg = Config::load(&cli.config)?;
    info!("loopcast engine {} starting", env!("CARGO_PKG_VERSION"));

    let text = tokio::fs::read_to_string(&cfg.paths.playlist)
        .await
        .with_context(|| format!("reading playlist {}", cfg.paths.playlist.display()))?;
    let opts = ParseOptions {
        base: cfg.paths.base.clone(),
        exclude_patterns: cfg.schedule.exclude_patterns.clone(),
    };
    let playlist = Playlist::parse_lossy(&text, &opts);
    info!(
        "loaded {} playlist entries ({} playable) from {}",
        playlist.len(),
        playlist.playable_count(),
        cfg.paths.playlist.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let durations: Arc<dyn DurationLookup> = Arc::new(FfprobeDurations::new());
    let names = Arc::new(AltNames::load(cfg.paths.alt_names.as_deref()));
    let (alerts, alert_task) = AlertDispatcher::from_config(&cfg.alerts);
    let history = PlayHistory::new(cfg.paths.play_history.clone(), cfg.playback.history_length);

    let checker = ConnectivityChecker::new(
        cfg.connectivity.urls.clone(),
        cfg.connectivity.strict,
        cfg.check_timeout(),
        Arc::new(HttpProbe::new()),
    );
    let (link, monitor) = spawn_monitor(checker, cfg.check_interval(), shutdown_rx.clone());

    let status: SharedStatus = Arc::new(RwLock::new(StatusSnapshot::default()));
    let schedule: SharedSchedule = Arc::new(RwLock::new(None));
    let publisher = SchedulePublisher::new(
        cfg.paths.schedule.clone(),
        cfg.upload.clone(),
        durations.clone(),
        names.clone(),
        schedule.clone(),
    );

    let api_task = if cfg.api.bind.trim().is_empty() {
        None
    } else {
        let listener = tokio::net::TcpListener::bind(cfg.api.bind.trim())
            .await
            .with_context(|| format!("binding status API to {}", cfg.api.bind))?;
        let state = AppState { status: status.clone(), schedule };
        let mut stop = shutdown_rx.clone();
        Some(tokio::spawn(api::serve(listener, state, async move {
            let _ = stop.wait_for(|s| *s).await;
        })))
    };

    let deps = ControllerDeps {
        supervisor: Box::new(FfmpegSupervisor::new(&cfg)),
        durations,
        names,
        alerts: alerts.clone(),
        history,
        publisher: Some(publisher),
        link,
        shutdown: shutdown_rx,
        status,
    };
    let result = PlaybackController::new(cfg, playlist, deps).run().await;

    match &result {
        Ok(RunOutcome::Shutdown) => info!("shut down cleanly"),
        Ok(RunOutcome::StopCommand) => info!("stopped by playlist command"),
        Ok(RunOutcome::PlaylistEnd) => info!("playlist finished"),
        Err(e) => error!("engine terminated: {e}"),
    }

    monitor.abort();
    if let Some(task) = api_task {
        task.abort();
    }
    drop(alerts);
    if let Some(task) = alert_task {
        // Let queued alerts (including a fatal one) drain.
        if tokio::time::timeout(std::time::Duration::from_secs(15), task).await.is_err() {
            warn!("alert delivery did not finish in time");
        }
    }

    result.map(|_| ()).map_err(Into::into)
}

/// `RUST_LOG` wins when set; otherwise the `--log-level` directives apply.
fn log_filter(rust_log: Option<&str>, fallback: &str) -> EnvFilter {
    match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(fallback),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("unable to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
