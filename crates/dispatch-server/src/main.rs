mod alert_engine;
mod api;
mod bridge;
mod config;
mod geocode;
mod grouper;
mod health;
mod hub;
mod linker;
mod state;
mod supervisor;
mod transcribe;
mod watchdog;

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispatch_protocol::dictionary::CorrectionDictionary;
use dispatch_protocol::live::ServerFrame;
use dispatch_protocol::postprocess::PostProcessor;
use dispatch_store::CallStore;

use crate::alert_engine::AlertEngine;
use crate::config::Config;
use crate::geocode::Geocoder;
use crate::health::{task_pulse, HealthCollector};
use crate::hub::LiveHub;
use crate::state::AppState;
use crate::supervisor::ScannerSupervisor;
use crate::transcribe::HttpSpeechToText;

/// Shutdown drains the segment queue for at most this long before
/// cancelling in-flight work.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "dispatch-server", about = "Real-time emergency-dispatch intelligence service")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/dispatch.toml")]
    config: std::path::PathBuf,

    /// HTTP + WebSocket listen address
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "DISPATCH_LISTEN")]
    listen: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config: Config = if args.config.exists() {
        let raw = tokio::fs::read_to_string(&args.config).await?;
        toml::from_str(&raw)?
    } else {
        warn!(path = %args.config.display(), "no config file found, using defaults");
        Config::default()
    };

    std::fs::create_dir_all(&config.storage.data_dir)?;
    std::fs::create_dir_all(config.storage.audio_dir())?;

    let store = Arc::new(CallStore::open(&config.storage.db_path())?);
    store.ensure_default_rules()?;
    info!(db = %config.storage.db_path().display(), "call store ready");

    let health = Arc::new(HealthCollector::new());
    let hub = LiveHub::new(config.live_hub.queue_capacity, Arc::clone(&health));
    let supervisor = Arc::new(ScannerSupervisor::new(
        &config.scanner,
        config.storage.pid_marker(),
        Arc::clone(&store),
        hub.clone(),
    ));
    let alerts = Arc::new(AlertEngine::new(
        Arc::clone(&store),
        hub.clone(),
        Arc::clone(&health),
        config.alerts.scan_interval_seconds,
    ));
    let geocoder = Arc::new(Geocoder::new(
        &config.geocoder,
        Arc::clone(&store),
        Arc::clone(&health),
    ));
    let post_processor = Arc::new(PostProcessor::new(
        CorrectionDictionary::with_overrides(&config.corrections),
        config.postprocess.reject_call_type_addresses,
    ));

    let (segment_tx, segment_rx) = mpsc::channel(config.transcription.queue_capacity.max(1));
    let audio_dir = config.storage.audio_dir();

    let state = AppState::new(
        config,
        Arc::clone(&store),
        hub.clone(),
        Arc::clone(&health),
        Arc::clone(&supervisor),
        Arc::clone(&alerts),
        post_processor,
        geocoder,
        segment_tx,
        audio_dir,
    );

    // Bring the scanner bridge up before anything consumes it. A missing
    // binary is an unrecoverable dependency failure at boot.
    if state.inner.config.scanner.binary_path.is_some() {
        if let Err(e) = supervisor.start().await {
            error!(error = %e, "scanner bridge failed to start");
            return Ok(ExitCode::from(2));
        }
    } else {
        warn!("scanner.binary_path not set; expecting an externally managed bridge");
    }

    let root_cancel = CancellationToken::new();
    // Intake stops first at shutdown so the queue can drain.
    let intake_cancel = root_cancel.child_token();

    let (supervisor_pulse, supervisor_monitor) = task_pulse("supervisor-health");
    let (bridge_pulse, bridge_monitor) = task_pulse("bridge-client");
    let (pool_pulse, pool_monitor) = task_pulse("transcription-pool");
    let (alerts_pulse, alerts_monitor) = task_pulse("alert-scan");
    let (sweep_pulse, sweep_monitor) = task_pulse("grouper-sweep");
    health.register_monitor(supervisor_monitor);
    health.register_monitor(bridge_monitor);
    health.register_monitor(pool_monitor);
    health.register_monitor(alerts_monitor);
    health.register_monitor(sweep_monitor);

    tokio::spawn(
        Arc::clone(&supervisor).run_health_loop(supervisor_pulse, root_cancel.child_token()),
    );
    tokio::spawn(bridge::run(
        state.clone(),
        bridge_pulse,
        intake_cancel.clone(),
    ));

    let engine = Arc::new(HttpSpeechToText::new(
        state.inner.config.transcription.provider.clone(),
        Duration::from_secs(state.inner.config.transcription.timeout_seconds),
    ));
    let pool_handle = tokio::spawn(transcribe::run_pool(
        state.clone(),
        engine,
        segment_rx,
        pool_pulse,
        root_cancel.child_token(),
    ));

    tokio::spawn(
        Arc::clone(&alerts).run_scan_loop(alerts_pulse, root_cancel.child_token()),
    );
    tokio::spawn(grouper::run_sweep(
        state.clone(),
        sweep_pulse,
        root_cancel.child_token(),
    ));
    tokio::spawn(watchdog::run(Arc::clone(&health)));
    tokio::spawn(push_periodic_frames(state.clone(), root_cancel.child_token()));

    let app = api::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "API + live hub listening");
    let server_cancel = root_cancel.child_token();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "http server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Stop intake, drain the queue up to the deadline, then cancel.
    intake_cancel.cancel();
    let drain_start = std::time::Instant::now();
    while state.inner.health.queue_depth.load(Ordering::Relaxed) > 0 {
        if drain_start.elapsed() >= SHUTDOWN_DRAIN_DEADLINE {
            warn!("drain deadline reached, cancelling in-flight work");
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    root_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), pool_handle).await;
    supervisor.stop().await;

    info!("shutdown complete");
    Ok(ExitCode::from(0))
}

/// Periodic `stats_update` (10 s) and `system_health` (30 s) pushes.
async fn push_periodic_frames(state: AppState, cancel: CancellationToken) {
    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));
    let mut health_interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = stats_interval.tick() => {
                let store = &state.inner.store;
                let stats = state.inner.health.stats_snapshot(
                    store.active_call_count().unwrap_or(0),
                    store.calls_today_count(chrono::Utc::now()).unwrap_or(0),
                    store.unread_alert_count().unwrap_or(0),
                    state.inner.hub.session_count(),
                );
                state.inner.hub.broadcast(&ServerFrame::StatsUpdate { stats });
            }
            _ = health_interval.tick() => {
                let supervisor = state.inner.supervisor.status().await;
                let health = state
                    .inner
                    .health
                    .health_snapshot(supervisor.running, supervisor.consecutive_failures);
                state.inner.hub.broadcast(&ServerFrame::SystemHealth { health });
            }
        }
    }
}
