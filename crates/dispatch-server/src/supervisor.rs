/// Scanner-bridge supervisor: exclusive owner of the bridge subprocess.
///
/// State machine: stopped → starting → running → (exited|degraded) →
/// (restarting | stopped). Health is probed every 10 s (PID liveness +
/// HTTP HEAD); three consecutive failures trigger a backoff restart, and
/// five failed restarts surface `restart-failed` and leave the bridge
/// stopped.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispatch_protocol::alert::AlertSeverity;
use dispatch_protocol::error::PipelineError;
use dispatch_store::CallStore;

use crate::alert_engine;
use crate::config::ScannerSection;
use crate::health::TaskPulse;
use crate::hub::LiveHub;

const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SOFT_STOP_GRACE: Duration = Duration::from_secs(3);
const FAILURES_BEFORE_RESTART: u32 = 3;
const MAX_RESTART_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const LOG_RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Restarting,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

struct Inner {
    child: Option<Child>,
    state: SupervisorState,
    consecutive_failures: u32,
    restart_attempts: u32,
    last_health_check: Option<DateTime<Utc>>,
}

pub struct ScannerSupervisor {
    binary_path: Option<PathBuf>,
    port: u16,
    pid_marker: PathBuf,
    store: Arc<CallStore>,
    hub: LiveHub,
    http: reqwest::Client,
    inner: TokioMutex<Inner>,
    log_ring: Arc<StdMutex<VecDeque<String>>>,
}

impl ScannerSupervisor {
    pub fn new(
        config: &ScannerSection,
        pid_marker: PathBuf,
        store: Arc<CallStore>,
        hub: LiveHub,
    ) -> Self {
        Self {
            binary_path: config.binary_path.clone(),
            port: config.listen_port,
            pid_marker,
            store,
            hub,
            http: reqwest::Client::builder()
                .timeout(HEALTH_PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            inner: TokioMutex::new(Inner {
                child: None,
                state: SupervisorState::Stopped,
                consecutive_failures: 0,
                restart_attempts: 0,
                last_health_check: None,
            }),
            log_ring: Arc::new(StdMutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY))),
        }
    }

    /// Idempotent start. Fails when the binary is missing (fatal per the
    /// failure policy).
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().await;
        if inner.child.is_some() {
            return Ok(());
        }

        let Some(binary) = self.binary_path.as_ref() else {
            return Err(PipelineError::Dependency(
                "scanner.binary_path not configured".into(),
            ));
        };
        if !binary.exists() {
            return Err(PipelineError::Dependency(format!(
                "scanner binary missing: {}",
                binary.display()
            )));
        }

        self.transition(&mut inner, SupervisorState::Starting);
        self.remove_stale_marker();

        let spawned = Command::new(binary)
            .arg("--listen-port")
            .arg(self.port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.transition(&mut inner, SupervisorState::Stopped);
                return Err(if e.kind() == std::io::ErrorKind::AddrInUse {
                    PipelineError::Dependency(format!("scanner port in use: {e}"))
                } else {
                    PipelineError::Dependency(format!("failed to spawn scanner bridge: {e}"))
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_child_output(stdout, Arc::clone(&self.log_ring), "out"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_child_output(stderr, Arc::clone(&self.log_ring), "err"));
        }

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = std::fs::write(&self.pid_marker, pid.to_string()) {
                warn!(error = %e, "failed to write scanner PID marker");
            }
        }

        inner.child = Some(child);
        self.transition(&mut inner, SupervisorState::Running);
        info!(pid = ?pid, port = self.port, "scanner bridge started");
        Ok(())
    }

    /// Graceful stop: soft signal, wait up to 3 s, then hard kill.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            self.transition(&mut inner, SupervisorState::Stopped);
            return;
        };

        if let Some(pid) = child.id() {
            let _ = std::process::Command::new("kill")
                .arg(pid.to_string())
                .status();
        }
        match tokio::time::timeout(SOFT_STOP_GRACE, child.wait()).await {
            Ok(_) => info!("scanner bridge stopped gracefully"),
            Err(_) => {
                warn!("scanner bridge ignored soft stop, killing");
                let _ = child.kill().await;
            }
        }

        let _ = std::fs::remove_file(&self.pid_marker);
        self.transition(&mut inner, SupervisorState::Stopped);
    }

    /// Hard kill, clear the marker, reset counters, start fresh. Also the
    /// entry point for proxy-level connection failures, which reset the
    /// backoff state.
    pub async fn force_restart(&self) -> Result<(), PipelineError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(mut child) = inner.child.take() {
                let _ = child.kill().await;
            }
            let _ = std::fs::remove_file(&self.pid_marker);
            inner.consecutive_failures = 0;
            inner.restart_attempts = 0;
            self.transition(&mut inner, SupervisorState::Restarting);
        }
        self.start().await
    }

    pub async fn status(&self) -> SupervisorStatus {
        let mut inner = self.inner.lock().await;
        let pid = inner.child.as_ref().and_then(|c| c.id());
        SupervisorStatus {
            state: inner.state,
            running: matches!(
                inner.state,
                SupervisorState::Running | SupervisorState::Degraded
            ),
            pid,
            port: self.port,
            consecutive_failures: inner.consecutive_failures,
            restart_attempts: inner.restart_attempts,
            last_health_check: inner.last_health_check,
        }
    }

    pub fn recent_log(&self, limit: usize) -> Vec<String> {
        let ring = self.log_ring.lock().unwrap();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    /// 10-second health loop: PID liveness plus an HTTP HEAD probe.
    pub async fn run_health_loop(self: Arc<Self>, pulse: TaskPulse, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
            pulse.tick();

            let (state, process_alive) = {
                let mut inner = self.inner.lock().await;
                let alive = match inner.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            warn!(exit = ?status.code(), "scanner bridge exited");
                            inner.child = None;
                            false
                        }
                        Ok(None) => true,
                        Err(e) => {
                            error!(error = %e, "failed to poll scanner bridge");
                            false
                        }
                    },
                    None => false,
                };
                (inner.state, alive)
            };

            if state == SupervisorState::Stopped {
                continue;
            }

            let probe_ok = process_alive && self.probe().await;

            let needs_restart = {
                let mut inner = self.inner.lock().await;
                inner.last_health_check = Some(Utc::now());
                if probe_ok {
                    inner.consecutive_failures = 0;
                    inner.restart_attempts = 0;
                    self.transition(&mut inner, SupervisorState::Running);
                    false
                } else {
                    inner.consecutive_failures += 1;
                    if process_alive {
                        self.transition(&mut inner, SupervisorState::Degraded);
                    }
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        process_alive, "scanner health check failed"
                    );
                    inner.consecutive_failures >= FAILURES_BEFORE_RESTART || !process_alive
                }
            };

            if needs_restart {
                self.restart_with_backoff(&cancel).await;
            }
        }
    }

    async fn probe(&self) -> bool {
        let url = format!("http://127.0.0.1:{}/", self.port);
        matches!(self.http.head(&url).send().await, Ok(resp) if !resp.status().is_server_error())
    }

    async fn restart_with_backoff(&self, cancel: &CancellationToken) {
        let attempts = {
            let mut inner = self.inner.lock().await;
            if let Some(mut child) = inner.child.take() {
                let _ = child.kill().await;
            }
            let _ = std::fs::remove_file(&self.pid_marker);
            inner.restart_attempts += 1;

            if inner.restart_attempts > MAX_RESTART_ATTEMPTS {
                self.transition(&mut inner, SupervisorState::Stopped);
                error!(
                    attempts = inner.restart_attempts - 1,
                    "scanner bridge restart budget exhausted"
                );
                alert_engine::fire_system_alert(
                    &self.store,
                    &self.hub,
                    AlertSeverity::Critical,
                    "restart-failed",
                    "Scanner bridge could not be restarted; supervision halted",
                );
                return;
            }
            self.transition(&mut inner, SupervisorState::Restarting);
            inner.restart_attempts
        };

        let backoff = BACKOFF_BASE
            .saturating_mul(1u32 << (attempts - 1).min(8))
            .min(BACKOFF_CAP);
        info!(attempt = attempts, backoff_ms = backoff.as_millis() as u64, "restarting scanner bridge");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return,
        }

        if let Err(e) = self.start().await {
            error!(error = %e, "scanner bridge restart failed");
        } else {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures = 0;
        }
    }

    fn transition(&self, inner: &mut Inner, next: SupervisorState) {
        if inner.state != next {
            info!(from = ?inner.state, to = ?next, "scanner supervisor state change");
            inner.state = next;
        }
    }

    fn remove_stale_marker(&self) {
        if self.pid_marker.exists() {
            let _ = std::fs::remove_file(&self.pid_marker);
        }
    }
}

async fn pump_child_output<R>(
    reader: R,
    ring: Arc<StdMutex<VecDeque<String>>>,
    stream: &'static str,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut ring = ring.lock().unwrap();
        if ring.len() >= LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(format!("[{stream}] {line}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(binary: Option<PathBuf>) -> ScannerSupervisor {
        let dir = std::env::temp_dir().join(format!("sup-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let config = ScannerSection {
            binary_path: binary,
            listen_port: 3140,
            systems: vec![],
            talkgroups: vec![],
        };
        ScannerSupervisor::new(
            &config,
            dir.join("scanner.pid"),
            store,
            LiveHub::new(8, Arc::new(crate::health::HealthCollector::new())),
        )
    }

    #[tokio::test]
    async fn test_start_without_binary_is_fatal() {
        let sup = supervisor(None);
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, PipelineError::Dependency(_)));
        assert_eq!(sup.status().await.state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_is_fatal() {
        let sup = supervisor(Some(PathBuf::from("/nonexistent/bridge-bin")));
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, PipelineError::Dependency(_)));
    }

    #[tokio::test]
    async fn test_status_reports_stopped_initially() {
        let sup = supervisor(None);
        let status = sup.status().await;
        assert!(!status.running);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.pid.is_none());
    }
}
