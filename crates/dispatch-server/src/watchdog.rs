/// Watchdog task — monitors task liveness and process memory.
///
/// Runs every 30 s. Logs unresponsive tasks; never restarts them itself
/// (each task loop owns its own recovery).
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{info, warn};

use crate::health::HealthCollector;

/// A task that has not pulsed within this window is reported.
const TASK_LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(health: Arc<HealthCollector>) {
    info!("watchdog started");

    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
    );

    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);

    loop {
        interval.tick().await;

        sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        if let Some(process) = sys.process(pid) {
            let rss_mb = process.memory() as f32 / (1024.0 * 1024.0);
            health
                .memory_mb
                .store(u64::from(f32::to_bits(rss_mb)), Ordering::Relaxed);
        }

        let monitors = health.monitors.lock().unwrap();
        for monitor in monitors.iter() {
            if !monitor.is_alive(TASK_LIVENESS_TIMEOUT) {
                warn!(
                    task = %monitor.name,
                    last_pulse_ms = monitor.elapsed().as_millis() as u64,
                    "task appears unresponsive"
                );
            }
        }
    }
}
