/// Health collector: task liveness pulses plus the atomic counters
/// surfaced in `stats_update` frames and `/api/stats`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::watch;

use dispatch_protocol::live::{StatsSnapshot, SystemHealthSnapshot};

// ── Task pulse / monitor ────────────────────────────────────────────────

/// Sending half — held by the monitored task. Call `tick()` on every
/// loop iteration.
#[derive(Clone)]
pub struct TaskPulse {
    tx: watch::Sender<Instant>,
}

impl TaskPulse {
    pub fn tick(&self) {
        let _ = self.tx.send(Instant::now());
    }
}

/// Receiving half — held by the watchdog.
pub struct TaskMonitor {
    pub name: String,
    rx: watch::Receiver<Instant>,
}

impl TaskMonitor {
    pub fn elapsed(&self) -> std::time::Duration {
        self.rx.borrow().elapsed()
    }

    pub fn is_alive(&self, timeout: std::time::Duration) -> bool {
        self.elapsed() < timeout
    }
}

/// Create a matched pulse/monitor pair for a named task.
pub fn task_pulse(name: impl Into<String>) -> (TaskPulse, TaskMonitor) {
    let (tx, rx) = watch::channel(Instant::now());
    (
        TaskPulse { tx },
        TaskMonitor {
            name: name.into(),
            rx,
        },
    )
}

// ── Collector ───────────────────────────────────────────────────────────

pub struct HealthCollector {
    pub start_time: Instant,
    pub segments_ingested: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub calls_transcribed: AtomicU64,
    pub transcription_failures: AtomicU64,
    pub transcription_consecutive_failures: AtomicU64,
    pub geocode_lookups: AtomicU64,
    pub geocode_cache_hits: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub sessions_closed_overflow: AtomicU64,
    pub queue_depth: AtomicU64,
    /// Process RSS in MB, f32 bits (updated by the watchdog).
    pub memory_mb: AtomicU64,
    pub monitors: std::sync::Mutex<Vec<TaskMonitor>>,
}

impl HealthCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            segments_ingested: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            calls_transcribed: AtomicU64::new(0),
            transcription_failures: AtomicU64::new(0),
            transcription_consecutive_failures: AtomicU64::new(0),
            geocode_lookups: AtomicU64::new(0),
            geocode_cache_hits: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            sessions_closed_overflow: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            memory_mb: AtomicU64::new(0),
            monitors: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn register_monitor(&self, monitor: TaskMonitor) {
        self.monitors.lock().unwrap().push(monitor);
    }

    pub fn all_tasks_healthy(&self, timeout: std::time::Duration) -> bool {
        self.monitors
            .lock()
            .unwrap()
            .iter()
            .all(|m| m.is_alive(timeout))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn memory_mb_value(&self) -> f32 {
        f32::from_bits(self.memory_mb.load(Ordering::Relaxed) as u32)
    }

    pub fn stats_snapshot(
        &self,
        active_calls: u64,
        calls_today: u64,
        alerts_unread: u64,
        live_sessions: u64,
    ) -> StatsSnapshot {
        StatsSnapshot {
            active_calls,
            calls_today,
            segments_ingested: self.segments_ingested.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            transcription_failures: self.transcription_failures.load(Ordering::Relaxed),
            geocode_cache_hits: self.geocode_cache_hits.load(Ordering::Relaxed),
            alerts_unread,
            live_sessions,
        }
    }

    pub fn health_snapshot(
        &self,
        scanner_running: bool,
        scanner_consecutive_failures: u32,
    ) -> SystemHealthSnapshot {
        SystemHealthSnapshot {
            uptime_secs: self.uptime_secs(),
            scanner_running,
            scanner_consecutive_failures,
            transcription_queue_depth: self.queue_depth.load(Ordering::Relaxed),
            memory_mb: self.memory_mb_value(),
            tasks_healthy: self.all_tasks_healthy(std::time::Duration::from_secs(120)),
        }
    }
}

impl Default for HealthCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_keeps_monitor_alive() {
        let (pulse, monitor) = task_pulse("bridge");
        pulse.tick();
        assert!(monitor.is_alive(std::time::Duration::from_secs(2)));
        assert_eq!(monitor.name, "bridge");
    }

    #[test]
    fn test_counters_flow_into_snapshot() {
        let health = HealthCollector::new();
        health.segments_ingested.fetch_add(5, Ordering::Relaxed);
        health.duplicates_dropped.fetch_add(2, Ordering::Relaxed);

        let stats = health.stats_snapshot(3, 10, 1, 2);
        assert_eq!(stats.segments_ingested, 5);
        assert_eq!(stats.duplicates_dropped, 2);
        assert_eq!(stats.active_calls, 3);
        assert_eq!(stats.live_sessions, 2);
    }
}
