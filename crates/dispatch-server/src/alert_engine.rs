/// Alert engine: per-call rule evaluation plus the periodic pattern and
/// anomaly scan.
///
/// Every fired category carries a cooldown so an ongoing spike raises
/// one alert, not one per scan tick.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatch_protocol::alert::{
    render_template, Alert, AlertSeverity, AlertTemplate, AlertType, RuleSpec,
};
use dispatch_protocol::call::Call;
use dispatch_protocol::live::ServerFrame;
use dispatch_protocol::rules;
use dispatch_protocol::taxonomy::CallType;
use dispatch_store::CallStore;

use crate::health::{HealthCollector, TaskPulse};
use crate::hub::LiveHub;

/// Minimum gap between two alerts of the same category.
const FIRE_COOLDOWN: Duration = Duration::from_secs(30 * 60);
const OVERDOSE_WINDOW_HOURS: i64 = 2;
const AREA_WINDOW_HOURS: i64 = 2;

pub struct AlertEngine {
    store: Arc<CallStore>,
    hub: LiveHub,
    health: Arc<HealthCollector>,
    scan_interval: Duration,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<CallStore>,
        hub: LiveHub,
        health: Arc<HealthCollector>,
        scan_interval_seconds: u64,
    ) -> Self {
        Self {
            store,
            hub,
            health,
            scan_interval: Duration::from_secs(scan_interval_seconds.max(5)),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Per-call evaluation, invoked on every terminal call write.
    pub fn evaluate_call(&self, call: &Call) {
        if call.call_type == CallType::ScannerAudio || call.is_merged() {
            return;
        }
        let rules = match self.store.active_rules() {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "failed to load alert rules");
                return;
            }
        };

        for rule in rules {
            let fired = match &rule.spec {
                RuleSpec::Keyword { keywords } => rules::keyword_matches(keywords, call),
                // Pattern rules belong to the periodic scan.
                RuleSpec::Pattern { .. } => false,
                RuleSpec::Threshold {
                    call_type,
                    threshold,
                    time_window_minutes,
                } => {
                    if call.call_type.as_str() != call_type {
                        false
                    } else {
                        let since = Utc::now() - ChronoDuration::minutes(*time_window_minutes);
                        self.store
                            .count_by_type_since(call_type, since)
                            .map(|n| n >= *threshold)
                            .unwrap_or(false)
                    }
                }
                RuleSpec::Anomaly {
                    check_duplicate_addresses,
                    time_window_minutes,
                } => {
                    if !check_duplicate_addresses {
                        false
                    } else {
                        let since = Utc::now() - ChronoDuration::minutes(*time_window_minutes);
                        self.store
                            .calls_since(since)
                            .map(|recent| rules::duplicate_address_count(call, &recent) > 1)
                            .unwrap_or(false)
                    }
                }
            };

            if fired {
                // Keyword hits are per-call events; volume rules cool
                // down per rule so a spike raises one alert.
                let key = match &rule.spec {
                    RuleSpec::Keyword { .. } => format!("rule:{}:call:{}", rule.id, call.id),
                    _ => format!("rule:{}", rule.id),
                };
                if self.cooled_down(&key) {
                    let _ = self.store.increment_rule_trigger(rule.id);
                    self.fire(&rule.actions, Some(call));
                }
            }
        }
    }

    /// Periodic scan: spikes, concentrations, z-scores, clusters, and
    /// the expired-alert sweep.
    pub async fn run_scan_loop(self: Arc<Self>, pulse: TaskPulse, cancel: CancellationToken) {
        info!(interval_secs = self.scan_interval.as_secs(), "alert scan loop started");
        let mut interval = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
            pulse.tick();
            if let Err(e) = self.scan_once() {
                error!(error = %e, "alert scan failed");
            }
        }
    }

    fn scan_once(&self) -> Result<(), dispatch_store::StoreError> {
        let now = Utc::now();

        let swept = self.store.sweep_expired_alerts(now)?;
        if swept > 0 {
            debug!(swept, "expired alerts removed");
        }

        // Overdose family volume over the last two hours.
        let overdoses = self.store.count_by_type_since(
            CallType::Overdose.as_str(),
            now - ChronoDuration::hours(OVERDOSE_WINDOW_HOURS),
        )? as usize;
        if overdoses >= rules::OVERDOSE_SPIKE_MIN && self.cooled_down("overdose_spike") {
            self.fire_anomaly(
                AlertSeverity::High,
                "overdose_spike",
                &format!("{overdoses} overdose calls in the last {OVERDOSE_WINDOW_HOURS} hours"),
            );
        }

        // Geographic concentration by location prefix.
        let recent = self
            .store
            .calls_since(now - ChronoDuration::hours(AREA_WINDOW_HOURS))?;
        for (bucket, count) in rules::area_buckets(&recent) {
            if count >= rules::AREA_CONCENTRATION_MIN {
                let key = format!("area:{bucket}");
                if self.cooled_down(&key) {
                    self.fire_anomaly(
                        AlertSeverity::Medium,
                        "area_concentration",
                        &format!("{count} calls near {bucket} in {AREA_WINDOW_HOURS} hours"),
                    );
                }
            }
        }

        // Per-type spikes for every threshold-configured call type.
        for rule in self.store.active_rules()? {
            if let RuleSpec::Threshold {
                call_type,
                time_window_minutes,
                ..
            } = &rule.spec
            {
                let count = self.store.count_by_type_since(
                    call_type,
                    now - ChronoDuration::minutes(*time_window_minutes),
                )? as usize;
                if count >= rules::CALL_TYPE_SPIKE_MIN {
                    let key = format!("type_spike:{call_type}");
                    if self.cooled_down(&key) {
                        self.fire_anomaly(
                            AlertSeverity::Medium,
                            "call_type_spike",
                            &format!("{count} {call_type} calls in {time_window_minutes} minutes"),
                        );
                    }
                }
            }
        }

        self.scan_public_health_zscores()?;

        // Geographic clustering over the last 24 hours.
        let last_day = self.store.calls_since(now - ChronoDuration::hours(24))?;
        for report in rules::geographic_clusters(&last_day) {
            let key = format!("geo_cluster:{}", report.call_type.as_str());
            if self.cooled_down(&key) {
                self.fire_anomaly(
                    report.severity,
                    "geographic_cluster",
                    &format!(
                        "{} repeat-location clusters of {} ({} calls) in 24 hours",
                        report.cluster_count,
                        report.call_type.as_str(),
                        report.total_calls
                    ),
                );
            }
        }

        Ok(())
    }

    /// 30-day daily baseline per tracked chief complaint, excluding the
    /// last 24 h; yesterday's count is z-scored against it.
    fn scan_public_health_zscores(&self) -> Result<(), dispatch_store::StoreError> {
        let now = Utc::now();
        let today_day = now.timestamp_millis() / 86_400_000;

        for call_type in rules::PUBLIC_HEALTH_TYPES {
            let by_day: HashMap<i64, u32> = self
                .store
                .daily_counts(call_type.as_str(), 31, now)?
                .into_iter()
                .collect();

            let baseline: Vec<u32> = (today_day - 31..today_day - 1)
                .map(|day| by_day.get(&day).copied().unwrap_or(0))
                .collect();
            let yesterday = by_day.get(&(today_day - 1)).copied().unwrap_or(0);

            let Some(z) = rules::z_score(&baseline, yesterday) else {
                continue;
            };
            let verdict = rules::classify_spike(z);
            if verdict.is_spike {
                debug!(
                    call_type = call_type.as_str(),
                    z = format_args!("{z:.2}"),
                    yesterday,
                    "public-health spike marker"
                );
            }
            if let Some(severity) = verdict.alert_severity {
                let key = format!("zscore:{}", call_type.as_str());
                if self.cooled_down(&key) {
                    self.fire_anomaly(
                        severity,
                        "public_health_spike",
                        &format!(
                            "{} volume z-score {z:.1} ({yesterday} yesterday)",
                            call_type.as_str()
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    // ── Firing ──────────────────────────────────────────────────────────

    fn fire(&self, template: &AlertTemplate, call: Option<&Call>) {
        let message = match call {
            Some(call) => render_template(&template.message, call),
            None => template.message.clone(),
        };
        let alert = Alert {
            id: 0,
            alert_type: template.alert_type,
            severity: template.severity,
            category: template.category.clone(),
            title: template.title.clone(),
            message,
            related_call_id: call.map(|c| c.id),
            related_data: serde_json::Value::Null,
            created_at: Utc::now(),
            expires_at: template
                .expires_minutes
                .map(|m| Utc::now() + ChronoDuration::minutes(m)),
            acknowledged: false,
            read: false,
            sound_enabled: template.sound_enabled,
            visual_highlight: template.visual_highlight,
        };
        self.publish(alert);
    }

    fn fire_anomaly(&self, severity: AlertSeverity, category: &str, message: &str) {
        let alert = Alert {
            id: 0,
            alert_type: AlertType::Anomaly,
            severity,
            category: category.to_string(),
            title: category.replace('_', " "),
            message: message.to_string(),
            related_call_id: None,
            related_data: serde_json::Value::Null,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + ChronoDuration::hours(4)),
            acknowledged: false,
            read: false,
            sound_enabled: severity >= AlertSeverity::High,
            visual_highlight: severity >= AlertSeverity::High,
        };
        self.publish(alert);
    }

    fn publish(&self, mut alert: Alert) {
        match self.store.insert_alert(&alert) {
            Ok(id) => alert.id = id,
            Err(e) => {
                error!(error = %e, "failed to persist alert");
                return;
            }
        }
        self.health.alerts_raised.fetch_add(1, Ordering::Relaxed);
        warn!(
            severity = alert.severity.as_str(),
            category = %alert.category,
            message = %alert.message,
            "alert raised"
        );
        let frame = if alert.severity == AlertSeverity::Critical {
            ServerFrame::CriticalAlert { alert }
        } else {
            ServerFrame::NewAlert { alert }
        };
        self.hub.broadcast(&frame);
    }

    fn cooled_down(&self, key: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        match cooldowns.get(key) {
            Some(last) if last.elapsed() < FIRE_COOLDOWN => false,
            _ => {
                cooldowns.insert(key.to_string(), Instant::now());
                true
            }
        }
    }
}

/// Internal system alert, used by the supervisor and the worker pool
/// when a dependency goes sideways.
pub fn fire_system_alert(
    store: &Arc<CallStore>,
    hub: &LiveHub,
    severity: AlertSeverity,
    category: &str,
    message: &str,
) {
    let mut alert = Alert {
        id: 0,
        alert_type: AlertType::System,
        severity,
        category: category.to_string(),
        title: category.to_string(),
        message: message.to_string(),
        related_call_id: None,
        related_data: serde_json::Value::Null,
        created_at: Utc::now(),
        expires_at: None,
        acknowledged: false,
        read: false,
        sound_enabled: severity >= AlertSeverity::High,
        visual_highlight: true,
    };
    match store.insert_alert(&alert) {
        Ok(id) => alert.id = id,
        Err(e) => {
            error!(error = %e, "failed to persist system alert");
            return;
        }
    }
    warn!(category, message, "system alert raised");
    let frame = if alert.severity == AlertSeverity::Critical {
        ServerFrame::CriticalAlert { alert }
    } else {
        ServerFrame::NewAlert { alert }
    };
    hub.broadcast(&frame);
}

/// Deduplicate warnings for entities that keep tripping the same check
/// (overlong conversations, invariant rejects).
#[derive(Default)]
pub struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    pub fn first_time(&self, key: &str) -> bool {
        self.seen.lock().unwrap().insert(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_protocol::call::{AcuityLevel, AudioSegment, CallMetadata, CallStatus};

    fn engine() -> (Arc<AlertEngine>, Arc<CallStore>) {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        store.ensure_default_rules().unwrap();
        let health = Arc::new(HealthCollector::new());
        let hub = LiveHub::new(16, Arc::clone(&health));
        let engine = Arc::new(AlertEngine::new(Arc::clone(&store), hub, health, 30));
        (engine, store)
    }

    fn call(call_type: CallType, transcript: &str) -> Call {
        Call {
            id: 1,
            audio_segment_id: "seg-1".into(),
            timestamp: Utc::now(),
            talkgroup: "10202".into(),
            system: "metro".into(),
            frequency_hz: None,
            duration_ms: None,
            transcript: transcript.into(),
            confidence: 0.9,
            call_type,
            location: None,
            latitude: None,
            longitude: None,
            keywords: Vec::new(),
            acuity: AcuityLevel::Unknown,
            urgency_score: 0.9,
            status: CallStatus::Active,
            units: Vec::new(),
            metadata: CallMetadata::default(),
        }
    }

    #[test]
    fn test_keyword_rule_fires_and_persists() {
        let (engine, store) = engine();
        engine.evaluate_call(&call(CallType::GunshotWound, "shots fired at the corner"));
        let unread = store.unread_alerts(10).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].severity, AlertSeverity::Critical);
        assert!(unread[0].message.contains("Gunshot Wound"));
    }

    #[test]
    fn test_cooldown_suppresses_repeat_fires() {
        let (engine, store) = engine();
        let c = call(CallType::GunshotWound, "shots fired");
        engine.evaluate_call(&c);
        engine.evaluate_call(&c);
        assert_eq!(store.unread_alerts(10).unwrap().len(), 1);
    }

    #[test]
    fn test_placeholder_calls_are_ignored() {
        let (engine, store) = engine();
        engine.evaluate_call(&call(CallType::ScannerAudio, "shots fired"));
        assert!(store.unread_alerts(10).unwrap().is_empty());
    }

    #[test]
    fn test_overdose_scan_fires_spike() {
        let (engine, store) = engine();
        for i in 0..3 {
            let seg = AudioSegment {
                id: format!("seg-{i}"),
                blob_path: String::new(),
                content_type: "audio/wav".into(),
                duration_ms: None,
                sample_rate: None,
                channels: None,
                talkgroup: "10202".into(),
                system: "metro".into(),
                captured_at: Utc::now(),
                processed: true,
            };
            store.insert_segment(&seg).unwrap();
            let id = store.insert_preliminary_call(&seg, None).unwrap();
            let mut c = store.get_call(id).unwrap().unwrap();
            c.call_type = CallType::Overdose;
            c.transcript = "overdose".into();
            store.update_enrichment(&c).unwrap();
        }

        engine.scan_once().unwrap();
        let unread = store.unread_alerts(20).unwrap();
        assert!(unread
            .iter()
            .any(|a| a.category == "overdose_spike" && a.severity == AlertSeverity::High));
    }

    #[test]
    fn test_warn_once() {
        let w = WarnOnce::default();
        assert!(w.first_time("CONV-1"));
        assert!(!w.first_time("CONV-1"));
        assert!(w.first_time("CONV-2"));
    }
}
