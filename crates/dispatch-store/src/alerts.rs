/// Alerts and alert rules.
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use dispatch_protocol::alert::{Alert, AlertRule, AlertSeverity, AlertTemplate, AlertType, RuleSpec};

use crate::{from_epoch_ms, to_epoch_ms, CallStore, Result};

impl CallStore {
    pub fn insert_alert(&self, alert: &Alert) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alerts
                 (alert_type, severity, category, title, message, related_call_id,
                  related_data, created_at, expires_at, acknowledged, read,
                  sound_enabled, visual_highlight)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    alert.alert_type.as_str(),
                    alert.severity.as_str(),
                    alert.category,
                    alert.title,
                    alert.message,
                    alert.related_call_id,
                    serde_json::to_string(&alert.related_data)?,
                    to_epoch_ms(alert.created_at),
                    alert.expires_at.map(to_epoch_ms),
                    alert.acknowledged,
                    alert.read,
                    alert.sound_enabled,
                    alert.visual_highlight,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn unread_alerts(&self, limit: u32) -> Result<Vec<Alert>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{ALERT_SELECT} WHERE read = 0 ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_alert)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn unread_alert_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 =
                conn.query_row("SELECT COUNT(*) FROM alerts WHERE read = 0", [], |row| {
                    row.get(0)
                })?;
            Ok(n)
        })
    }

    pub fn mark_alert_read(&self, alert_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE alerts SET read = 1 WHERE id = ?1", params![alert_id])?;
            Ok(())
        })
    }

    pub fn acknowledge_alert(&self, alert_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE alerts SET acknowledged = 1 WHERE id = ?1",
                params![alert_id],
            )?;
            Ok(())
        })
    }

    /// Delete every alert past its expiry. Returns how many went.
    pub fn sweep_expired_alerts(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM alerts WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![to_epoch_ms(now)],
            )?;
            Ok(n)
        })
    }

    // ── Rules ───────────────────────────────────────────────────────────

    pub fn insert_rule(&self, rule: &AlertRule) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_rules (name, spec, actions, priority, active, trigger_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rule.name,
                    serde_json::to_string(&rule.spec)?,
                    serde_json::to_string(&rule.actions)?,
                    rule.priority,
                    rule.active,
                    rule.trigger_count,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Active rules, highest priority first — per-call evaluation order.
    pub fn active_rules(&self) -> Result<Vec<AlertRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{RULE_SELECT} WHERE active = 1 ORDER BY priority DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], row_to_rule)?;
            Ok(rows
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect())
        })
    }

    pub fn increment_rule_trigger(&self, rule_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE alert_rules SET trigger_count = trigger_count + 1 WHERE id = ?1",
                params![rule_id],
            )?;
            Ok(())
        })
    }

    /// Seed a starter rule set on an empty table so a fresh install
    /// alerts on the obvious red flags without manual configuration.
    pub fn ensure_default_rules(&self) -> Result<()> {
        let existing: i64 = self.with_conn(|conn| {
            let n = conn.query_row("SELECT COUNT(*) FROM alert_rules", [], |row| row.get(0))?;
            Ok(n)
        })?;
        if existing > 0 {
            return Ok(());
        }

        let defaults = [
            AlertRule {
                id: 0,
                name: "Gunshot keyword".into(),
                spec: RuleSpec::Keyword {
                    keywords: vec!["gunshot".into(), "shots fired".into()],
                },
                actions: AlertTemplate {
                    alert_type: AlertType::Critical,
                    severity: AlertSeverity::Critical,
                    category: "violence".into(),
                    title: "Gunshot call".into(),
                    message: "{callType} at {location} ({time})".into(),
                    expires_minutes: Some(120),
                    sound_enabled: true,
                    visual_highlight: true,
                },
                priority: 100,
                active: true,
                trigger_count: 0,
            },
            AlertRule {
                id: 0,
                name: "Overdose volume".into(),
                spec: RuleSpec::Threshold {
                    call_type: "Overdose".into(),
                    threshold: 3,
                    time_window_minutes: 120,
                },
                actions: AlertTemplate {
                    alert_type: AlertType::Anomaly,
                    severity: AlertSeverity::High,
                    category: "public-health".into(),
                    title: "Overdose volume".into(),
                    message: "Multiple overdose calls in the last two hours".into(),
                    expires_minutes: Some(240),
                    sound_enabled: false,
                    visual_highlight: true,
                },
                priority: 80,
                active: true,
                trigger_count: 0,
            },
            AlertRule {
                id: 0,
                name: "Repeat address".into(),
                spec: RuleSpec::Anomaly {
                    check_duplicate_addresses: true,
                    time_window_minutes: 60,
                },
                actions: AlertTemplate {
                    alert_type: AlertType::Warning,
                    severity: AlertSeverity::Medium,
                    category: "anomaly".into(),
                    title: "Repeat address".into(),
                    message: "Multiple calls at {location} inside an hour".into(),
                    expires_minutes: Some(120),
                    sound_enabled: false,
                    visual_highlight: false,
                },
                priority: 50,
                active: true,
                trigger_count: 0,
            },
        ];

        for rule in &defaults {
            self.insert_rule(rule)?;
        }
        Ok(())
    }
}

const ALERT_SELECT: &str = "SELECT id, alert_type, severity, category, title, message,
    related_call_id, related_data, created_at, expires_at, acknowledged, read,
    sound_enabled, visual_highlight FROM alerts";

const RULE_SELECT: &str =
    "SELECT id, name, spec, actions, priority, active, trigger_count FROM alert_rules";

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let type_str: String = row.get(1)?;
    let severity_str: String = row.get(2)?;
    let related_data: String = row.get(7)?;
    Ok(Alert {
        id: row.get(0)?,
        alert_type: AlertType::parse(&type_str).unwrap_or(AlertType::Info),
        severity: AlertSeverity::parse(&severity_str).unwrap_or(AlertSeverity::Low),
        category: row.get(3)?,
        title: row.get(4)?,
        message: row.get(5)?,
        related_call_id: row.get(6)?,
        related_data: serde_json::from_str(&related_data).unwrap_or(serde_json::Value::Null),
        created_at: from_epoch_ms(row.get(8)?),
        expires_at: row.get::<_, Option<i64>>(9)?.map(from_epoch_ms),
        acknowledged: row.get(10)?,
        read: row.get(11)?,
        sound_enabled: row.get(12)?,
        visual_highlight: row.get(13)?,
    })
}

/// Rules with unparseable specs (edited by hand, older schema) are
/// skipped rather than failing the whole listing.
fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Option<AlertRule>> {
    let spec_json: String = row.get(2)?;
    let actions_json: String = row.get(3)?;
    let (Ok(spec), Ok(actions)) = (
        serde_json::from_str::<RuleSpec>(&spec_json),
        serde_json::from_str::<AlertTemplate>(&actions_json),
    ) else {
        return Ok(None);
    };
    Ok(Some(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        spec,
        actions,
        priority: row.get(4)?,
        active: row.get(5)?,
        trigger_count: row.get(6)?,
    }))
}
