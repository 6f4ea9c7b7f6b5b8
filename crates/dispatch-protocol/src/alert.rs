/// Alert and alert-rule entities, plus message-template rendering.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::Call;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Info,
    Warning,
    Critical,
    System,
    Anomaly,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::System => "system",
            Self::Anomaly => "anomaly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            "system" => Some(Self::System),
            "anomaly" => Some(Self::Anomaly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub category: String,
    pub title: String,
    pub message: String,
    pub related_call_id: Option<i64>,
    #[serde(default)]
    pub related_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub read: bool,
    pub sound_enabled: bool,
    pub visual_highlight: bool,
}

/// Typed rule conditions, discriminated by `ruleType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "ruleType", rename_all = "lowercase")]
pub enum RuleSpec {
    /// Any keyword substring-matches the transcript or call type.
    Keyword { keywords: Vec<String> },
    /// Evaluated by the periodic pattern scan, not per call.
    Pattern { pattern: String },
    /// Count of calls of `call_type` in the last window reaches the bar.
    Threshold {
        #[serde(rename = "callType")]
        call_type: String,
        threshold: u32,
        #[serde(rename = "timeWindowMinutes")]
        time_window_minutes: i64,
    },
    /// Duplicate-address anomaly inside the window.
    Anomaly {
        #[serde(rename = "checkDuplicateAddresses")]
        check_duplicate_addresses: bool,
        #[serde(rename = "timeWindowMinutes")]
        time_window_minutes: i64,
    },
}

impl RuleSpec {
    pub fn rule_type(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "keyword",
            Self::Pattern { .. } => "pattern",
            Self::Threshold { .. } => "threshold",
            Self::Anomaly { .. } => "anomaly",
        }
    }
}

/// Template for the Alert a rule produces when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTemplate {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub category: String,
    pub title: String,
    /// Supports `{callType}`, `{location}`, `{time}`, `{transcript}`.
    pub message: String,
    pub expires_minutes: Option<i64>,
    #[serde(default)]
    pub sound_enabled: bool,
    #[serde(default)]
    pub visual_highlight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub spec: RuleSpec,
    pub actions: AlertTemplate,
    pub priority: i32,
    pub active: bool,
    pub trigger_count: u32,
}

/// Fill the template placeholders from a call.
pub fn render_template(template: &str, call: &Call) -> String {
    template
        .replace("{callType}", call.call_type.as_str())
        .replace(
            "{location}",
            call.location.as_deref().unwrap_or("unknown location"),
        )
        .replace("{time}", &call.timestamp.format("%H:%M:%S").to_string())
        .replace("{transcript}", &call.transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{AcuityLevel, CallMetadata, CallStatus};
    use crate::taxonomy::CallType;
    use chrono::TimeZone;

    #[test]
    fn test_rule_spec_tagged_round_trip() {
        let spec = RuleSpec::Threshold {
            call_type: "Overdose".into(),
            threshold: 3,
            time_window_minutes: 120,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ruleType"], "threshold");
        assert_eq!(json["callType"], "Overdose");
        let back: RuleSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_template_rendering() {
        let call = Call {
            id: 7,
            audio_segment_id: "seg-7".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 4, 16, 20, 5).unwrap(),
            talkgroup: "10202".into(),
            system: "metro".into(),
            frequency_hz: None,
            duration_ms: None,
            transcript: "overdose at the shelter".into(),
            confidence: 0.8,
            call_type: CallType::Overdose,
            location: Some("520 Shelter Way".into()),
            latitude: None,
            longitude: None,
            keywords: vec!["overdose".into()],
            acuity: AcuityLevel::Unknown,
            urgency_score: 0.9,
            status: CallStatus::Active,
            units: Vec::new(),
            metadata: CallMetadata::default(),
        };
        let msg = render_template("{callType} at {location} ({time}): {transcript}", &call);
        assert_eq!(
            msg,
            "Overdose at 520 Shelter Way (16:20:05): overdose at the shelter"
        );
    }
}
