/// Pattern and anomaly evaluation math for the alert engine.
///
/// Everything here is a pure function over data the engine pulls from the
/// store, so the statistics stay testable without a database.
use std::collections::HashMap;

use crate::alert::AlertSeverity;
use crate::call::Call;
use crate::taxonomy::CallType;

/// Chief complaints tracked by the public-health z-score scan.
pub const PUBLIC_HEALTH_TYPES: &[CallType] = &[
    CallType::Overdose,
    CallType::Environmental,
    CallType::Psychiatric,
    CallType::InjuredPerson,
    CallType::Childbirth,
];

/// Overdose-family calls in the last 2 h at or above this fire a spike.
pub const OVERDOSE_SPIKE_MIN: usize = 3;

/// Location buckets (first three tokens) at or above this concentration.
pub const AREA_CONCENTRATION_MIN: usize = 5;

/// Per-type spike bar for rule-configured call types.
pub const CALL_TYPE_SPIKE_MIN: usize = 4;

/// Case-insensitive substring match against transcript or call type.
pub fn keyword_matches(keywords: &[String], call: &Call) -> bool {
    let transcript = call.transcript.to_lowercase();
    let call_type = call.call_type.as_str().to_lowercase();
    keywords.iter().any(|k| {
        let k = k.to_lowercase();
        !k.is_empty() && (transcript.contains(&k) || call_type.contains(&k))
    })
}

/// Normalized location key used for duplicate-address detection.
pub fn normalize_location(location: &str) -> String {
    location
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// More than one call sharing this call's normalized location inside the
/// window indicates a duplicate-address anomaly.
pub fn duplicate_address_count(call: &Call, recent: &[Call]) -> usize {
    let Some(location) = call.location.as_deref() else {
        return 0;
    };
    let key = normalize_location(location);
    recent
        .iter()
        .filter(|c| {
            c.location
                .as_deref()
                .is_some_and(|l| normalize_location(l) == key)
        })
        .count()
}

/// Bucket recent calls by the first three tokens of their location.
pub fn area_buckets(recent: &[Call]) -> HashMap<String, usize> {
    let mut buckets: HashMap<String, usize> = HashMap::new();
    for call in recent {
        let Some(location) = call.location.as_deref() else {
            continue;
        };
        let key = location
            .to_lowercase()
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" ");
        if key.is_empty() {
            continue;
        }
        *buckets.entry(key).or_default() += 1;
    }
    buckets
}

// ── Z-score spike detection ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeVerdict {
    pub z_score: f64,
    pub is_spike: bool,
    /// None below the alerting bar; High past z>3, Critical past z>4.
    pub alert_severity: Option<AlertSeverity>,
}

/// Z-score of `latest` against the per-day history (the last 24 h are
/// excluded from the baseline by the caller). Returns None when the
/// baseline is empty or has zero variance.
pub fn z_score(daily_counts: &[u32], latest: u32) -> Option<f64> {
    if daily_counts.is_empty() {
        return None;
    }
    let n = daily_counts.len() as f64;
    let mean = daily_counts.iter().map(|&c| f64::from(c)).sum::<f64>() / n;
    let variance = daily_counts
        .iter()
        .map(|&c| (f64::from(c) - mean).powi(2))
        .sum::<f64>()
        / n;
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        return None;
    }
    Some((f64::from(latest) - mean) / stdev)
}

pub fn classify_spike(z: f64) -> SpikeVerdict {
    SpikeVerdict {
        z_score: z,
        is_spike: z > 2.0,
        alert_severity: if z > 4.0 {
            Some(AlertSeverity::Critical)
        } else if z > 3.0 {
            Some(AlertSeverity::High)
        } else {
            None
        },
    }
}

// ── Geographic clustering ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GeoClusterReport {
    pub call_type: CallType,
    pub cluster_count: usize,
    pub total_calls: usize,
    pub severity: AlertSeverity,
}

/// Group the last 24 h of geocoded calls by (callType, lat, lng); a call
/// type with three or more repeat-coordinate clusters is reported, with
/// severity scaling on the total call count involved.
pub fn geographic_clusters(recent: &[Call]) -> Vec<GeoClusterReport> {
    let mut by_site: HashMap<(CallType, String), usize> = HashMap::new();
    for call in recent {
        let Some((lat, lng)) = call.coordinates() else {
            continue;
        };
        let key = (call.call_type, format!("{lat:.4},{lng:.4}"));
        *by_site.entry(key).or_default() += 1;
    }

    let mut per_type: HashMap<CallType, (usize, usize)> = HashMap::new();
    for ((call_type, _), count) in by_site {
        if count >= 2 {
            let entry = per_type.entry(call_type).or_default();
            entry.0 += 1;
            entry.1 += count;
        }
    }

    let mut reports: Vec<GeoClusterReport> = per_type
        .into_iter()
        .filter(|(_, (clusters, _))| *clusters >= 3)
        .map(|(call_type, (cluster_count, total_calls))| GeoClusterReport {
            call_type,
            cluster_count,
            total_calls,
            severity: if total_calls > 10 {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            },
        })
        .collect();
    reports.sort_by_key(|r| std::cmp::Reverse(r.total_calls));
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{AcuityLevel, CallMetadata, CallStatus};
    use chrono::{TimeZone, Utc};

    fn call(call_type: CallType, location: Option<&str>, coords: Option<(f64, f64)>) -> Call {
        Call {
            id: 0,
            audio_segment_id: "seg".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap(),
            talkgroup: "10202".into(),
            system: "metro".into(),
            frequency_hz: None,
            duration_ms: None,
            transcript: "test transcript".into(),
            confidence: 0.9,
            call_type,
            location: location.map(Into::into),
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
            keywords: Vec::new(),
            acuity: AcuityLevel::Unknown,
            urgency_score: 0.5,
            status: CallStatus::Active,
            units: Vec::new(),
            metadata: CallMetadata::default(),
        }
    }

    #[test]
    fn test_keyword_matches_transcript_and_type() {
        let mut c = call(CallType::Overdose, None, None);
        c.transcript = "possible narcan administration".into();
        assert!(keyword_matches(&["NARCAN".into()], &c));
        assert!(keyword_matches(&["overdose".into()], &c)); // via call type
        assert!(!keyword_matches(&["gunshot".into()], &c));
        assert!(!keyword_matches(&[String::new()], &c));
    }

    #[test]
    fn test_duplicate_address_count() {
        let subject = call(CallType::SickPerson, Some("120 Main Street"), None);
        let recent = vec![
            call(CallType::SickPerson, Some("120  main street"), None),
            call(CallType::ChestPain, Some("120 Main Street"), None),
            call(CallType::ChestPain, Some("999 Other Road"), None),
        ];
        assert_eq!(duplicate_address_count(&subject, &recent), 2);
    }

    #[test]
    fn test_z_score_spike() {
        // A quiet baseline against five events in one day reads critical.
        let history = [1, 1, 2, 1, 1];
        let mean: f64 = 1.2;
        let z = z_score(&history, 5).unwrap();
        let expected_sigma = (history
            .iter()
            .map(|&c| (f64::from(c) - mean).powi(2))
            .sum::<f64>()
            / history.len() as f64)
            .sqrt();
        assert!((z - (5.0 - mean) / expected_sigma).abs() < 1e-9);

        let verdict = classify_spike(7.6);
        assert!(verdict.is_spike);
        assert_eq!(verdict.alert_severity, Some(AlertSeverity::Critical));

        let verdict = classify_spike(3.5);
        assert_eq!(verdict.alert_severity, Some(AlertSeverity::High));

        let verdict = classify_spike(2.5);
        assert!(verdict.is_spike);
        assert_eq!(verdict.alert_severity, None);
    }

    #[test]
    fn test_z_score_degenerate_baselines() {
        assert_eq!(z_score(&[], 5), None);
        assert_eq!(z_score(&[2, 2, 2], 5), None); // zero variance
    }

    #[test]
    fn test_area_buckets_use_first_three_tokens() {
        let recent = vec![
            call(CallType::SickPerson, Some("1200 East Washington Street"), None),
            call(CallType::ChestPain, Some("1200 East Washington Blvd"), None),
            call(CallType::ChestPain, Some("88 Oak Lane"), None),
        ];
        let buckets = area_buckets(&recent);
        assert_eq!(buckets["1200 east washington"], 2);
        assert_eq!(buckets["88 oak lane"], 1);
    }

    #[test]
    fn test_geographic_clusters() {
        let mut recent = Vec::new();
        // Three overdose clusters of two calls each.
        for site in [(39.1, -86.1), (39.2, -86.2), (39.3, -86.3)] {
            recent.push(call(CallType::Overdose, None, Some(site)));
            recent.push(call(CallType::Overdose, None, Some(site)));
        }
        // One chest-pain cluster only: below the 3-cluster bar.
        recent.push(call(CallType::ChestPain, None, Some((39.9, -86.9))));
        recent.push(call(CallType::ChestPain, None, Some((39.9, -86.9))));

        let reports = geographic_clusters(&recent);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].call_type, CallType::Overdose);
        assert_eq!(reports[0].cluster_count, 3);
        assert_eq!(reports[0].total_calls, 6);
        assert_eq!(reports[0].severity, AlertSeverity::Medium);
    }
}
