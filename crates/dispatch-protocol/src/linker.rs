/// Call-linking analysis: detecting dispatches cut across multiple short
/// segments and scoring merge candidates on the same talkgroup.
///
/// The merge itself (audio concat, re-transcription, row updates) runs in
/// the server; this module owns the decision logic.
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::call::Call;
use crate::taxonomy;
use crate::units;
use crate::LINK_WINDOW_SECS;

/// Minimum compatibility for a merge.
pub const MERGE_THRESHOLD: f64 = 0.6;

/// At most this many neighbors are absorbed into one call.
pub const MAX_MERGE_NEIGHBORS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    Empty,
    TrailingStop,
    UnitsOnly,
    AddressOnly,
    TooShort,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletenessAnalysis {
    pub complete: bool,
    pub confidence: f64,
    pub reason: Option<IncompleteReason>,
}

static TRAILING_STOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:and|to|at|on|near|from)[\s.,]*$").unwrap());

static LEADING_CONTINUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:the|a|an|of|for|with)\b").unwrap());

/// Transcripts that open with a street number read like the second half
/// of a cut dispatch even when no full address validates.
static LEADING_STREET_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d{3,6}\b").unwrap());

/// Decide whether a transcript looks like a whole dispatch or a fragment.
pub fn analyze_completeness(transcript: &str, location: Option<&str>) -> CompletenessAnalysis {
    let trimmed = transcript.trim();

    if trimmed.is_empty() || trimmed.to_lowercase().contains("unavailable") {
        return incomplete(0.9, IncompleteReason::Empty);
    }
    if TRAILING_STOP_RE.is_match(trimmed) {
        return incomplete(0.8, IncompleteReason::TrailingStop);
    }
    if units::is_units_only(trimmed) {
        return incomplete(0.75, IncompleteReason::UnitsOnly);
    }

    let lowered = trimmed.to_lowercase();
    let has_units = !units::parse_units(trimmed).is_empty();
    let has_call_type = taxonomy::match_call_type(&lowered).is_some();
    let has_location = location.is_some();

    if has_location && !has_call_type {
        return incomplete(0.7, IncompleteReason::AddressOnly);
    }
    if trimmed.len() < 15 {
        return incomplete(0.6, IncompleteReason::TooShort);
    }

    let confidence = if has_units && has_location && has_call_type {
        0.9
    } else {
        0.5
    };
    CompletenessAnalysis {
        complete: true,
        confidence,
        reason: None,
    }
}

fn incomplete(confidence: f64, reason: IncompleteReason) -> CompletenessAnalysis {
    CompletenessAnalysis {
        complete: false,
        confidence,
        reason: Some(reason),
    }
}

/// Candidate eligibility: same talkgroup, inside the ±5 min window
/// (inclusive at exactly the boundary), neither already merged.
pub fn within_link_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    let delta = (a - b).num_milliseconds().abs();
    delta <= LINK_WINDOW_SECS * 1000
}

pub fn time_score(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let delta_secs = (a - b).num_milliseconds().abs() as f64 / 1000.0;
    (1.0 - delta_secs / LINK_WINDOW_SECS as f64).max(0.0)
}

/// Content affinity between two fragments, a sum of additive cues:
/// shared unit tokens 0.4, shared locations 0.3, one-has-units while the
/// other has a location signal 0.3, and a continuation cue 0.2 (trailing
/// stop or units-only header on one side, or a leading article on the
/// other).
pub fn content_score(a: &Call, b: &Call) -> f64 {
    let units_a = units::parse_units(&a.transcript);
    let units_b = units::parse_units(&b.transcript);

    let mut score = 0.0;

    if units_a.iter().any(|u| units_b.contains(u)) {
        score += 0.4;
    }
    if let (Some(loc_a), Some(loc_b)) = (a.location.as_deref(), b.location.as_deref()) {
        if loc_a.eq_ignore_ascii_case(loc_b) {
            score += 0.3;
        }
    }
    let complement = (!units_a.is_empty() && has_location_signal(b))
        || (!units_b.is_empty() && has_location_signal(a));
    if complement {
        score += 0.3;
    }
    if continuation_cue(a, b) || continuation_cue(b, a) {
        score += 0.2;
    }

    score
}

pub fn compatibility(a: &Call, b: &Call) -> f64 {
    0.4 * time_score(a.timestamp, b.timestamp) + 0.6 * content_score(a, b)
}

fn has_location_signal(call: &Call) -> bool {
    call.location.is_some() || LEADING_STREET_NUMBER_RE.is_match(&call.transcript)
}

fn continuation_cue(first: &Call, second: &Call) -> bool {
    TRAILING_STOP_RE.is_match(first.transcript.trim())
        || units::is_units_only(first.transcript.trim())
        || LEADING_CONTINUATION_RE.is_match(&second.transcript)
}

/// Pick merge partners for `primary`: eligible candidates scored above
/// the threshold, best first, capped at `MAX_MERGE_NEIGHBORS`.
pub fn select_merge_candidates<'a>(primary: &Call, candidates: &'a [Call]) -> Vec<&'a Call> {
    let mut scored: Vec<(&Call, f64)> = candidates
        .iter()
        .filter(|c| c.id != primary.id)
        .filter(|c| c.talkgroup == primary.talkgroup)
        .filter(|c| !c.is_merged() && !primary.is_merged())
        .filter(|c| within_link_window(primary.timestamp, c.timestamp))
        .map(|c| (c, compatibility(primary, c)))
        .filter(|(_, score)| *score > MERGE_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
        .into_iter()
        .take(MAX_MERGE_NEIGHBORS)
        .map(|(c, _)| c)
        .collect()
}

/// Audio ordering for the merged blob: primary first unless the absorbed
/// segment was captured earlier.
pub fn merge_order<'a>(primary: &'a Call, absorbed: &'a Call) -> (&'a Call, &'a Call) {
    if absorbed.timestamp < primary.timestamp {
        (absorbed, primary)
    } else {
        (primary, absorbed)
    }
}

/// Merged transcripts read in capture order.
pub fn merge_transcripts(primary: &Call, absorbed: &[&Call]) -> String {
    let mut parts: Vec<(&DateTime<Utc>, &str)> = Vec::with_capacity(absorbed.len() + 1);
    parts.push((&primary.timestamp, primary.transcript.trim()));
    for call in absorbed {
        parts.push((&call.timestamp, call.transcript.trim()));
    }
    parts.sort_by_key(|(ts, _)| **ts);
    parts
        .iter()
        .map(|(_, t)| *t)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{AcuityLevel, CallMetadata, CallStatus};
    use crate::taxonomy::CallType;
    use chrono::TimeZone;

    fn call(id: i64, offset_secs: i64, transcript: &str, location: Option<&str>) -> Call {
        Call {
            id,
            audio_segment_id: format!("seg-{id}"),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            talkgroup: "10202".into(),
            system: "metro".into(),
            frequency_hz: None,
            duration_ms: Some(3000),
            transcript: transcript.into(),
            confidence: 0.9,
            call_type: CallType::ScannerAudio,
            location: location.map(Into::into),
            latitude: None,
            longitude: None,
            keywords: Vec::new(),
            acuity: AcuityLevel::Unknown,
            urgency_score: 0.0,
            status: CallStatus::Active,
            units: Vec::new(),
            metadata: CallMetadata::default(),
        }
    }

    #[test]
    fn test_completeness_empty_and_markers() {
        let a = analyze_completeness("", None);
        assert!(!a.complete);
        assert_eq!(a.confidence, 0.9);

        let a = analyze_completeness("[transcription unavailable]", None);
        assert!(!a.complete);
    }

    #[test]
    fn test_completeness_trailing_stop() {
        let a = analyze_completeness("Engine 26 respond to", None);
        assert!(!a.complete);
        assert_eq!(a.reason, Some(IncompleteReason::TrailingStop));
    }

    #[test]
    fn test_completeness_units_only() {
        let a = analyze_completeness("Engine 26, Medic 26", None);
        assert!(!a.complete);
        assert_eq!(a.reason, Some(IncompleteReason::UnitsOnly));
    }

    #[test]
    fn test_completeness_full_dispatch() {
        let a = analyze_completeness(
            "Engine 19, 1555 South Harding Street, chest pain",
            Some("1555 South Harding Street"),
        );
        assert!(a.complete);
        assert_eq!(a.confidence, 0.9);
    }

    #[test]
    fn test_window_boundary_inclusive_at_five_minutes() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap();
        let at_window = t0 + chrono::Duration::seconds(300);
        let past_window = at_window + chrono::Duration::milliseconds(1);
        assert!(within_link_window(t0, at_window));
        assert!(!within_link_window(t0, past_window));
    }

    #[test]
    fn test_cut_dispatch_merges() {
        // Units-only header at t, address + complaint 12 s later.
        let first = call(1, 0, "Engine 26, Medic 26", None);
        let second = call(2, 12, "7212 US 31 South, Chest Pain", None);

        let score = compatibility(&first, &second);
        assert!(score > MERGE_THRESHOLD, "score {score} should merge");

        let selected = select_merge_candidates(&first, std::slice::from_ref(&second));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);

        let merged = merge_transcripts(&first, &selected);
        assert_eq!(merged, "Engine 26, Medic 26 7212 US 31 South, Chest Pain");
    }

    #[test]
    fn test_unrelated_calls_do_not_merge() {
        let first = call(1, 0, "Medic 11 clear of the hospital returning to quarters", None);
        let second = call(2, 240, "Engine 4 on scene nothing showing", None);
        assert!(compatibility(&first, &second) <= MERGE_THRESHOLD);
    }

    #[test]
    fn test_merged_calls_are_ineligible() {
        let first = call(1, 0, "Engine 26, Medic 26", None);
        let mut second = call(2, 12, "7212 US 31 South, Chest Pain", None);
        second.status = CallStatus::Merged;
        assert!(select_merge_candidates(&first, std::slice::from_ref(&second)).is_empty());
    }

    #[test]
    fn test_merge_order_respects_capture_time() {
        let primary = call(1, 30, "second half", None);
        let absorbed = call(2, 0, "first half", None);
        let (first, second) = merge_order(&primary, &absorbed);
        assert_eq!(first.id, 2);
        assert_eq!(second.id, 1);
    }

    #[test]
    fn test_shared_units_raise_score() {
        let first = call(1, 0, "Medic 26 responding to", None);
        let second = call(2, 20, "the incident, Medic 26 copy chest pain", None);
        // shared units (0.4) + continuation cues (0.2) + time
        assert!(compatibility(&first, &second) > 0.7);
    }
}
