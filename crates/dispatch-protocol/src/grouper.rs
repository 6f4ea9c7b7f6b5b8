/// Hospital-conversation grouping rules and SOR detection.
///
/// The runtime grouper in the server holds the per-conversation locks and
/// store writes; the window math, split suggestion, and SOR pattern
/// matching live here so they stay testable in isolation.
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{CONVERSATION_IDLE_CLOSE_SECS, CONVERSATION_WINDOW_SECS};

/// Whether a new segment at `candidate` may join a conversation whose
/// segments span `existing` (non-empty). The hypothetical window from the
/// earliest to the latest timestamp (including the candidate) must stay
/// within 10 minutes; exactly at the bound still joins, one millisecond
/// past it opens a new conversation.
pub fn fits_window(existing: &[DateTime<Utc>], candidate: DateTime<Utc>) -> bool {
    let Some(&first) = existing.iter().min() else {
        return true;
    };
    let Some(&last) = existing.iter().max() else {
        return true;
    };
    let start = first.min(candidate);
    let end = last.max(candidate);
    (end - start).num_milliseconds() <= CONVERSATION_WINDOW_SECS * 1000
}

/// A conversation goes `completed` once no segment has arrived within
/// 7 minutes of its last one.
pub fn is_idle(last_segment_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - last_segment_at).num_seconds() >= CONVERSATION_IDLE_CLOSE_SECS
}

/// Greedy split for conversations whose span exceeds the window (only
/// possible in migrated data; the runtime grouper never creates them).
/// Walks timestamps in order, keeping each segment with the current group
/// while the running span stays within 10 minutes.
pub fn suggest_split(timestamps: &[DateTime<Utc>]) -> Vec<Vec<DateTime<Utc>>> {
    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let mut groups: Vec<Vec<DateTime<Utc>>> = Vec::new();
    for ts in sorted {
        match groups.last_mut() {
            Some(group)
                if (ts - group[0]).num_milliseconds() <= CONVERSATION_WINDOW_SECS * 1000 =>
            {
                group.push(ts);
            }
            _ => groups.push(vec![ts]),
        }
    }
    groups
}

// ── SOR detection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SorDetection {
    pub is_sor: bool,
    pub confidence: f64,
    pub physician_name: Option<String>,
}

impl SorDetection {
    fn negative() -> Self {
        Self {
            is_sor: false,
            confidence: 0.0,
            physician_name: None,
        }
    }
}

static SOR_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    const PHRASES: &str = "service on request|medical control|requesting orders|\
physician consult|med control|standing orders";
    Regex::new(&format!(r"(?i)\b(?:{PHRASES})\b")).unwrap()
});

static PHYSICIAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:doctor|dr\.?)\s+([A-Za-z][A-Za-z'-]+)").unwrap()
});

/// Scan one hospital segment's transcript for medical-director contact.
pub fn detect_sor(transcript: &str) -> SorDetection {
    let phrase = SOR_PHRASE_RE.is_match(transcript);
    let physician = PHYSICIAN_RE
        .captures(transcript)
        .map(|caps| titlecase(&caps[1]));

    if !phrase && physician.is_none() {
        return SorDetection::negative();
    }

    let confidence = match (phrase, physician.is_some()) {
        (true, true) => 0.95,
        (true, false) => 0.75,
        (false, true) => 0.6,
        (false, false) => 0.0,
    };

    SorDetection {
        is_sor: true,
        confidence,
        physician_name: physician,
    }
}

/// Fold per-segment detections into the conversation-level flags: any
/// positive segment marks the conversation, the first non-empty physician
/// name wins; all-negative clears both fields.
pub fn fold_sor(detections: &[SorDetection]) -> (bool, Option<String>) {
    let detected = detections.iter().any(|d| d.is_sor);
    if !detected {
        return (false, None);
    }
    let physician = detections
        .iter()
        .filter(|d| d.is_sor)
        .find_map(|d| d.physician_name.clone());
    (true, physician)
}

fn titlecase(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_window_join_and_split_boundary() {
        // t, t+3min, and t+9:59 share one conversation...
        let existing = vec![at(0), at(180)];
        assert!(fits_window(&existing, at(599)));

        // ...and t+10:01 opens a new one.
        let existing = vec![at(0), at(180), at(599)];
        assert!(!fits_window(&existing, at(601)));
    }

    #[test]
    fn test_window_exact_boundary_joins() {
        assert!(fits_window(&[at(0)], at(CONVERSATION_WINDOW_SECS)));
        let one_ms_past =
            at(CONVERSATION_WINDOW_SECS) + chrono::Duration::milliseconds(1);
        assert!(!fits_window(&[at(0)], one_ms_past));
    }

    #[test]
    fn test_out_of_order_candidate_extends_backwards() {
        // A candidate older than the first segment also counts against the span.
        let existing = vec![at(300), at(400)];
        assert!(fits_window(&existing, at(0)));
        assert!(!fits_window(&existing, at(-201)));
    }

    #[test]
    fn test_idle_close() {
        assert!(!is_idle(at(0), at(CONVERSATION_IDLE_CLOSE_SECS - 1)));
        assert!(is_idle(at(0), at(CONVERSATION_IDLE_CLOSE_SECS)));
    }

    #[test]
    fn test_suggest_split_greedy() {
        // 0s..9:59 fits one group; 601s past the first timestamp starts
        // another even though it is close to its predecessor.
        let ts = vec![at(0), at(300), at(599), at(601), at(900)];
        let groups = suggest_split(&ts);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![at(0), at(300), at(599)]);
        assert_eq!(groups[1], vec![at(601), at(900)]);
    }

    #[test]
    fn test_sor_detection() {
        let d = detect_sor("Methodist this is Medic 42 requesting orders for Doctor Reynolds");
        assert!(d.is_sor);
        assert_eq!(d.physician_name.as_deref(), Some("Reynolds"));
        assert!(d.confidence >= 0.9);

        let d = detect_sor("patient report, vitals to follow");
        assert!(!d.is_sor);
        assert!(d.physician_name.is_none());
    }

    #[test]
    fn test_sor_fold_first_physician_wins() {
        let detections = vec![
            detect_sor("requesting medical control"),
            detect_sor("go ahead for dr. Chen"),
            detect_sor("confirming with doctor Park"),
        ];
        let (detected, physician) = fold_sor(&detections);
        assert!(detected);
        assert_eq!(physician.as_deref(), Some("Chen"));
    }

    #[test]
    fn test_sor_all_negative_clears() {
        let detections = vec![detect_sor("eta five minutes"), detect_sor("copy that")];
        assert_eq!(fold_sor(&detections), (false, None));
    }
}
