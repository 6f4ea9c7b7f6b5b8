/// End-to-end scenarios over the pure pipeline: post-process → classify,
/// linker scoring, conversation grouping, and spike statistics.
use chrono::{DateTime, TimeZone, Utc};

use dispatch_protocol::call::{AcuityLevel, Call, CallMetadata, CallStatus};
use dispatch_protocol::classify::classify;
use dispatch_protocol::grouper;
use dispatch_protocol::linker;
use dispatch_protocol::postprocess::PostProcessor;
use dispatch_protocol::rules;
use dispatch_protocol::taxonomy::CallType;
use dispatch_protocol::units::UnitType;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap()
}

fn call_at(id: i64, offset_secs: i64, talkgroup: &str, transcript: &str) -> Call {
    Call {
        id,
        audio_segment_id: format!("seg-{id}"),
        timestamp: base_time() + chrono::Duration::seconds(offset_secs),
        talkgroup: talkgroup.into(),
        system: "metro".into(),
        frequency_hz: None,
        duration_ms: Some(3500),
        transcript: transcript.into(),
        confidence: 0.9,
        call_type: CallType::ScannerAudio,
        location: None,
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
fn address_extraction_after_units() {
    let out = PostProcessor::default()
        .process("Engine 19, 1555 South Harding Street, Chest Pain", 0.9);
    let classified = classify(&out);

    assert_eq!(
        out.address.as_ref().map(|a| a.text.as_str()),
        Some("1555 South Harding Street")
    );
    assert!(out.units.contains(&(UnitType::Engine, 19)));
    assert_eq!(classified.call_type, CallType::ChestPain);
    assert!(classified.urgency_score >= 0.8);
    assert!(out.confidence >= 0.85);
}

#[test]
fn comma_joined_number_address() {
    let out = PostProcessor::default()
        .process("Engine 995, Medic 73, 10,301, Terminal Way, sick person", 0.9);
    let classified = classify(&out);

    assert_eq!(
        out.address.as_ref().map(|a| a.text.as_str()),
        Some("10301 Terminal Way")
    );
    assert_eq!(out.units, vec![(UnitType::Medic, 73)]);
    assert_eq!(classified.call_type, CallType::SickPerson);
}

#[test]
fn noise_rejection_clamps_confidence() {
    let out = PostProcessor::default()
        .process("{beeping} for more videos visit youtube.com", 0.97);

    assert!(out.is_hallucination);
    assert_eq!(out.confidence, 0.1);
    assert_eq!(out.call_type, Some(CallType::NonEmergency));
    assert!(out.address.is_none());
}

#[test]
fn postprocess_is_idempotent_on_cleaned_text() {
    let p = PostProcessor::default();
    let first = p.process("Engine 19,  1555 South Harding Street, cedar", 0.9);
    let second = p.process(&first.cleaned, first.confidence);
    assert_eq!(first.cleaned, second.cleaned);
}

#[test]
fn cut_dispatch_links_across_segments() {
    let first = call_at(10, 0, "10202", "Engine 26, Medic 26");
    let second = call_at(11, 12, "10202", "7212 US 31 South, Chest Pain");

    let analysis = linker::analyze_completeness(&first.transcript, first.location.as_deref());
    assert!(!analysis.complete);

    let selected = linker::select_merge_candidates(&first, std::slice::from_ref(&second));
    assert_eq!(selected.len(), 1);

    let merged = linker::merge_transcripts(&first, &selected);
    assert!(merged.contains("Engine 26, Medic 26"));
    assert!(merged.contains("7212 US 31 South, Chest Pain"));
}

#[test]
fn linker_window_boundary() {
    let first = call_at(20, 0, "10202", "Engine 26, Medic 26");
    let at_window = call_at(21, 300, "10202", "7212 US 31 South, Chest Pain");
    assert!(linker::within_link_window(first.timestamp, at_window.timestamp));

    let mut past_window = call_at(22, 300, "10202", "7212 US 31 South, Chest Pain");
    past_window.timestamp += chrono::Duration::milliseconds(1);
    assert!(!linker::within_link_window(first.timestamp, past_window.timestamp));
}

#[test]
fn hospital_grouping_windows() {
    // Three segments inside the 10-minute window share a conversation.
    let mut members = vec![base_time()];
    assert!(grouper::fits_window(&members, base_time() + chrono::Duration::minutes(3)));
    members.push(base_time() + chrono::Duration::minutes(3));

    let third = base_time() + chrono::Duration::seconds(9 * 60 + 59);
    assert!(grouper::fits_window(&members, third));
    members.push(third);

    // A fourth at t+10:01 opens a new conversation.
    let fourth = base_time() + chrono::Duration::seconds(10 * 60 + 1);
    assert!(!grouper::fits_window(&members, fourth));
}

#[test]
fn overdose_spike_is_critical() {
    // 30 days of quiet history, then five overdoses in one day.
    let history: Vec<u32> = (0..30).map(|d| u32::from(d % 5 == 0) + 1).collect();
    let z = rules::z_score(&history, 5).expect("nonzero variance");
    let verdict = rules::classify_spike(z);
    assert!(verdict.is_spike);
    assert!(verdict.alert_severity.is_some());
}
