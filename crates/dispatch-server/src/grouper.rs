/// Hospital-conversation grouper runner.
///
/// Segments on hospital talkgroups join an active conversation when the
/// 10-minute window allows, otherwise open a new one. Membership
/// decisions hold a per-talkgroup lock so two segments racing in cannot
/// both open a conversation. Transcripts arrive later (after
/// transcription), which re-runs SOR detection for the conversation.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dispatch_protocol::call::AudioSegment;
use dispatch_protocol::grouper as rules;
use dispatch_protocol::hospital::{conversation_id, ConversationStatus, HospitalConversation};

use crate::alert_engine::WarnOnce;
use crate::health::TaskPulse;
use crate::state::AppState;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Per-talkgroup membership locks. Conversations never span talkgroups,
/// so locking the talkgroup covers every conversation a segment could
/// join.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    fn for_talkgroup(&self, talkgroup: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(talkgroup.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Route a new hospital segment into a conversation.
pub async fn ingest_segment(state: &AppState, segment: &AudioSegment) {
    let lock = state
        .inner
        .conversation_locks
        .for_talkgroup(&segment.talkgroup);
    let _guard = lock.lock().await;

    let store = &state.inner.store;
    let active = match store.active_conversations(&segment.talkgroup) {
        Ok(active) => active,
        Err(e) => {
            warn!(talkgroup = %segment.talkgroup, error = %e, "conversation query failed");
            return;
        }
    };

    for conversation in &active {
        let window = [conversation.first_segment_at, conversation.last_segment_at];
        if rules::fits_window(&window, segment.captured_at) {
            match store.append_conversation_segment(
                &conversation.conversation_id,
                &segment.id,
                "",
                0.0,
                segment.captured_at,
            ) {
                Ok(appended) => {
                    debug!(
                        conversation = %conversation.conversation_id,
                        sequence = appended.sequence_number,
                        "segment joined conversation"
                    );
                }
                Err(e) => {
                    warn!(conversation = %conversation.conversation_id, error = %e, "append failed")
                }
            }
            return;
        }
    }

    // No active conversation accepts this segment: open a new one.
    let conversation = HospitalConversation {
        id: 0,
        conversation_id: conversation_id(&segment.talkgroup, segment.captured_at),
        talkgroup: segment.talkgroup.clone(),
        hospital_name: state.inner.config.hospital.hospital_name(&segment.talkgroup),
        status: ConversationStatus::Active,
        first_segment_at: segment.captured_at,
        last_segment_at: segment.captured_at,
        sor_detected: false,
        sor_physician: None,
    };
    if let Err(e) = store.insert_conversation(&conversation) {
        warn!(conversation = %conversation.conversation_id, error = %e, "open failed");
        return;
    }
    if let Err(e) = store.append_conversation_segment(
        &conversation.conversation_id,
        &segment.id,
        "",
        0.0,
        segment.captured_at,
    ) {
        warn!(conversation = %conversation.conversation_id, error = %e, "first append failed");
        return;
    }
    info!(
        conversation = %conversation.conversation_id,
        talkgroup = %segment.talkgroup,
        "opened hospital conversation"
    );
}

/// Re-run SOR detection over every segment of a conversation. Any
/// positive segment marks the conversation; the first non-empty
/// physician name wins; all-negative clears both fields.
pub fn refresh_sor(state: &AppState, conversation_id: &str) {
    let store = &state.inner.store;
    let segments = match store.conversation_segments(conversation_id) {
        Ok(segments) => segments,
        Err(e) => {
            warn!(conversation = conversation_id, error = %e, "segment fetch failed");
            return;
        }
    };
    let detections: Vec<_> = segments
        .iter()
        .filter(|s| !s.transcript.is_empty())
        .map(|s| rules::detect_sor(&s.transcript))
        .collect();
    let (detected, physician) = rules::fold_sor(&detections);
    if let Err(e) = store.set_conversation_sor(conversation_id, detected, physician.as_deref()) {
        warn!(conversation = conversation_id, error = %e, "SOR update failed");
    } else if detected {
        info!(
            conversation = conversation_id,
            physician = physician.as_deref().unwrap_or("unknown"),
            "service-on-request detected"
        );
    }
}

/// Background sweep: close idle conversations and surface any stored
/// conversation whose span violates the window (migrated data only).
pub async fn run_sweep(state: AppState, pulse: TaskPulse, cancel: CancellationToken) {
    let warned = WarnOnce::default();
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    info!("hospital grouper sweep started");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }
        pulse.tick();

        let close_idle = ChronoDuration::seconds(state.inner.config.hospital.close_idle_seconds);
        let cutoff = Utc::now() - close_idle;
        match state.inner.store.complete_idle_conversations(cutoff) {
            Ok(closed) if !closed.is_empty() => {
                info!(count = closed.len(), "completed idle hospital conversations");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "idle close failed"),
        }

        let window_ms = state.inner.config.hospital.window_seconds * 1000;
        match state.inner.store.overlong_conversations(window_ms) {
            Ok(overlong) => {
                for conversation in overlong {
                    if !warned.first_time(&conversation.conversation_id) {
                        continue;
                    }
                    let timestamps = state
                        .inner
                        .store
                        .conversation_segment_timestamps(&conversation.conversation_id)
                        .unwrap_or_default();
                    let split = rules::suggest_split(&timestamps);
                    warn!(
                        conversation = %conversation.conversation_id,
                        groups = split.len(),
                        "conversation exceeds the 10-minute window; split suggested"
                    );
                }
            }
            Err(e) => warn!(error = %e, "overlong scan failed"),
        }
    }
}
