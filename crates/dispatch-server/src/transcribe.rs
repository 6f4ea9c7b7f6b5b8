/// Transcription worker pool.
///
/// A bounded pool consumes the segment queue; each worker owns one
/// segment end-to-end (transcribe → post-process → classify → geocode →
/// unit-tag → store write → hub notify). Failures never kill a worker:
/// every job runs in its own task and the worker reinitializes after at
/// most a second.
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatch_protocol::classify;
use dispatch_protocol::error::PipelineError;
use dispatch_protocol::live::ServerFrame;
use dispatch_protocol::taxonomy::CallType;

use crate::health::TaskPulse;
use crate::state::AppState;
use crate::{grouper, linker};

const RETRY_LIMIT: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const WORKER_REINIT_DELAY: Duration = Duration::from_secs(1);
/// Consecutive engine failures before a dependency alert fires.
const FAILURES_BEFORE_ALERT: u64 = 5;

/// One unit of transcription work. `merged` jobs re-process a linker
/// output and never trigger another linking pass.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub segment_id: String,
    pub call_id: i64,
    pub merged: bool,
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub utterance: String,
    pub confidence: f64,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

/// Seam to the external speech-to-text engine.
pub trait SpeechToText: Send + Sync + 'static {
    fn transcribe(
        &self,
        audio: Vec<u8>,
        segment_id: &str,
    ) -> impl Future<Output = Result<Transcription, PipelineError>> + Send;
}

/// HTTP provider: POSTs the audio bytes, expects
/// `{utterance, confidence, start_ms?, end_ms?}`.
pub struct HttpSpeechToText {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSpeechToText {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint,
        }
    }
}

impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        segment_id: &str,
    ) -> Result<Transcription, PipelineError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-segment-id", segment_id)
            .header("content-type", "application/octet-stream")
            .body(audio)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    PipelineError::Transient(format!("transcription engine: {e}"))
                } else {
                    PipelineError::Dependency(format!("transcription engine: {e}"))
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(PipelineError::from_status(status, "transcription engine"));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Permanent(format!("bad transcription body: {e}")))?;
        parse_transcription_body(&body)
    }
}

fn parse_transcription_body(body: &serde_json::Value) -> Result<Transcription, PipelineError> {
    let utterance = body
        .get("utterance")
        .or_else(|| body.get("text"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::Permanent("transcription body missing utterance".into()))?
        .to_string();
    let confidence = body
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    Ok(Transcription {
        utterance,
        confidence,
        start_ms: body.get("start_ms").and_then(|v| v.as_u64()),
        end_ms: body.get("end_ms").and_then(|v| v.as_u64()),
    })
}

/// Run `concurrency` workers until the queue closes or the token fires.
pub async fn run_pool<T: SpeechToText>(
    state: AppState,
    engine: Arc<T>,
    rx: mpsc::Receiver<SegmentJob>,
    pulse: TaskPulse,
    cancel: CancellationToken,
) {
    let concurrency = state.inner.config.transcription.concurrency.max(1);
    let rx = Arc::new(Mutex::new(rx));
    info!(workers = concurrency, "transcription pool starting");

    let mut handles = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        let state = state.clone();
        let engine = Arc::clone(&engine);
        let rx = Arc::clone(&rx);
        let pulse = pulse.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, state, engine, rx, pulse, cancel).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    info!("transcription pool stopped");
}

async fn worker_loop<T: SpeechToText>(
    worker_id: usize,
    state: AppState,
    engine: Arc<T>,
    rx: Arc<Mutex<mpsc::Receiver<SegmentJob>>>,
    pulse: TaskPulse,
    cancel: CancellationToken,
) {
    loop {
        pulse.tick();
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(job) = job else {
            debug!(worker = worker_id, "transcription worker exiting");
            return;
        };
        state.inner.health.queue_depth.fetch_sub(1, Ordering::Relaxed);

        // Per-job isolation: a panic surfaces as a JoinError here instead
        // of taking the worker down.
        let task = {
            let state = state.clone();
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            let job = job.clone();
            tokio::spawn(async move { process_job(state, engine, job, cancel).await })
        };
        match task.await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    worker = worker_id,
                    segment = %job.segment_id,
                    error = %e,
                    "transcription job crashed"
                );
                tokio::time::sleep(WORKER_REINIT_DELAY).await;
            }
        }
    }
}

async fn process_job<T: SpeechToText>(
    state: AppState,
    engine: Arc<T>,
    job: SegmentJob,
    cancel: CancellationToken,
) {
    let store = &state.inner.store;

    let segment = match store.get_segment(&job.segment_id) {
        Ok(Some(segment)) => segment,
        Ok(None) => {
            warn!(segment = %job.segment_id, "segment vanished before transcription");
            return;
        }
        Err(e) => {
            error!(segment = %job.segment_id, error = %e, "failed to load segment");
            return;
        }
    };

    if segment.blob_path.is_empty() {
        // Metadata-only segment: nothing to transcribe.
        let _ = store.mark_segment_processed(&segment.id);
        return;
    }

    let blob_path = state.inner.audio_dir.join(&segment.blob_path);
    let audio = match tokio::fs::read(&blob_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(segment = %segment.id, error = %e, "audio blob unreadable, skipping");
            finalize_failed(&state, &job, "blob unreadable").await;
            return;
        }
    };

    let timeout = Duration::from_secs(state.inner.config.transcription.timeout_seconds);
    let transcription = tokio::select! {
        result = transcribe_with_retries(engine.as_ref(), audio, &segment.id, timeout) => result,
        _ = cancel.cancelled() => {
            finalize_interrupted(&state, &job).await;
            return;
        }
    };

    match transcription {
        Ok(t) => {
            state
                .inner
                .health
                .transcription_consecutive_failures
                .store(0, Ordering::Relaxed);
            enrich_and_publish(&state, &job, &segment.talkgroup, t, &cancel).await;
        }
        Err(e) => {
            state
                .inner
                .health
                .transcription_failures
                .fetch_add(1, Ordering::Relaxed);
            let failures = state
                .inner
                .health
                .transcription_consecutive_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            warn!(segment = %segment.id, error = %e, "transcription failed");
            if e.is_transient() && failures == FAILURES_BEFORE_ALERT {
                crate::alert_engine::fire_system_alert(
                    store,
                    &state.inner.hub,
                    dispatch_protocol::alert::AlertSeverity::High,
                    "transcription-engine",
                    "Speech-to-text engine is failing repeatedly",
                );
            }
            finalize_failed(&state, &job, &e.to_string()).await;
        }
    }
}

async fn transcribe_with_retries<T: SpeechToText>(
    engine: &T,
    audio: Vec<u8>,
    segment_id: &str,
    timeout: Duration,
) -> Result<Transcription, PipelineError> {
    let mut last_err = PipelineError::Dependency("no attempt made".into());
    for attempt in 0..=RETRY_LIMIT {
        let result = tokio::time::timeout(timeout, engine.transcribe(audio.clone(), segment_id))
            .await
            .map_err(|_| PipelineError::Transient("transcription timed out".into()))
            .and_then(|r| r);
        match result {
            Ok(t) => return Ok(t),
            Err(e) if e.is_transient() && attempt < RETRY_LIMIT => {
                debug!(segment = segment_id, attempt, error = %e, "retrying transcription");
                last_err = e;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Post-process, classify, geocode, unit-tag, persist, notify.
async fn enrich_and_publish(
    state: &AppState,
    job: &SegmentJob,
    talkgroup: &str,
    transcription: Transcription,
    cancel: &CancellationToken,
) {
    let store = &state.inner.store;
    let output = state
        .inner
        .post_processor
        .process(&transcription.utterance, transcription.confidence);
    let classification = classify::classify(&output);

    let Ok(Some(mut call)) = store.get_call(job.call_id) else {
        warn!(call = job.call_id, "call row missing during enrichment");
        return;
    };
    let was_placeholder = call.call_type == CallType::ScannerAudio;

    call.transcript = output.cleaned.clone();
    call.confidence = output.confidence;
    call.call_type = classification.call_type;
    call.keywords = classification.keywords.clone();
    call.location = classification.location.clone();
    call.acuity = classification.acuity;
    call.urgency_score = classification.urgency_score;
    call.metadata.parse_errors = output.parse_errors;
    call.metadata.noise = output.is_noise;
    call.metadata.hallucination = output.is_hallucination;
    if job.merged {
        call.audio_segment_id = job.segment_id.clone();
    }

    // Geocode only real locations; rejects cleared their location above.
    if let Some(location) = call.location.clone() {
        let geocoded = tokio::select! {
            result = state.inner.geocoder.geocode(&location) => result,
            _ = cancel.cancelled() => None,
        };
        if let Some(result) = geocoded {
            call.latitude = Some(result.latitude);
            call.longitude = Some(result.longitude);
        } else {
            call.latitude = None;
            call.longitude = None;
        }
    } else {
        call.latitude = None;
        call.longitude = None;
    }

    if let Err(e) = store.update_enrichment(&call) {
        error!(call = call.id, error = %e, "enrichment write failed");
        return;
    }

    // Unit tagger: attach (type, number) pairs, creating tags on demand.
    for (unit_type, unit_number) in &output.units {
        match store.get_or_create_unit(*unit_type, *unit_number) {
            Ok(tag) => {
                if let Err(e) = store.attach_unit(call.id, tag.id) {
                    warn!(call = call.id, error = %e, "unit attach failed");
                } else if !call.units.contains(&tag.id) {
                    call.units.push(tag.id);
                }
            }
            Err(e) => warn!(call = call.id, error = %e, "unit tag lookup failed"),
        }
    }

    let _ = store.mark_segment_processed(&job.segment_id);
    state
        .inner
        .health
        .calls_transcribed
        .fetch_add(1, Ordering::Relaxed);

    // Hospital talkgroups also feed the conversation grouper.
    if state
        .inner
        .config
        .hospital
        .is_hospital_talkgroup(talkgroup)
    {
        match store.update_hospital_segment_transcript(
            &job.segment_id,
            &call.transcript,
            call.confidence,
        ) {
            Ok(Some(conversation_id)) => grouper::refresh_sor(state, &conversation_id),
            Ok(None) => {}
            Err(e) => warn!(segment = %job.segment_id, error = %e, "hospital transcript update failed"),
        }
    }

    let frame = if was_placeholder && !job.merged {
        ServerFrame::NewCall { call: call.clone() }
    } else {
        ServerFrame::CallUpdate { call: call.clone() }
    };
    state.inner.hub.broadcast(&frame);

    state.inner.alerts.evaluate_call(&call);

    if !job.merged {
        linker::try_link(state, call.id).await;
    }
}

async fn finalize_failed(state: &AppState, job: &SegmentJob, reason: &str) {
    let store = &state.inner.store;
    if let Ok(Some(mut call)) = store.get_call(job.call_id) {
        call.metadata.transcription_failed = true;
        call.metadata
            .extra
            .insert("failure".into(), serde_json::Value::String(reason.into()));
        let _ = store.update_metadata(call.id, &call.metadata);
    }
    let _ = store.mark_segment_processed(&job.segment_id);
}

/// Shutdown overtook this job: flag the call so operators can tell an
/// interrupted transcription from a failed one.
async fn finalize_interrupted(state: &AppState, job: &SegmentJob) {
    let store = &state.inner.store;
    if let Ok(Some(mut call)) = store.get_call(job.call_id) {
        call.metadata.shutdown_interrupted = true;
        let _ = store.update_metadata(call.id, &call.metadata);
    }
    info!(call = job.call_id, "transcription interrupted by shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct ScriptedEngine {
        calls: AtomicU32,
        failures_before_success: u32,
        transient: bool,
    }

    impl SpeechToText for ScriptedEngine {
        async fn transcribe(
            &self,
            _audio: Vec<u8>,
            _segment_id: &str,
        ) -> Result<Transcription, PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if n < self.failures_before_success {
                if self.transient {
                    Err(PipelineError::Transient("flaky".into()))
                } else {
                    Err(PipelineError::Permanent("bad audio".into()))
                }
            } else {
                Ok(Transcription {
                    utterance: "Engine 19 chest pain".into(),
                    confidence: 0.9,
                    start_ms: None,
                    end_ms: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_up_to_limit() {
        let engine = ScriptedEngine {
            calls: AtomicU32::new(0),
            failures_before_success: 2,
            transient: true,
        };
        let result =
            transcribe_with_retries(&engine, vec![0u8; 4], "seg", Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert_eq!(engine.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let engine = ScriptedEngine {
            calls: AtomicU32::new(0),
            failures_before_success: 1,
            transient: false,
        };
        let result =
            transcribe_with_retries(&engine, vec![0u8; 4], "seg", Duration::from_secs(5)).await;
        assert!(result.is_err());
        assert_eq!(engine.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_body_parsing_accepts_text_alias() {
        let body = serde_json::json!({"text": "medic 4 responding", "confidence": 1.7});
        let t = parse_transcription_body(&body).unwrap();
        assert_eq!(t.utterance, "medic 4 responding");
        assert_eq!(t.confidence, 1.0); // clamped

        let bad = serde_json::json!({"confidence": 0.4});
        assert!(parse_transcription_body(&bad).is_err());
    }
}
