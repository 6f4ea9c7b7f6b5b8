/// Segment source: persistent socket client for the scanner bridge.
///
/// Reads newline-delimited JSON frames, filters against the subscription
/// allow-list, dedupes, normalizes the audio payload into a stored blob,
/// and enqueues transcription work. The bounded queue's `send().await`
/// is the backpressure that pauses socket reads when the pool is behind.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatch_protocol::bridge::{
    ping_frame, AudioPayload, AudioPayloadKind, BridgeCall, BridgeMessage, LegacySubscribe,
    Subscribe,
};
use dispatch_protocol::call::AudioSegment;
use dispatch_protocol::error::PipelineError;

use crate::grouper;
use crate::health::TaskPulse;
use crate::state::AppState;
use crate::transcribe::SegmentJob;

const DEDUPE_CAPACITY: usize = 10_000;
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_secs(2);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// Connect failures before asking the supervisor for a forced restart.
const FAILURES_BEFORE_FORCE_RESTART: u32 = 5;
/// No call/config frame this long after subscribing → retry the legacy
/// subscription shape once.
const SUBSCRIBE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory first dedupe tier, keyed `system|talkgroup|dateTime`.
pub struct DedupeLru {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true when the key was already present.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        false
    }
}

pub async fn run(state: AppState, pulse: TaskPulse, cancel: CancellationToken) {
    let mut dedupe = DedupeLru::new(DEDUPE_CAPACITY);
    let fetcher = reqwest::Client::builder()
        .timeout(URL_FETCH_TIMEOUT)
        .build()
        .unwrap_or_default();

    let mut connect_failures: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        pulse.tick();

        let addr = format!("127.0.0.1:{}", state.inner.config.scanner.listen_port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                connect_failures = 0;
                info!(addr = %addr, "connected to scanner bridge");
                if let Err(e) =
                    run_connection(&state, &mut dedupe, &fetcher, stream, &pulse, &cancel).await
                {
                    warn!(error = %e, "bridge connection ended");
                }
            }
            Err(e) => {
                connect_failures += 1;
                warn!(addr = %addr, error = %e, failures = connect_failures, "bridge connect failed");
                if connect_failures == FAILURES_BEFORE_FORCE_RESTART {
                    info!("requesting supervisor force-restart after repeated connect failures");
                    if let Err(e) = state.inner.supervisor.force_restart().await {
                        warn!(error = %e, "force-restart unavailable");
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        let backoff = RECONNECT_BASE
            .saturating_mul(1u32 << connect_failures.min(4))
            .min(RECONNECT_CAP);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

async fn run_connection(
    state: &AppState,
    dedupe: &mut DedupeLru,
    fetcher: &reqwest::Client,
    stream: TcpStream,
    pulse: &TaskPulse,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let systems = &state.inner.config.scanner.systems;
    let talkgroups = &state.inner.config.scanner.talkgroups;
    let subscribe = serde_json::to_string(&Subscribe::new(systems, talkgroups))?;
    write_half.write_all(subscribe.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let subscribed_at = tokio::time::Instant::now();
    let mut last_read = tokio::time::Instant::now();
    let mut confirmed = false;
    let mut legacy_sent = false;

    loop {
        pulse.tick();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ping.tick() => {
                if last_read.elapsed() > READ_IDLE_TIMEOUT {
                    anyhow::bail!("bridge idle for 60s, reconnecting");
                }
                write_half.write_all(ping_frame().as_bytes()).await?;
                write_half.write_all(b"\n").await?;

                if !confirmed && !legacy_sent && subscribed_at.elapsed() > SUBSCRIBE_CONFIRM_TIMEOUT {
                    debug!("no traffic since subscribing; sending legacy subscription");
                    let legacy = serde_json::to_string(&LegacySubscribe::new(systems, talkgroups))?;
                    write_half.write_all(legacy.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                    legacy_sent = true;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => anyhow::bail!("bridge closed the socket"),
                    Err(e) => return Err(e.into()),
                };
                last_read = tokio::time::Instant::now();
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<BridgeMessage>(&line) {
                    Ok(BridgeMessage::Call(call)) => {
                        confirmed = true;
                        handle_call(state, dedupe, fetcher, call).await;
                    }
                    Ok(BridgeMessage::Config(config)) => {
                        confirmed = true;
                        debug!(config = %config, "bridge config frame");
                    }
                    Ok(BridgeMessage::Pong) => {}
                    Ok(BridgeMessage::Unknown) => {
                        debug!(frame = %line, "unknown bridge frame dropped");
                    }
                    Err(e) => {
                        // Permanent validation failure: skip, never retry.
                        warn!(error = %e, "malformed bridge frame dropped");
                    }
                }
            }
        }
    }
}

async fn handle_call(
    state: &AppState,
    dedupe: &mut DedupeLru,
    fetcher: &reqwest::Client,
    call: BridgeCall,
) {
    // Allow-list filter comes before dedupe.
    let scanner = &state.inner.config.scanner;
    if !scanner.systems.is_empty() && !scanner.systems.contains(&call.system) {
        return;
    }
    if !scanner.talkgroups.is_empty() && !scanner.talkgroups.contains(&call.talkgroup) {
        return;
    }

    let key = call.dedupe_key();
    let segment_id = segment_id_for(&key);
    if dedupe.check_and_insert(&key)
        || state
            .inner
            .store
            .segment_exists(&segment_id)
            .unwrap_or(false)
    {
        state
            .inner
            .health
            .duplicates_dropped
            .fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "duplicate scanner message dropped");
        return;
    }

    let captured_at = call.captured_at().unwrap_or_else(chrono::Utc::now);

    let normalized = match call.audio.as_ref() {
        Some(payload) => match normalize_payload(fetcher, payload).await {
            Ok(normalized) => normalized,
            Err(e) if e.is_transient() => {
                warn!(segment = %segment_id, error = %e, "audio fetch failed, storing metadata only");
                NormalizedAudio::empty()
            }
            Err(e) => {
                warn!(segment = %segment_id, error = %e, "unusable audio payload");
                NormalizedAudio::empty()
            }
        },
        None => NormalizedAudio::empty(),
    };

    let blob_path = if normalized.bytes.is_empty() {
        String::new()
    } else {
        let file_name = format!("{segment_id}.{}", normalized.extension);
        let path = state.inner.audio_dir.join(&file_name);
        match tokio::fs::write(&path, &normalized.bytes).await {
            Ok(()) => file_name,
            Err(e) => {
                error!(segment = %segment_id, error = %e, "failed to persist audio blob");
                String::new()
            }
        }
    };

    let segment = AudioSegment {
        id: segment_id.clone(),
        blob_path,
        content_type: normalized.content_type.to_string(),
        duration_ms: call.duration.map(|s| (s * 1000.0) as u32),
        sample_rate: normalized.sample_rate,
        channels: normalized.channels,
        talkgroup: call.talkgroup.clone(),
        system: call.system.clone(),
        captured_at,
        processed: false,
    };

    if let Err(e) = state.inner.store.insert_segment(&segment) {
        error!(segment = %segment.id, error = %e, "segment insert failed");
        return;
    }
    let call_id = match state
        .inner
        .store
        .insert_preliminary_call(&segment, call.freq)
    {
        Ok(id) => id,
        Err(e) => {
            error!(segment = %segment.id, error = %e, "preliminary call insert failed");
            return;
        }
    };

    state
        .inner
        .health
        .segments_ingested
        .fetch_add(1, Ordering::Relaxed);
    debug!(
        segment = %segment.id,
        call = call_id,
        talkgroup = %segment.talkgroup,
        "segment ingested"
    );

    if state
        .inner
        .config
        .hospital
        .is_hospital_talkgroup(&segment.talkgroup)
    {
        grouper::ingest_segment(state, &segment).await;
    }

    // Blocks when the transcription queue is full: that is the
    // backpressure contract with the bridge.
    let job = SegmentJob {
        segment_id: segment.id.clone(),
        call_id,
        merged: false,
    };
    if state.inner.segment_tx.send(job).await.is_ok() {
        state
            .inner
            .health
            .queue_depth
            .fetch_add(1, Ordering::Relaxed);
    }
}

struct NormalizedAudio {
    bytes: Vec<u8>,
    content_type: &'static str,
    extension: &'static str,
    sample_rate: Option<u32>,
    channels: Option<u16>,
}

impl NormalizedAudio {
    fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            content_type: "audio/wav",
            extension: "wav",
            sample_rate: None,
            channels: None,
        }
    }
}

async fn normalize_payload(
    fetcher: &reqwest::Client,
    payload: &AudioPayload,
) -> Result<NormalizedAudio, PipelineError> {
    let bytes = match payload.classify() {
        AudioPayloadKind::Empty => return Ok(NormalizedAudio::empty()),
        AudioPayloadKind::Url(url) => {
            let resp = fetcher
                .get(url)
                .send()
                .await
                .map_err(|e| PipelineError::Transient(format!("audio fetch: {e}")))?;
            if !resp.status().is_success() {
                return Err(PipelineError::from_status(
                    resp.status().as_u16(),
                    "audio fetch",
                ));
            }
            resp.bytes()
                .await
                .map_err(|e| PipelineError::Transient(format!("audio fetch body: {e}")))?
                .to_vec()
        }
        AudioPayloadKind::Base64(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| PipelineError::Permanent(format!("bad base64 audio: {e}")))?,
        AudioPayloadKind::Raw(bytes) => bytes.to_vec(),
    };
    Ok(classify_container(bytes))
}

/// Known containers persist as-is; anything else is assumed to be raw
/// 8 kHz mono 16-bit PCM and wrapped in a WAV container.
fn classify_container(bytes: Vec<u8>) -> NormalizedAudio {
    if bytes.is_empty() {
        return NormalizedAudio::empty();
    }
    if bytes.starts_with(b"RIFF") {
        return NormalizedAudio {
            bytes,
            content_type: "audio/wav",
            extension: "wav",
            sample_rate: None,
            channels: None,
        };
    }
    if bytes.starts_with(b"ID3") || bytes.first() == Some(&0xFF) {
        return NormalizedAudio {
            bytes,
            content_type: "audio/mpeg",
            extension: "mp3",
            sample_rate: None,
            channels: None,
        };
    }
    if bytes.len() > 11 && &bytes[4..8] == b"ftyp" {
        return NormalizedAudio {
            bytes,
            content_type: "audio/mp4",
            extension: "m4a",
            sample_rate: None,
            channels: None,
        };
    }
    wrap_pcm(bytes)
}

fn wrap_pcm(pcm: Vec<u8>) -> NormalizedAudio {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = std::io::Cursor::new(Vec::new());
    {
        let mut writer = match hound::WavWriter::new(&mut out, spec) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(error = %e, "failed to build WAV container, storing raw");
                return NormalizedAudio {
                    bytes: pcm,
                    content_type: "application/octet-stream",
                    extension: "bin",
                    sample_rate: None,
                    channels: None,
                };
            }
        };
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            if writer.write_sample(sample).is_err() {
                break;
            }
        }
        let _ = writer.finalize();
    }
    NormalizedAudio {
        bytes: out.into_inner(),
        content_type: "audio/wav",
        extension: "wav",
        sample_rate: Some(8000),
        channels: Some(1),
    }
}

/// Stable segment id derived from the dedupe key.
fn segment_id_for(dedupe_key: &str) -> String {
    let sanitized: String = dedupe_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("seg_{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_lru_drops_repeats() {
        let mut lru = DedupeLru::new(3);
        assert!(!lru.check_and_insert("a"));
        assert!(lru.check_and_insert("a"));
        assert!(!lru.check_and_insert("b"));
        assert!(!lru.check_and_insert("c"));
        // "a" evicts once capacity rolls over.
        assert!(!lru.check_and_insert("d"));
        assert!(!lru.check_and_insert("a"));
    }

    #[test]
    fn test_segment_id_is_stable_and_sanitized() {
        let a = segment_id_for("metro|10202|2025-03-04T14:00:00Z");
        let b = segment_id_for("metro|10202|2025-03-04T14:00:00Z");
        assert_eq!(a, b);
        assert!(a.starts_with("seg_"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_raw_pcm_gets_wav_container() {
        let pcm = vec![0u8, 1, 0, 2, 0, 3];
        let normalized = classify_container(pcm);
        assert_eq!(normalized.content_type, "audio/wav");
        assert!(normalized.bytes.starts_with(b"RIFF"));
        assert_eq!(normalized.sample_rate, Some(8000));
    }

    #[test]
    fn test_known_containers_pass_through() {
        let wav = b"RIFF....WAVE".to_vec();
        assert_eq!(classify_container(wav.clone()).bytes, wav);

        let mp3 = vec![0xFFu8, 0xFB, 0x90];
        assert_eq!(classify_container(mp3).content_type, "audio/mpeg");
    }
}
