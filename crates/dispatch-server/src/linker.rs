/// Call-linker runner: merges dispatches cut across segments.
///
/// Triggered after each call finishes enrichment. The scoring lives in
/// `dispatch_protocol::linker`; this module does the audio concat, the
/// merged-segment persistence, and the row updates, then re-enqueues the
/// merged segment for a fresh transcription pass.
use std::io::Cursor;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use dispatch_protocol::alert::AlertSeverity;
use dispatch_protocol::call::{AudioSegment, Call};
use dispatch_protocol::linker;
use dispatch_protocol::live::ServerFrame;

use crate::alert_engine::fire_system_alert;
use crate::state::AppState;
use crate::transcribe::SegmentJob;

/// Attempt to recover a cut dispatch around `call_id`.
pub async fn try_link(state: &AppState, call_id: i64) {
    let store = &state.inner.store;

    // Serialize with any other component touching this call.
    let lock = store.call_lock(call_id);
    let _guard = lock.lock().await;

    let Ok(Some(primary)) = store.get_call(call_id) else {
        return;
    };
    if primary.is_merged() {
        return;
    }

    let analysis = linker::analyze_completeness(&primary.transcript, primary.location.as_deref());
    if analysis.complete {
        return;
    }
    debug!(
        call = call_id,
        reason = ?analysis.reason,
        confidence = analysis.confidence,
        "incomplete dispatch, searching for link candidates"
    );

    let window = ChronoDuration::seconds(state.inner.config.linker.window_seconds);
    let candidates = match store.link_candidates(
        &primary.talkgroup,
        primary.timestamp,
        window,
        primary.id,
    ) {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(call = call_id, error = %e, "candidate query failed");
            return;
        }
    };

    let selected = linker::select_merge_candidates(&primary, &candidates);
    if selected.is_empty() {
        return;
    }

    merge(state, primary, &selected).await;
}

async fn merge(state: &AppState, primary: Call, absorbed: &[&Call]) {
    let store = &state.inner.store;

    // Invariant: a predecessor that is already merged never merges again.
    let mut eligible: Vec<&Call> = Vec::with_capacity(absorbed.len());
    for candidate in absorbed {
        if candidate.is_merged() || candidate.metadata.merged_into.is_some() {
            warn!(
                call = candidate.id,
                "rejecting merge of an already-merged predecessor"
            );
            fire_system_alert(
                store,
                &state.inner.hub,
                AlertSeverity::Medium,
                "linker-invariant",
                &format!("Call {} was already merged; link skipped", candidate.id),
            );
            continue;
        }
        eligible.push(candidate);
    }
    if eligible.is_empty() {
        return;
    }

    // Concatenate audio in capture order.
    let mut ordered: Vec<&Call> = Vec::with_capacity(eligible.len() + 1);
    ordered.push(&primary);
    ordered.extend(eligible.iter().copied());
    ordered.sort_by_key(|c| c.timestamp);

    let merged_segment_id = {
        let mut rng = rand::thread_rng();
        format!(
            "merged_{}_{:04x}",
            Utc::now().timestamp(),
            rng.gen::<u16>()
        )
    };

    let merged_blob = match concat_audio(state, &ordered).await {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            debug!(call = primary.id, "no audio available to merge");
            Vec::new()
        }
        Err(e) => {
            warn!(call = primary.id, error = %e, "audio concat failed");
            Vec::new()
        }
    };

    let blob_path = if merged_blob.is_empty() {
        String::new()
    } else {
        let file_name = format!("{merged_segment_id}.wav");
        let path = state.inner.audio_dir.join(&file_name);
        if let Err(e) = tokio::fs::write(&path, &merged_blob).await {
            warn!(error = %e, "failed to write merged blob");
            String::new()
        } else {
            file_name
        }
    };

    let earliest = ordered
        .first()
        .map(|c| c.timestamp)
        .unwrap_or(primary.timestamp);
    let merged_segment = AudioSegment {
        id: merged_segment_id.clone(),
        blob_path,
        content_type: "audio/wav".into(),
        duration_ms: ordered.iter().filter_map(|c| c.duration_ms).sum::<u32>().into(),
        sample_rate: Some(8000),
        channels: Some(1),
        talkgroup: primary.talkgroup.clone(),
        system: primary.system.clone(),
        captured_at: earliest,
        processed: false,
    };
    if let Err(e) = store.insert_segment(&merged_segment) {
        warn!(error = %e, "failed to persist merged segment");
        return;
    }

    // Update the surviving call: combined transcript now, full re-run of
    // the pipeline on the merged audio next.
    let mut surviving = primary.clone();
    surviving.metadata.original_segment = Some(primary.audio_segment_id.clone());
    for call in &eligible {
        if !surviving.metadata.linked_calls.contains(&call.id) {
            surviving.metadata.linked_calls.push(call.id);
        }
    }
    surviving.transcript = linker::merge_transcripts(&primary, eligible.as_slice());
    surviving.audio_segment_id = merged_segment_id.clone();
    if let Err(e) = store.update_enrichment(&surviving) {
        warn!(call = surviving.id, error = %e, "merged call update failed");
        return;
    }

    for call in &eligible {
        match store.mark_merged(call.id, surviving.id) {
            Ok(true) => {
                if let Ok(Some(updated)) = store.get_call(call.id) {
                    state
                        .inner
                        .hub
                        .broadcast(&ServerFrame::CallUpdate { call: updated });
                }
            }
            Ok(false) => debug!(call = call.id, "mark_merged was a no-op"),
            Err(e) => warn!(call = call.id, error = %e, "mark_merged failed"),
        }
    }

    if let Ok(Some(updated)) = store.get_call(surviving.id) {
        state
            .inner
            .hub
            .broadcast(&ServerFrame::CallUpdate { call: updated });
    }

    info!(
        call = surviving.id,
        linked = ?surviving.metadata.linked_calls,
        segment = %merged_segment_id,
        "linked cut dispatch"
    );

    // Re-run transcription → post-process → classify → geocode over the
    // merged audio. `merged: true` stops the linker from cascading.
    if !merged_segment.blob_path.is_empty() {
        let job = SegmentJob {
            segment_id: merged_segment_id,
            call_id: surviving.id,
            merged: true,
        };
        if state.inner.segment_tx.send(job).await.is_ok() {
            state
                .inner
                .health
                .queue_depth
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// WAV-aware concatenation: same-format WAV inputs merge at the sample
/// level; anything else falls back to byte appending.
async fn concat_audio(state: &AppState, ordered: &[&Call]) -> std::io::Result<Option<Vec<u8>>> {
    let mut blobs: Vec<Vec<u8>> = Vec::new();
    for call in ordered {
        let Ok(Some(segment)) = state.inner.store.get_segment(&call.audio_segment_id) else {
            continue;
        };
        if segment.blob_path.is_empty() {
            continue;
        }
        let path = state.inner.audio_dir.join(&segment.blob_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => blobs.push(bytes),
            Ok(_) => {}
            Err(e) => warn!(segment = %segment.id, error = %e, "merge input unreadable"),
        }
    }
    if blobs.is_empty() {
        return Ok(None);
    }
    if blobs.len() == 1 {
        return Ok(Some(blobs.remove(0)));
    }

    if blobs.iter().all(|b| b.starts_with(b"RIFF")) {
        if let Some(wav) = concat_wav(&blobs) {
            return Ok(Some(wav));
        }
    }
    Ok(Some(blobs.concat()))
}

fn concat_wav(blobs: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut spec = None;
    let mut samples: Vec<i16> = Vec::new();
    for blob in blobs {
        let mut reader = hound::WavReader::new(Cursor::new(blob)).ok()?;
        let this_spec = reader.spec();
        match spec {
            None => spec = Some(this_spec),
            Some(existing) if existing == this_spec => {}
            // Mixed formats: give up and let the caller byte-concat.
            Some(_) => return None,
        }
        for sample in reader.samples::<i16>() {
            samples.push(sample.ok()?);
        }
    }

    let spec = spec?;
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec).ok()?;
        for sample in &samples {
            writer.write_sample(*sample).ok()?;
        }
        writer.finalize().ok()?;
    }
    Some(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut out, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn test_concat_wav_appends_samples() {
        let a = wav_bytes(&[1, 2, 3]);
        let b = wav_bytes(&[4, 5]);
        let merged = concat_wav(&[a, b]).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(&merged)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_concat_wav_rejects_mixed_specs() {
        let a = wav_bytes(&[1, 2]);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut out, spec).unwrap();
            writer.write_sample(7i16).unwrap();
            writer.finalize().unwrap();
        }
        assert!(concat_wav(&[a, out.into_inner()]).is_none());
    }
}
