/// Call rows: preliminary inserts, enrichment updates, linker queries,
/// search, and the windowed counts the alert engine scans.
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use dispatch_protocol::call::{AcuityLevel, AudioSegment, Call, CallMetadata, CallStatus};
use dispatch_protocol::live::SearchQuery;
use dispatch_protocol::taxonomy::CallType;

use crate::{from_epoch_ms, to_epoch_ms, CallStore, Result, StoreError};

impl CallStore {
    /// Reserve the monotonic call id as soon as the segment lands. The
    /// row carries the intake placeholder type until transcription.
    pub fn insert_preliminary_call(
        &self,
        segment: &AudioSegment,
        frequency_hz: Option<f64>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calls (audio_segment_id, timestamp, talkgroup, system,
                                    frequency_hz, duration_ms, call_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    segment.id,
                    to_epoch_ms(segment.captured_at),
                    segment.talkgroup,
                    segment.system,
                    frequency_hz,
                    segment.duration_ms,
                    CallType::ScannerAudio.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_call(&self, id: i64) -> Result<Option<Call>> {
        let mut call = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{CALL_SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query_map(params![id], row_to_call)?;
            Ok(rows.next().transpose()?)
        })?;
        if let Some(call) = call.as_mut() {
            call.units = self.unit_ids_for_call(call.id)?;
        }
        Ok(call)
    }

    /// Write the enrichment produced by the transcription pipeline.
    /// Calls that already reached `cleared` or `merged` only accept
    /// metadata changes, so this update skips them.
    pub fn update_enrichment(&self, call: &Call) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE calls
                 SET transcript = ?2, confidence = ?3, call_type = ?4, location = ?5,
                     latitude = ?6, longitude = ?7, keywords = ?8, acuity = ?9,
                     urgency_score = ?10, metadata = ?11, audio_segment_id = ?12
                 WHERE id = ?1 AND status = 'active'",
                params![
                    call.id,
                    call.transcript,
                    call.confidence,
                    call.call_type.as_str(),
                    call.location,
                    call.latitude,
                    call.longitude,
                    serde_json::to_string(&call.keywords)?,
                    call.acuity.as_str(),
                    call.urgency_score,
                    serde_json::to_string(&call.metadata)?,
                    call.audio_segment_id,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Metadata is the only field allowed to change after a terminal
    /// status.
    pub fn update_metadata(&self, call_id: i64, metadata: &CallMetadata) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET metadata = ?2 WHERE id = ?1",
                params![call_id, serde_json::to_string(metadata)?],
            )?;
            Ok(())
        })
    }

    pub fn set_status(&self, call_id: i64, status: CallStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET status = ?2 WHERE id = ?1",
                params![call_id, status.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark a call absorbed by the linker. Idempotent: marking a merged
    /// call again is a no-op, and a call can never merge into itself.
    pub fn mark_merged(&self, call_id: i64, merged_into: i64) -> Result<bool> {
        if call_id == merged_into {
            return Err(StoreError::Invariant(format!(
                "call {call_id} cannot merge into itself"
            )));
        }
        let Some(mut call) = self.get_call(call_id)? else {
            return Err(StoreError::NotFound(format!("call {call_id}")));
        };
        if call.status == CallStatus::Merged {
            return Ok(false);
        }
        call.metadata.merged_into = Some(merged_into);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET status = 'merged', metadata = ?2 WHERE id = ?1",
                params![call_id, serde_json::to_string(&call.metadata)?],
            )?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Listing for the UI: newest first, merged calls excluded.
    pub fn active_calls(&self, limit: u32) -> Result<Vec<Call>> {
        let calls = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CALL_SELECT} WHERE status != 'merged' ORDER BY timestamp DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_call)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        self.attach_units(calls)
    }

    pub fn search_calls(&self, query: &SearchQuery) -> Result<Vec<Call>> {
        let text = query
            .text
            .as_deref()
            .map(|t| format!("%{}%", t.to_lowercase()))
            .unwrap_or_else(|| "%".to_string());
        let call_type = query
            .call_type
            .as_deref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "%".to_string());
        let talkgroup = query
            .talkgroup
            .as_deref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "%".to_string());
        let limit = query.limit.unwrap_or(100).min(500);

        let calls = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CALL_SELECT}
                 WHERE status != 'merged'
                   AND (LOWER(transcript) LIKE ?1 OR LOWER(COALESCE(location, '')) LIKE ?1)
                   AND call_type LIKE ?2
                   AND talkgroup LIKE ?3
                 ORDER BY timestamp DESC LIMIT ?4"
            ))?;
            let rows = stmt.query_map(params![text, call_type, talkgroup, limit], row_to_call)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        self.attach_units(calls)
    }

    /// Linker candidates: same talkgroup, inside the window around the
    /// primary's timestamp, not merged, and not the primary itself.
    pub fn link_candidates(
        &self,
        talkgroup: &str,
        center: DateTime<Utc>,
        window: Duration,
        exclude_id: i64,
    ) -> Result<Vec<Call>> {
        let center_ms = to_epoch_ms(center);
        let window_ms = window.num_milliseconds();
        let calls = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CALL_SELECT}
                 WHERE talkgroup = ?1 AND status != 'merged' AND id != ?2
                   AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp ASC"
            ))?;
            let rows = stmt.query_map(
                params![talkgroup, exclude_id, center_ms - window_ms, center_ms + window_ms],
                row_to_call,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        self.attach_units(calls)
    }

    pub fn count_by_type_since(&self, call_type: &str, since: DateTime<Utc>) -> Result<u32> {
        self.with_conn(|conn| {
            let n: u32 = conn.query_row(
                "SELECT COUNT(*) FROM calls
                 WHERE call_type = ?1 AND timestamp >= ?2 AND status != 'merged'",
                params![call_type, to_epoch_ms(since)],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Non-merged calls since `since`, for duplicate-address and area
    /// scans.
    pub fn calls_since(&self, since: DateTime<Utc>) -> Result<Vec<Call>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CALL_SELECT} WHERE timestamp >= ?1 AND status != 'merged'
                 ORDER BY timestamp DESC"
            ))?;
            let rows = stmt.query_map(params![to_epoch_ms(since)], row_to_call)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Per-day counts of one call type over the trailing `days` days,
    /// oldest day first. Day buckets are UTC.
    pub fn daily_counts(
        &self,
        call_type: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, u32)>> {
        let since = now - Duration::days(i64::from(days));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp / 86400000 AS day, COUNT(*)
                 FROM calls
                 WHERE call_type = ?1 AND timestamp >= ?2 AND status != 'merged'
                 GROUP BY day ORDER BY day ASC",
            )?;
            let rows = stmt.query_map(params![call_type, to_epoch_ms(since)], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn active_call_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 = conn.query_row(
                "SELECT COUNT(*) FROM calls WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn calls_today_count(&self, now: DateTime<Utc>) -> Result<u64> {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        self.with_conn(|conn| {
            let n: u64 = conn.query_row(
                "SELECT COUNT(*) FROM calls WHERE timestamp >= ?1 AND status != 'merged'",
                params![to_epoch_ms(midnight)],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Cascade delete: the call, its unit links, and alerts referencing it.
    pub fn delete_call(&self, call_id: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM call_units WHERE call_id = ?1", params![call_id])?;
            tx.execute(
                "DELETE FROM alerts WHERE related_call_id = ?1",
                params![call_id],
            )?;
            tx.execute("DELETE FROM calls WHERE id = ?1", params![call_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn attach_units(&self, mut calls: Vec<Call>) -> Result<Vec<Call>> {
        for call in calls.iter_mut() {
            call.units = self.unit_ids_for_call(call.id)?;
        }
        Ok(calls)
    }

    pub(crate) fn unit_ids_for_call(&self, call_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT unit_tag_id FROM call_units WHERE call_id = ?1")?;
            let rows = stmt.query_map(params![call_id], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

const CALL_SELECT: &str = "SELECT id, audio_segment_id, timestamp, talkgroup, system,
    frequency_hz, duration_ms, transcript, confidence, call_type, location,
    latitude, longitude, keywords, acuity, urgency_score, status, metadata
    FROM calls";

fn row_to_call(row: &Row<'_>) -> rusqlite::Result<Call> {
    let keywords_json: String = row.get(13)?;
    let metadata_json: String = row.get(17)?;
    let call_type_str: String = row.get(9)?;
    let acuity_str: String = row.get(14)?;
    let status_str: String = row.get(16)?;

    Ok(Call {
        id: row.get(0)?,
        audio_segment_id: row.get(1)?,
        timestamp: from_epoch_ms(row.get(2)?),
        talkgroup: row.get(3)?,
        system: row.get(4)?,
        frequency_hz: row.get(5)?,
        duration_ms: row.get(6)?,
        transcript: row.get(7)?,
        confidence: row.get(8)?,
        call_type: CallType::parse(&call_type_str).unwrap_or(CallType::Unknown),
        location: row.get(10)?,
        latitude: row.get(11)?,
        longitude: row.get(12)?,
        keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
        acuity: AcuityLevel::parse(&acuity_str),
        urgency_score: row.get(15)?,
        status: CallStatus::parse(&status_str).unwrap_or(CallStatus::Active),
        units: Vec::new(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn segment(id: &str, at: DateTime<Utc>) -> AudioSegment {
        AudioSegment {
            id: id.into(),
            blob_path: format!("{id}.wav"),
            content_type: "audio/wav".into(),
            duration_ms: Some(4000),
            sample_rate: Some(8000),
            channels: Some(1),
            talkgroup: "10202".into(),
            system: "metro".into(),
            captured_at: at,
            processed: false,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_preliminary_call_reserves_monotonic_ids() {
        let store = CallStore::open_in_memory().unwrap();
        store.insert_segment(&segment("seg-a", t0())).unwrap();
        store.insert_segment(&segment("seg-b", t0())).unwrap();
        let a = store
            .insert_preliminary_call(&segment("seg-a", t0()), None)
            .unwrap();
        let b = store
            .insert_preliminary_call(&segment("seg-b", t0()), None)
            .unwrap();
        assert!(b > a);

        let call = store.get_call(a).unwrap().unwrap();
        assert_eq!(call.call_type, CallType::ScannerAudio);
        assert_eq!(call.transcript, "");
        assert_eq!(call.status, CallStatus::Active);
    }

    #[test]
    fn test_enrichment_update_and_terminal_freeze() {
        let store = CallStore::open_in_memory().unwrap();
        let id = store
            .insert_preliminary_call(&segment("seg-a", t0()), Some(851_237_500.0))
            .unwrap();

        let mut call = store.get_call(id).unwrap().unwrap();
        call.transcript = "Engine 19, chest pain".into();
        call.confidence = 0.87;
        call.call_type = CallType::ChestPain;
        call.location = Some("1555 South Harding Street".into());
        assert!(store.update_enrichment(&call).unwrap());

        // Once cleared, enrichment writes stop landing.
        store.set_status(id, CallStatus::Cleared).unwrap();
        call.transcript = "rewritten".into();
        assert!(!store.update_enrichment(&call).unwrap());
        let frozen = store.get_call(id).unwrap().unwrap();
        assert_eq!(frozen.transcript, "Engine 19, chest pain");

        // But metadata still changes.
        let mut meta = frozen.metadata.clone();
        meta.shutdown_interrupted = true;
        store.update_metadata(id, &meta).unwrap();
        assert!(store.get_call(id).unwrap().unwrap().metadata.shutdown_interrupted);
    }

    #[test]
    fn test_mark_merged_is_idempotent() {
        let store = CallStore::open_in_memory().unwrap();
        let a = store
            .insert_preliminary_call(&segment("seg-a", t0()), None)
            .unwrap();
        let b = store
            .insert_preliminary_call(&segment("seg-b", t0()), None)
            .unwrap();

        assert!(store.mark_merged(b, a).unwrap());
        assert!(!store.mark_merged(b, a).unwrap()); // no-op the second time

        let merged = store.get_call(b).unwrap().unwrap();
        assert_eq!(merged.status, CallStatus::Merged);
        assert_eq!(merged.metadata.merged_into, Some(a));
        assert!(store.mark_merged(a, a).is_err());
    }

    #[test]
    fn test_active_listing_excludes_merged() {
        let store = CallStore::open_in_memory().unwrap();
        let a = store
            .insert_preliminary_call(&segment("seg-a", t0()), None)
            .unwrap();
        let b = store
            .insert_preliminary_call(&segment("seg-b", t0()), None)
            .unwrap();
        store.mark_merged(b, a).unwrap();

        let listed = store.active_calls(50).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a);

        // Merged calls remain queryable directly.
        assert!(store.get_call(b).unwrap().is_some());
    }

    #[test]
    fn test_link_candidates_window() {
        let store = CallStore::open_in_memory().unwrap();
        let center = t0();
        let a = store
            .insert_preliminary_call(&segment("seg-a", center), None)
            .unwrap();
        store
            .insert_preliminary_call(&segment("seg-b", center + Duration::seconds(12)), None)
            .unwrap();
        store
            .insert_preliminary_call(&segment("seg-c", center + Duration::seconds(301)), None)
            .unwrap();

        let candidates = store
            .link_candidates("10202", center, Duration::seconds(300), a)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].audio_segment_id, "seg-b");
    }

    #[test]
    fn test_search_and_counts() {
        let store = CallStore::open_in_memory().unwrap();
        let id = store
            .insert_preliminary_call(&segment("seg-a", t0()), None)
            .unwrap();
        let mut call = store.get_call(id).unwrap().unwrap();
        call.transcript = "possible overdose at the shelter".into();
        call.call_type = CallType::Overdose;
        store.update_enrichment(&call).unwrap();

        let query = SearchQuery {
            text: Some("Overdose".into()),
            ..SearchQuery::default()
        };
        assert_eq!(store.search_calls(&query).unwrap().len(), 1);

        let n = store
            .count_by_type_since("Overdose", t0() - Duration::hours(2))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_cascade_delete() {
        let store = CallStore::open_in_memory().unwrap();
        let id = store
            .insert_preliminary_call(&segment("seg-a", t0()), None)
            .unwrap();
        let tag = store
            .get_or_create_unit(dispatch_protocol::units::UnitType::Engine, 19)
            .unwrap();
        store.attach_unit(id, tag.id).unwrap();

        store.delete_call(id).unwrap();
        assert!(store.get_call(id).unwrap().is_none());
        assert!(store.unit_ids_for_call(id).unwrap().is_empty());
    }
}
