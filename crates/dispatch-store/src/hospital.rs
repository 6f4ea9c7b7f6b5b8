/// Hospital conversations and their ordered segments.
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use dispatch_protocol::hospital::{ConversationStatus, HospitalConversation, HospitalSegment};

use crate::{from_epoch_ms, to_epoch_ms, CallStore, Result};

impl CallStore {
    pub fn insert_conversation(&self, conv: &HospitalConversation) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hospital_conversations
                 (conversation_id, talkgroup, hospital_name, status,
                  first_segment_at, last_segment_at, sor_detected, sor_physician)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    conv.conversation_id,
                    conv.talkgroup,
                    conv.hospital_name,
                    conv.status.as_str(),
                    to_epoch_ms(conv.first_segment_at),
                    to_epoch_ms(conv.last_segment_at),
                    conv.sor_detected,
                    conv.sor_physician,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn active_conversations(&self, talkgroup: &str) -> Result<Vec<HospitalConversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONV_SELECT} WHERE talkgroup = ?1 AND status = 'active'
                 ORDER BY last_segment_at DESC"
            ))?;
            let rows = stmt.query_map(params![talkgroup], row_to_conversation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<HospitalConversation>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{CONV_SELECT} WHERE conversation_id = ?1"),
                    params![conversation_id],
                    row_to_conversation,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_conversations(&self, limit: u32) -> Result<Vec<HospitalConversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONV_SELECT} ORDER BY last_segment_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_conversation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Append a segment with the next sequence number and widen the
    /// conversation window, all in one transaction.
    pub fn append_conversation_segment(
        &self,
        conversation_id: &str,
        audio_segment_id: &str,
        transcript: &str,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<HospitalSegment> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let next_seq: u32 = tx.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1
                 FROM hospital_segments WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO hospital_segments
                 (conversation_id, sequence_number, audio_segment_id,
                  transcript, confidence, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation_id,
                    next_seq,
                    audio_segment_id,
                    transcript,
                    confidence,
                    to_epoch_ms(timestamp),
                ],
            )?;
            let id = tx.last_insert_rowid();

            let ts_ms = to_epoch_ms(timestamp);
            tx.execute(
                "UPDATE hospital_conversations
                 SET first_segment_at = MIN(first_segment_at, ?2),
                     last_segment_at = MAX(last_segment_at, ?2)
                 WHERE conversation_id = ?1",
                params![conversation_id, ts_ms],
            )?;

            tx.commit()?;

            Ok(HospitalSegment {
                id,
                conversation_id: conversation_id.to_string(),
                sequence_number: next_seq,
                audio_segment_id: audio_segment_id.to_string(),
                transcript: transcript.to_string(),
                confidence,
                timestamp,
            })
        })
    }

    pub fn conversation_segments(&self, conversation_id: &str) -> Result<Vec<HospitalSegment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sequence_number, audio_segment_id,
                        transcript, confidence, timestamp
                 FROM hospital_segments
                 WHERE conversation_id = ?1 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], row_to_segment)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn set_conversation_sor(
        &self,
        conversation_id: &str,
        detected: bool,
        physician: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE hospital_conversations
                 SET sor_detected = ?2, sor_physician = ?3
                 WHERE conversation_id = ?1",
                params![conversation_id, detected, physician],
            )?;
            Ok(())
        })
    }

    /// Complete every active conversation idle since before `cutoff`.
    /// Returns the conversation ids that transitioned.
    pub fn complete_idle_conversations(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM hospital_conversations
                 WHERE status = 'active' AND last_segment_at <= ?1",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![to_epoch_ms(cutoff)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for id in &ids {
                conn.execute(
                    "UPDATE hospital_conversations SET status = 'completed'
                     WHERE conversation_id = ?1",
                    params![id],
                )?;
            }
            Ok(ids)
        })
    }

    /// Conversations whose stored span violates the 10-minute window —
    /// only possible in migrated data; surfaced for split suggestions.
    pub fn overlong_conversations(&self, window_ms: i64) -> Result<Vec<HospitalConversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONV_SELECT} WHERE last_segment_at - first_segment_at > ?1"
            ))?;
            let rows = stmt.query_map(params![window_ms], row_to_conversation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Backfill a hospital segment's transcript once transcription lands.
    /// Returns the owning conversation id so SOR can be recomputed.
    pub fn update_hospital_segment_transcript(
        &self,
        audio_segment_id: &str,
        transcript: &str,
        confidence: f64,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let conversation_id: Option<String> = conn
                .query_row(
                    "SELECT conversation_id FROM hospital_segments WHERE audio_segment_id = ?1",
                    params![audio_segment_id],
                    |row| row.get(0),
                )
                .optional()?;
            if conversation_id.is_some() {
                conn.execute(
                    "UPDATE hospital_segments SET transcript = ?2, confidence = ?3
                     WHERE audio_segment_id = ?1",
                    params![audio_segment_id, transcript, confidence],
                )?;
            }
            Ok(conversation_id)
        })
    }

    /// Conversations with medical-director contact, newest first.
    pub fn sor_conversations(&self, limit: u32) -> Result<Vec<HospitalConversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONV_SELECT} WHERE sor_detected = 1
                 ORDER BY last_segment_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_conversation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn conversation_segment_timestamps(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp FROM hospital_segments
                 WHERE conversation_id = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok(from_epoch_ms(row.get(0)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

const CONV_SELECT: &str = "SELECT id, conversation_id, talkgroup, hospital_name, status,
    first_segment_at, last_segment_at, sor_detected, sor_physician
    FROM hospital_conversations";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<HospitalConversation> {
    let status: String = row.get(4)?;
    Ok(HospitalConversation {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        talkgroup: row.get(2)?,
        hospital_name: row.get(3)?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
        first_segment_at: from_epoch_ms(row.get(5)?),
        last_segment_at: from_epoch_ms(row.get(6)?),
        sor_detected: row.get(7)?,
        sor_physician: row.get(8)?,
    })
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<HospitalSegment> {
    Ok(HospitalSegment {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_number: row.get(2)?,
        audio_segment_id: row.get(3)?,
        transcript: row.get(4)?,
        confidence: row.get(5)?,
        timestamp: from_epoch_ms(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dispatch_protocol::hospital::conversation_id;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap()
    }

    fn conversation(talkgroup: &str, at: DateTime<Utc>) -> HospitalConversation {
        HospitalConversation {
            id: 0,
            conversation_id: conversation_id(talkgroup, at),
            talkgroup: talkgroup.into(),
            hospital_name: "Methodist".into(),
            status: ConversationStatus::Active,
            first_segment_at: at,
            last_segment_at: at,
            sor_detected: false,
            sor_physician: None,
        }
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let store = CallStore::open_in_memory().unwrap();
        let conv = conversation("10255", t0());
        store.insert_conversation(&conv).unwrap();

        let s1 = store
            .append_conversation_segment(&conv.conversation_id, "seg-1", "first", 0.9, t0())
            .unwrap();
        let s2 = store
            .append_conversation_segment(
                &conv.conversation_id,
                "seg-2",
                "second",
                0.8,
                t0() + Duration::minutes(3),
            )
            .unwrap();
        assert_eq!(s1.sequence_number, 1);
        assert_eq!(s2.sequence_number, 2);

        let segments = store.conversation_segments(&conv.conversation_id).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].transcript, "first");

        let stored = store.get_conversation(&conv.conversation_id).unwrap().unwrap();
        assert_eq!(stored.first_segment_at, t0());
        assert_eq!(stored.last_segment_at, t0() + Duration::minutes(3));
    }

    #[test]
    fn test_idle_conversations_complete() {
        let store = CallStore::open_in_memory().unwrap();
        let conv = conversation("10255", t0());
        store.insert_conversation(&conv).unwrap();

        let closed = store
            .complete_idle_conversations(t0() + Duration::minutes(7))
            .unwrap();
        assert_eq!(closed, vec![conv.conversation_id.clone()]);
        let stored = store.get_conversation(&conv.conversation_id).unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Completed);
        assert!(store.active_conversations("10255").unwrap().is_empty());
    }

    #[test]
    fn test_sor_flags_update() {
        let store = CallStore::open_in_memory().unwrap();
        let conv = conversation("10255", t0());
        store.insert_conversation(&conv).unwrap();

        store
            .set_conversation_sor(&conv.conversation_id, true, Some("Chen"))
            .unwrap();
        let stored = store.get_conversation(&conv.conversation_id).unwrap().unwrap();
        assert!(stored.sor_detected);
        assert_eq!(stored.sor_physician.as_deref(), Some("Chen"));

        store
            .set_conversation_sor(&conv.conversation_id, false, None)
            .unwrap();
        let stored = store.get_conversation(&conv.conversation_id).unwrap().unwrap();
        assert!(!stored.sor_detected);
        assert!(stored.sor_physician.is_none());
    }

    #[test]
    fn test_overlong_detection() {
        let store = CallStore::open_in_memory().unwrap();
        let mut conv = conversation("10255", t0());
        conv.last_segment_at = t0() + Duration::minutes(12);
        store.insert_conversation(&conv).unwrap();

        let overlong = store.overlong_conversations(600_000).unwrap();
        assert_eq!(overlong.len(), 1);
    }
}
