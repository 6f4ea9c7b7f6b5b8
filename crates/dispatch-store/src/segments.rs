/// Audio segment rows. The segment source is the only writer; everyone
/// downstream treats them read-only apart from the `processed` flag.
use rusqlite::{params, Row};

use dispatch_protocol::call::AudioSegment;

use crate::{from_epoch_ms, to_epoch_ms, CallStore, Result};

impl CallStore {
    pub fn insert_segment(&self, segment: &AudioSegment) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO audio_segments
                 (id, blob_path, content_type, duration_ms, sample_rate, channels,
                  talkgroup, system, captured_at, processed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    segment.id,
                    segment.blob_path,
                    segment.content_type,
                    segment.duration_ms,
                    segment.sample_rate,
                    segment.channels,
                    segment.talkgroup,
                    segment.system,
                    to_epoch_ms(segment.captured_at),
                    segment.processed,
                ],
            )?;
            Ok(())
        })
    }

    /// Second dedupe tier behind the in-memory LRU.
    pub fn segment_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audio_segments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_segment(&self, id: &str) -> Result<Option<AudioSegment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, blob_path, content_type, duration_ms, sample_rate, channels,
                        talkgroup, system, captured_at, processed
                 FROM audio_segments WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], row_to_segment)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn mark_segment_processed(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE audio_segments SET processed = 1 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn segment_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: u64 =
                conn.query_row("SELECT COUNT(*) FROM audio_segments", [], |row| row.get(0))?;
            Ok(n)
        })
    }
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<AudioSegment> {
    Ok(AudioSegment {
        id: row.get(0)?,
        blob_path: row.get(1)?,
        content_type: row.get(2)?,
        duration_ms: row.get(3)?,
        sample_rate: row.get(4)?,
        channels: row.get(5)?,
        talkgroup: row.get(6)?,
        system: row.get(7)?,
        captured_at: from_epoch_ms(row.get(8)?),
        processed: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn segment(id: &str) -> AudioSegment {
        AudioSegment {
            id: id.into(),
            blob_path: format!("{id}.wav"),
            content_type: "audio/wav".into(),
            duration_ms: Some(2500),
            sample_rate: Some(8000),
            channels: Some(1),
            talkgroup: "10202".into(),
            system: "metro".into(),
            captured_at: Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap(),
            processed: false,
        }
    }

    #[test]
    fn test_duplicate_insert_keeps_one_row() {
        let store = CallStore::open_in_memory().unwrap();
        store.insert_segment(&segment("seg-a")).unwrap();
        store.insert_segment(&segment("seg-a")).unwrap();
        assert_eq!(store.segment_count().unwrap(), 1);
        assert!(store.segment_exists("seg-a").unwrap());
        assert!(!store.segment_exists("seg-b").unwrap());
    }

    #[test]
    fn test_processed_flag_round_trip() {
        let store = CallStore::open_in_memory().unwrap();
        store.insert_segment(&segment("seg-a")).unwrap();
        assert!(!store.get_segment("seg-a").unwrap().unwrap().processed);
        store.mark_segment_processed("seg-a").unwrap();
        assert!(store.get_segment("seg-a").unwrap().unwrap().processed);
    }
}
