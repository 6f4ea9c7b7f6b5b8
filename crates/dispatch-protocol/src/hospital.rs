/// Hospital conversation entities and the deterministic conversation id.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A multi-turn EMS-to-hospital exchange on a hospital talkgroup.
/// Invariant: `last_segment_at - first_segment_at` never exceeds 10 min.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalConversation {
    pub id: i64,
    pub conversation_id: String,
    pub talkgroup: String,
    pub hospital_name: String,
    pub status: ConversationStatus,
    pub first_segment_at: DateTime<Utc>,
    pub last_segment_at: DateTime<Utc>,
    pub sor_detected: bool,
    pub sor_physician: Option<String>,
}

/// One transcribed turn inside a conversation. All segments of a
/// conversation share its talkgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalSegment {
    pub id: i64,
    pub conversation_id: String,
    pub sequence_number: u32,
    pub audio_segment_id: String,
    pub transcript: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic id: `CONV-YYYY-MM-DD-<talkgroup>-HHMMSS` at the opening
/// segment's timestamp.
pub fn conversation_id(talkgroup: &str, opened_at: DateTime<Utc>) -> String {
    format!(
        "CONV-{}-{}-{}",
        opened_at.format("%Y-%m-%d"),
        talkgroup,
        opened_at.format("%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_conversation_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 14, 7, 9).unwrap();
        assert_eq!(conversation_id("10255", at), "CONV-2025-03-04-10255-140709");
        assert_eq!(conversation_id("10255", at), conversation_id("10255", at));
    }
}
