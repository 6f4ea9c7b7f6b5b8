/// Core entities: audio segments, enriched calls, unit tags.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::taxonomy::CallType;
use crate::units::UnitType;

/// A single audio recording pulled from the scanner bridge; the unit of
/// transcription. Immutable once stored except for `processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    pub id: String,
    /// Blob path relative to the audio directory; empty for
    /// metadata-only segments (zero-length payloads kept for tracking).
    pub blob_path: String,
    pub content_type: String,
    pub duration_ms: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub talkgroup: String,
    pub system: String,
    pub captured_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Cleared,
    Merged,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cleared => "cleared",
            Self::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "cleared" => Some(Self::Cleared),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// Acuity letter: A is the highest severity, C the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcuityLevel {
    A,
    B,
    C,
    Unknown,
}

impl AcuityLevel {
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            _ => None,
        }
    }

    pub fn from_spoken(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "alpha" => Some(Self::A),
            "bravo" => Some(Self::B),
            "charlie" => Some(Self::C),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "a" | "A" => Self::A,
            "b" | "B" => Self::B,
            "c" | "C" => Self::C,
            _ => Self::Unknown,
        }
    }
}

/// Open metadata map carried on every call: linkage info, error flags,
/// shutdown markers. Typed fields for the keys the pipeline writes, with
/// a flattened remainder for anything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Surviving call id, set when this call was absorbed by the linker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<i64>,
    /// Ids absorbed into this call by the linker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_calls: Vec<i64>,
    /// Audio segment the call referenced before a merge replaced it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_segment: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parse_errors: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub noise: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hallucination: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shutdown_interrupted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transcription_failed: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// The enriched representation of a single dispatch transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: i64,
    pub audio_segment_id: String,
    pub timestamp: DateTime<Utc>,
    pub talkgroup: String,
    pub system: String,
    pub frequency_hz: Option<f64>,
    pub duration_ms: Option<u32>,
    pub transcript: String,
    /// In [0, 1]; clamped to 0.1 for noise/hallucination rejects.
    pub confidence: f64,
    pub call_type: CallType,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub keywords: Vec<String>,
    pub acuity: AcuityLevel,
    pub urgency_score: f64,
    pub status: CallStatus,
    /// Attached unit tag ids.
    pub units: Vec<i64>,
    pub metadata: CallMetadata,
}

impl Call {
    /// Latitude and longitude are either both present or both absent.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.status == CallStatus::Merged
    }
}

/// A dispatchable unit, unique by (unit_type, unit_number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTag {
    pub id: i64,
    pub unit_type: UnitType,
    pub unit_number: u16,
    pub display_name: String,
    pub color: String,
    pub active: bool,
}

impl UnitTag {
    pub fn display_name_for(unit_type: UnitType, unit_number: u16) -> String {
        format!("{} {}", unit_type.display_name(), unit_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_pairing() {
        let mut call = sample_call();
        assert!(call.coordinates().is_none());
        call.latitude = Some(39.77);
        assert!(call.coordinates().is_none());
        call.longitude = Some(-86.15);
        assert_eq!(call.coordinates(), Some((39.77, -86.15)));
    }

    #[test]
    fn test_metadata_round_trip_keeps_extra_keys() {
        let mut meta = CallMetadata::default();
        meta.linked_calls = vec![4, 9];
        meta.extra
            .insert("source".into(), serde_json::json!("bridge"));
        let json = serde_json::to_string(&meta).unwrap();
        let back: CallMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.linked_calls, vec![4, 9]);
        assert_eq!(back.extra["source"], "bridge");
        assert!(!back.shutdown_interrupted);
    }

    #[test]
    fn test_acuity_parsing() {
        assert_eq!(AcuityLevel::from_letter('b'), Some(AcuityLevel::B));
        assert_eq!(AcuityLevel::from_spoken("Charlie"), Some(AcuityLevel::C));
        assert_eq!(AcuityLevel::from_letter('x'), None);
        assert_eq!(AcuityLevel::parse("zzz"), AcuityLevel::Unknown);
    }

    fn sample_call() -> Call {
        Call {
            id: 1,
            audio_segment_id: "seg-1".into(),
            timestamp: Utc::now(),
            talkgroup: "10202".into(),
            system: "metro".into(),
            frequency_hz: None,
            duration_ms: Some(4200),
            transcript: String::new(),
            confidence: 0.0,
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
}
