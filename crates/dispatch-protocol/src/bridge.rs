/// Scanner-bridge socket protocol: newline-delimited JSON text frames.
///
/// Inbound messages form a tagged union; unknown variants deserialize to
/// `Unknown` so a bridge upgrade never kills the reader loop.
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum BridgeMessage {
    Call(BridgeCall),
    Config(serde_json::Value),
    Pong,
    #[serde(other)]
    Unknown,
}

/// One call announcement from the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCall {
    pub system: String,
    pub talkgroup: String,
    /// Opaque on the wire; RFC 3339 or epoch seconds in practice. Kept
    /// verbatim for the dedupe key.
    pub date_time: String,
    #[serde(default)]
    pub freq: Option<f64>,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub audio: Option<AudioPayload>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub talkgroup_label: Option<String>,
    #[serde(default)]
    pub system_label: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl BridgeCall {
    /// Dedupe key: `system|talkgroup|dateTime`, verbatim wire values.
    pub fn dedupe_key(&self) -> String {
        format!("{}|{}|{}", self.system, self.talkgroup, self.date_time)
    }

    /// Best-effort capture timestamp: RFC 3339, then epoch seconds.
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.date_time) {
            return Some(ts.with_timezone(&Utc));
        }
        if let Ok(epoch) = self.date_time.parse::<i64>() {
            return Utc.timestamp_opt(epoch, 0).single();
        }
        None
    }
}

/// Audio payload as it appears on the wire: a string (base64 or URL) or a
/// raw byte array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayloadKind<'a> {
    /// Fetched with a 10 s timeout.
    Url(&'a str),
    Base64(&'a str),
    Raw(&'a [u8]),
    /// Stored as a metadata-only segment.
    Empty,
}

impl AudioPayload {
    pub fn classify(&self) -> AudioPayloadKind<'_> {
        match self {
            Self::Text(s) if s.is_empty() => AudioPayloadKind::Empty,
            Self::Text(s) if s.starts_with("http://") || s.starts_with("https://") => {
                AudioPayloadKind::Url(s)
            }
            Self::Text(s) => AudioPayloadKind::Base64(s),
            Self::Bytes(b) if b.is_empty() => AudioPayloadKind::Empty,
            Self::Bytes(b) => AudioPayloadKind::Raw(b),
        }
    }
}

/// Subscription sent right after connect, listing the monitored systems
/// and talkgroups.
#[derive(Debug, Clone, Serialize)]
pub struct Subscribe<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    pub systems: &'a [String],
    pub talkgroups: &'a [String],
}

impl<'a> Subscribe<'a> {
    pub fn new(systems: &'a [String], talkgroups: &'a [String]) -> Self {
        Self {
            kind: "subscribe",
            systems,
            talkgroups,
        }
    }
}

/// Fallback subscription form for bridges that reject the primary shape.
#[derive(Debug, Clone, Serialize)]
pub struct LegacySubscribe<'a> {
    command: &'static str,
    pub filter: LegacyFilter<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegacyFilter<'a> {
    pub systems: &'a [String],
    pub talkgroups: &'a [String],
}

impl<'a> LegacySubscribe<'a> {
    pub fn new(systems: &'a [String], talkgroups: &'a [String]) -> Self {
        Self {
            command: "subscribe",
            filter: LegacyFilter {
                systems,
                talkgroups,
            },
        }
    }
}

/// Heartbeat frame sent every 30 s; the bridge answers with `pong`.
pub fn ping_frame() -> &'static str {
    r#"{"type":"ping"}"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_message_parses() {
        let raw = r#"{"type":"call","data":{"system":"metro","talkgroup":"10202",
            "dateTime":"2025-03-04T14:00:00Z","freq":851237500.0,"duration":4.2,
            "audio":"aGVsbG8=","talkgroupLabel":"Dispatch South"}}"#;
        let msg: BridgeMessage = serde_json::from_str(raw).unwrap();
        let BridgeMessage::Call(call) = msg else {
            panic!("expected call variant");
        };
        assert_eq!(call.dedupe_key(), "metro|10202|2025-03-04T14:00:00Z");
        assert!(call.captured_at().is_some());
        assert!(matches!(
            call.audio.as_ref().unwrap().classify(),
            AudioPayloadKind::Base64("aGVsbG8=")
        ));
    }

    #[test]
    fn test_unknown_messages_do_not_error() {
        let msg: BridgeMessage =
            serde_json::from_str(r#"{"type":"telemetry","data":{"x":1}}"#).unwrap();
        assert!(matches!(msg, BridgeMessage::Unknown));

        let msg: BridgeMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(msg, BridgeMessage::Pong));
    }

    #[test]
    fn test_payload_classification() {
        assert_eq!(
            AudioPayload::Text("https://bridge.local/a.wav".into()).classify(),
            AudioPayloadKind::Url("https://bridge.local/a.wav")
        );
        assert_eq!(
            AudioPayload::Text(String::new()).classify(),
            AudioPayloadKind::Empty
        );
        assert_eq!(
            AudioPayload::Bytes(vec![1, 2]).classify(),
            AudioPayloadKind::Raw(&[1, 2])
        );
        assert_eq!(AudioPayload::Bytes(vec![]).classify(), AudioPayloadKind::Empty);
    }

    #[test]
    fn test_epoch_timestamps_parse() {
        let call = BridgeCall {
            system: "metro".into(),
            talkgroup: "1".into(),
            date_time: "1741096800".into(),
            freq: None,
            duration: None,
            audio: None,
            source: None,
            talkgroup_label: None,
            system_label: None,
            unit: None,
        };
        assert!(call.captured_at().is_some());
    }

    #[test]
    fn test_subscribe_shapes() {
        let systems = vec!["metro".to_string()];
        let talkgroups = vec!["10202".to_string()];
        let json = serde_json::to_value(Subscribe::new(&systems, &talkgroups)).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["talkgroups"][0], "10202");

        let json = serde_json::to_value(LegacySubscribe::new(&systems, &talkgroups)).unwrap();
        assert_eq!(json["command"], "subscribe");
        assert_eq!(json["filter"]["systems"][0], "metro");
    }
}
