/// Live-hub WebSocket protocol: text JSON frames, strictly FIFO within a
/// session.
use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::call::Call;

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Snapshot pushed once on connect; reconnects restart from a fresh
    /// snapshot, there is no replay.
    InitialCalls { calls: Vec<Call> },
    /// First successful transcription of a call.
    NewCall { call: Call },
    /// Enrichment or linker updates to an existing call.
    CallUpdate { call: Call },
    StatsUpdate { stats: StatsSnapshot },
    SystemHealth { health: SystemHealthSnapshot },
    /// Sent every 25 s; the client must answer `pong` within 30 s.
    Heartbeat,
    NewAlert { alert: Alert },
    CriticalAlert { alert: Alert },
    SearchResults { results: Vec<Call> },
    /// Terminal protocol error; the session closes after this frame.
    Error { error: String, message: String },
}

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Pong,
    SearchCalls { query: SearchQuery },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub talkgroup: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub active_calls: u64,
    pub calls_today: u64,
    pub segments_ingested: u64,
    pub duplicates_dropped: u64,
    pub transcription_failures: u64,
    pub geocode_cache_hits: u64,
    pub alerts_unread: u64,
    pub live_sessions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub uptime_secs: u64,
    pub scanner_running: bool,
    pub scanner_consecutive_failures: u32,
    pub transcription_queue_depth: u64,
    pub memory_mb: f32,
    pub tasks_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_frame_shape() {
        let json = serde_json::to_string(&ServerFrame::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn test_client_pong_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Pong));
    }

    #[test]
    fn test_search_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"search_calls","query":{"text":"overdose","limit":25}}"#,
        )
        .unwrap();
        let ClientFrame::SearchCalls { query } = frame else {
            panic!("expected search_calls");
        };
        assert_eq!(query.text.as_deref(), Some("overdose"));
        assert_eq!(query.limit, Some(25));
        assert!(query.talkgroup.is_none());
    }

    #[test]
    fn test_error_frame_shape() {
        let json = serde_json::to_value(ServerFrame::Error {
            error: "queue_overflow".into(),
            message: "outbound queue full".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "queue_overflow");
    }
}
