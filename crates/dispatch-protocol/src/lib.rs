pub mod alert;
pub mod bridge;
pub mod call;
pub mod classify;
pub mod dictionary;
pub mod error;
pub mod grouper;
pub mod hospital;
pub mod linker;
pub mod live;
pub mod postprocess;
pub mod rules;
pub mod taxonomy;
pub mod units;

/// Protocol version spoken on the live WebSocket.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port the scanner bridge listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 3140;

/// Default port for the live hub + HTTP API.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Hospital conversation window: segments further apart than this can
/// never share a conversation.
pub const CONVERSATION_WINDOW_SECS: i64 = 600;

/// A conversation with no new segment for this long is completed.
pub const CONVERSATION_IDLE_CLOSE_SECS: i64 = 420;

/// Call-linker candidate window (inclusive at exactly the boundary).
pub const LINK_WINDOW_SECS: i64 = 300;

/// Live hub heartbeat cadence and pong deadline.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 25;
pub const PONG_DEADLINE_SECS: u64 = 30;
