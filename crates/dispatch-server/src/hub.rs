/// Live hub: WebSocket fan-out of snapshots, deltas, heartbeats, and
/// alerts.
///
/// Each session owns a bounded outbound queue; all frames for a session
/// flow through its single handler task, which keeps delivery strictly
/// FIFO. A session whose queue overflows is closed with a protocol
/// error — dropping frames silently is not allowed.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dispatch_protocol::live::{ClientFrame, ServerFrame};

use crate::health::HealthCollector;
use crate::state::AppState;

const PONG_DEADLINE: Duration = Duration::from_secs(30);
const INITIAL_SNAPSHOT_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sessions: Mutex<HashMap<u64, mpsc::Sender<ServerFrame>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    health: Arc<HealthCollector>,
}

impl LiveHub {
    pub fn new(queue_capacity: usize, health: Arc<HealthCollector>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_capacity,
                health,
            }),
        }
    }

    fn register(&self) -> (u64, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.inner.sessions.lock().unwrap().remove(&id);
    }

    pub fn session_count(&self) -> u64 {
        self.inner.sessions.lock().unwrap().len() as u64
    }

    /// Fan a frame out to every session. A full queue closes that
    /// session (its sender is dropped; the handler sees the closed
    /// channel and finishes with a protocol error frame).
    pub fn broadcast(&self, frame: &ServerFrame) {
        let mut overflowed = Vec::new();
        {
            let sessions = self.inner.sessions.lock().unwrap();
            for (id, tx) in sessions.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*id),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        for id in overflowed {
            warn!(session = id, "live session outbound queue overflow, closing");
            self.inner
                .health
                .sessions_closed_overflow
                .fetch_add(1, Ordering::Relaxed);
            self.unregister(id);
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(mut socket: WebSocket, state: AppState) {
    let hub = state.inner.hub.clone();
    let (session_id, mut rx) = hub.register();
    info!(session = session_id, "live session connected");

    // Fresh snapshot on every connect; reconnects get no replay.
    let snapshot = match state.inner.store.active_calls(INITIAL_SNAPSHOT_LIMIT) {
        Ok(calls) => ServerFrame::InitialCalls { calls },
        Err(e) => {
            warn!(error = %e, "failed to load initial snapshot");
            ServerFrame::InitialCalls { calls: Vec::new() }
        }
    };
    if send_frame(&mut socket, &snapshot).await.is_err() {
        hub.unregister(session_id);
        return;
    }

    let heartbeat_every = Duration::from_secs(state.inner.config.live_hub.heartbeat_seconds);
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.tick().await; // first tick fires immediately; skip it
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // All hub traffic drains through this one arm: FIFO per session.
            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Hub dropped us: queue overflow. Tell the client why.
                        let _ = send_frame(&mut socket, &ServerFrame::Error {
                            error: "queue_overflow".into(),
                            message: "outbound queue overflow, reconnect for a fresh snapshot".into(),
                        }).await;
                        let _ = socket.send(Message::Close(None)).await;
                        debug!(session = session_id, "session closed after overflow");
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > heartbeat_every + PONG_DEADLINE {
                    warn!(session = session_id, "no pong within deadline, closing session");
                    break;
                }
                if send_frame(&mut socket, &ServerFrame::Heartbeat).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Pong) => last_pong = Instant::now(),
                            Ok(ClientFrame::SearchCalls { query }) => {
                                let results = state
                                    .inner
                                    .store
                                    .search_calls(&query)
                                    .unwrap_or_default();
                                if send_frame(&mut socket, &ServerFrame::SearchResults { results })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(session = session_id, error = %e, "unparseable client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = session_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(session_id);
    info!(session = session_id, "live session disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_protocol::live::StatsSnapshot;

    fn hub(capacity: usize) -> LiveHub {
        LiveHub::new(capacity, Arc::new(HealthCollector::new()))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_sessions() {
        let hub = hub(8);
        let (_id, mut rx) = hub.register();
        assert_eq!(hub.session_count(), 1);

        hub.broadcast(&ServerFrame::Heartbeat);
        assert!(matches!(rx.recv().await, Some(ServerFrame::Heartbeat)));
    }

    #[tokio::test]
    async fn test_frames_stay_fifo_per_session() {
        let hub = hub(8);
        let (_id, mut rx) = hub.register();

        for i in 0..4u64 {
            hub.broadcast(&ServerFrame::StatsUpdate {
                stats: StatsSnapshot {
                    active_calls: i,
                    ..StatsSnapshot::default()
                },
            });
        }
        for i in 0..4u64 {
            let Some(ServerFrame::StatsUpdate { stats }) = rx.recv().await else {
                panic!("expected stats frame");
            };
            assert_eq!(stats.active_calls, i);
        }
    }

    #[tokio::test]
    async fn test_overflow_closes_session_instead_of_dropping() {
        let hub = hub(2);
        let (_id, mut rx) = hub.register();

        hub.broadcast(&ServerFrame::Heartbeat);
        hub.broadcast(&ServerFrame::Heartbeat);
        // Queue full: this one evicts the session.
        hub.broadcast(&ServerFrame::Heartbeat);

        assert_eq!(hub.session_count(), 0);
        // The two queued frames still drain, then the channel closes.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_removes_session() {
        let hub = hub(4);
        let (id, _rx) = hub.register();
        hub.unregister(id);
        assert_eq!(hub.session_count(), 0);
    }
}
