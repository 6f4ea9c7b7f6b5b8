/// Shared application state handed to every task and axum handler.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use dispatch_protocol::postprocess::PostProcessor;
use dispatch_store::CallStore;

use crate::alert_engine::AlertEngine;
use crate::config::Config;
use crate::geocode::Geocoder;
use crate::grouper::ConversationLocks;
use crate::health::HealthCollector;
use crate::hub::LiveHub;
use crate::supervisor::ScannerSupervisor;
use crate::transcribe::SegmentJob;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub start_time: Instant,
    pub config: Config,
    pub store: Arc<CallStore>,
    pub hub: LiveHub,
    pub health: Arc<HealthCollector>,
    pub supervisor: Arc<ScannerSupervisor>,
    pub alerts: Arc<AlertEngine>,
    pub post_processor: Arc<PostProcessor>,
    pub geocoder: Arc<Geocoder>,
    /// Bounded transcription queue; senders block when it fills, which
    /// is the backpressure the segment source relies on.
    pub segment_tx: mpsc::Sender<SegmentJob>,
    pub audio_dir: PathBuf,
    pub conversation_locks: ConversationLocks,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<CallStore>,
        hub: LiveHub,
        health: Arc<HealthCollector>,
        supervisor: Arc<ScannerSupervisor>,
        alerts: Arc<AlertEngine>,
        post_processor: Arc<PostProcessor>,
        geocoder: Arc<Geocoder>,
        segment_tx: mpsc::Sender<SegmentJob>,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                start_time: Instant::now(),
                config,
                store,
                hub,
                health,
                supervisor,
                alerts,
                post_processor,
                geocoder,
                segment_tx,
                audio_dir,
                conversation_locks: ConversationLocks::default(),
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}
