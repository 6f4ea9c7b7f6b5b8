/// Read-only HTTP API for the UI layer, plus the `/ws` upgrade.
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use dispatch_protocol::live::SearchQuery;
use dispatch_protocol::rules;

use crate::hub;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/calls/active", get(get_active_calls))
        .route("/api/calls", get(search_calls))
        .route("/api/stats", get(get_stats))
        .route("/api/hospital-calls", get(get_hospital_calls))
        .route(
            "/api/hospital-calls/:id/segments",
            get(get_hospital_segments),
        )
        .route(
            "/api/analytics/medical-director-insights",
            get(get_medical_director_insights),
        )
        .route("/api/alerts/unread", get(get_unread_alerts))
        .route("/api/config", get(get_config))
        .route("/api/config/scanner", get(get_scanner_status))
        .route("/ws", get(hub::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Documented error body: `{error, message}`.
struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            message: message.to_string(),
        }
    }

    fn not_found(message: impl ToString) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

async fn get_active_calls(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let calls = state
        .inner
        .store
        .active_calls(200)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "calls": calls })))
}

#[derive(Debug, Deserialize)]
struct CallSearchParams {
    search: Option<String>,
    call_type: Option<String>,
    talkgroup: Option<String>,
    limit: Option<u32>,
}

async fn search_calls(
    State(state): State<AppState>,
    Query(params): Query<CallSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = SearchQuery {
        text: params.search,
        call_type: params.call_type,
        talkgroup: params.talkgroup,
        limit: params.limit,
    };
    let calls = state
        .inner
        .store
        .search_calls(&query)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "calls": calls })))
}

async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = &state.inner.store;
    let now = Utc::now();
    let stats = state.inner.health.stats_snapshot(
        store.active_call_count().map_err(ApiError::internal)?,
        store.calls_today_count(now).map_err(ApiError::internal)?,
        store.unread_alert_count().map_err(ApiError::internal)?,
        state.inner.hub.session_count(),
    );
    let supervisor = state.inner.supervisor.status().await;
    let health = state
        .inner
        .health
        .health_snapshot(supervisor.running, supervisor.consecutive_failures);
    Ok(Json(json!({ "stats": stats, "health": health })))
}

async fn get_hospital_calls(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conversations = state
        .inner
        .store
        .list_conversations(100)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn get_hospital_segments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .inner
        .store
        .get_conversation(&id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("conversation {id}")))?;
    let segments = state
        .inner
        .store
        .conversation_segments(&id)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "conversation": conversation,
        "segments": segments,
    })))
}

/// SOR activity plus the public-health daily baselines the UI charts.
async fn get_medical_director_insights(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let store = &state.inner.store;
    let sor = store.sor_conversations(50).map_err(ApiError::internal)?;

    let now = Utc::now();
    let today_day = now.timestamp_millis() / 86_400_000;
    let mut trends = Vec::new();
    for call_type in rules::PUBLIC_HEALTH_TYPES {
        let by_day: std::collections::HashMap<i64, u32> = store
            .daily_counts(call_type.as_str(), 31, now)
            .map_err(ApiError::internal)?
            .into_iter()
            .collect();
        let baseline: Vec<u32> = (today_day - 31..today_day - 1)
            .map(|day| by_day.get(&day).copied().unwrap_or(0))
            .collect();
        let yesterday = by_day.get(&(today_day - 1)).copied().unwrap_or(0);
        let z = rules::z_score(&baseline, yesterday);
        trends.push(json!({
            "callType": call_type.as_str(),
            "yesterday": yesterday,
            "zScore": z,
            "isSpike": z.map(|z| rules::classify_spike(z).is_spike).unwrap_or(false),
        }));
    }

    let last_day = store
        .calls_since(now - ChronoDuration::hours(24))
        .map_err(ApiError::internal)?;
    let clusters = rules::geographic_clusters(&last_day);

    Ok(Json(json!({
        "sorConversations": sor,
        "publicHealthTrends": trends,
        "geographicClusters": clusters
            .iter()
            .map(|c| json!({
                "callType": c.call_type.as_str(),
                "clusterCount": c.cluster_count,
                "totalCalls": c.total_calls,
                "severity": c.severity.as_str(),
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn get_unread_alerts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let alerts = state
        .inner
        .store
        .unread_alerts(100)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "alerts": alerts })))
}

/// Sanitized configuration echo (no paths beyond the scanner binary).
async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.inner.config;
    Json(json!({
        "scanner": {
            "listenPort": config.scanner.listen_port,
            "systems": config.scanner.systems,
            "talkgroups": config.scanner.talkgroups,
        },
        "transcription": {
            "concurrency": config.transcription.concurrency,
            "queueCapacity": config.transcription.queue_capacity,
        },
        "hospital": {
            "talkgroups": config.hospital.talkgroups,
            "windowSeconds": config.hospital.window_seconds,
            "closeIdleSeconds": config.hospital.close_idle_seconds,
        },
        "linker": { "windowSeconds": config.linker.window_seconds },
        "liveHub": {
            "heartbeatSeconds": config.live_hub.heartbeat_seconds,
            "queueCapacity": config.live_hub.queue_capacity,
        },
    }))
}

async fn get_scanner_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.inner.supervisor.status().await;
    let log = state.inner.supervisor.recent_log(100);
    Json(json!({ "status": status, "log": log }))
}
