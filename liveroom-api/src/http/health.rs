//! Health, stats and metrics endpoints

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use liveroom_sfu::ManagerStats;

use crate::http::AppState;
use crate::observability::metrics;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub rooms: usize,
    pub sfu: ManagerStats,
}

/// Live connection and relay counts
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let hub = state.registry.stats().await;
    let sfu = state.relay.stats().await;
    record_relay(&sfu);

    Json(StatsResponse {
        connections: hub.connections,
        rooms: hub.rooms,
        sfu,
    })
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    record_relay(&state.relay.stats().await);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

/// Relay gauges are sampled on scrape
fn record_relay(sfu: &ManagerStats) {
    metrics::WEBRTC_ROOMS_ACTIVE.set(gauge(sfu.rooms));
    metrics::WEBRTC_PEERS_ACTIVE.set(gauge(sfu.peers));
    metrics::WEBRTC_TRACKS_FORWARDED.set(gauge(sfu.tracks));
}

fn gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
