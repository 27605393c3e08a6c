//! Prometheus metrics for Liveroom
//!
//! HTTP request metrics, WebSocket connection tracking, registry fan-out
//! drops and relay room/peer counts.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// --- HTTP Metrics ---

/// Total HTTP requests, labeled by method, path, and status code.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )
    .expect("failed to create http_requests_total")
});

/// HTTP request duration in seconds, labeled by method and path.
pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "path"],
    )
    .expect("failed to create http_request_duration_seconds")
});

// --- WebSocket Metrics ---

/// Connections currently registered with the connection registry.
pub static WEBSOCKET_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "websocket_connections_active",
        "Number of active WebSocket connections",
    )
    .expect("failed to create websocket_connections_active")
});

/// Total WebSocket connections opened.
pub static WEBSOCKET_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "websocket_connections_total",
        "Total number of WebSocket connections opened",
    )
    .expect("failed to create websocket_connections_total")
});

/// Frames dropped because a connection's outbound queue was full.
pub static WEBSOCKET_FRAMES_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "websocket_frames_dropped_total",
        "Frames dropped for slow WebSocket consumers",
    )
    .expect("failed to create websocket_frames_dropped_total")
});

/// Inbound events processed, labeled by event name and outcome.
pub static WEBSOCKET_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("websocket_events_total", "Inbound WebSocket events by outcome"),
        &["event", "outcome"],
    )
    .expect("failed to create websocket_events_total")
});

// --- Room Metrics ---

/// Rooms with at least one registered connection.
pub static ROOMS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("rooms_active", "Number of rooms with connected participants")
        .expect("failed to create rooms_active")
});

// --- WebRTC Metrics ---

/// Relay rooms currently held by the relay manager.
pub static WEBRTC_ROOMS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("webrtc_rooms_active", "Number of active relay rooms")
        .expect("failed to create webrtc_rooms_active")
});

/// Number of active WebRTC peer connections.
pub static WEBRTC_PEERS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "webrtc_peers_active",
        "Number of active WebRTC peer connections",
    )
    .expect("failed to create webrtc_peers_active")
});

/// Tracks currently forwarded by the relay.
pub static WEBRTC_TRACKS_FORWARDED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("webrtc_tracks_forwarded", "Number of forwarded media tracks")
        .expect("failed to create webrtc_tracks_forwarded")
});

/// Register all metrics with the registry.
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("failed to register http_requests_total");
    registry
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("failed to register http_request_duration_seconds");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS_ACTIVE.clone()))
        .expect("failed to register websocket_connections_active");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS_TOTAL.clone()))
        .expect("failed to register websocket_connections_total");
    registry
        .register(Box::new(WEBSOCKET_FRAMES_DROPPED_TOTAL.clone()))
        .expect("failed to register websocket_frames_dropped_total");
    registry
        .register(Box::new(WEBSOCKET_EVENTS_TOTAL.clone()))
        .expect("failed to register websocket_events_total");
    registry
        .register(Box::new(ROOMS_ACTIVE.clone()))
        .expect("failed to register rooms_active");
    registry
        .register(Box::new(WEBRTC_ROOMS_ACTIVE.clone()))
        .expect("failed to register webrtc_rooms_active");
    registry
        .register(Box::new(WEBRTC_PEERS_ACTIVE.clone()))
        .expect("failed to register webrtc_peers_active");
    registry
        .register(Box::new(WEBRTC_TRACKS_FORWARDED.clone()))
        .expect("failed to register webrtc_tracks_forwarded");
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a request path for metric labels.
///
/// Room ids in `/ws/{room_id}` are collapsed to avoid high-cardinality labels.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let mut result = Vec::with_capacity(segments.len());

    for (i, segment) in segments.iter().enumerate() {
        let prev = if i > 0 { segments.get(i - 1) } else { None };
        if !segment.is_empty() && prev == Some(&"ws") {
            result.push(":room_id");
        } else {
            result.push(segment);
        }
    }

    result.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/ws/42"), "/ws/:room_id");
        assert_eq!(normalize_path("/ws"), "/ws");
        assert_eq!(normalize_path("/api/stats"), "/api/stats");
    }

    #[test]
    fn test_gather_contains_registered_metrics() {
        WEBSOCKET_CONNECTIONS_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("websocket_connections_total"));
        assert!(text.contains("webrtc_peers_active"));
    }
}
