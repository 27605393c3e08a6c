// HTTP surface: health, stats, metrics and the WebSocket endpoint

pub mod error;
pub mod health;
pub mod websocket;

use std::sync::Arc;

use axum::{http::HeaderValue, middleware, routing::get, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use liveroom_core::config::WebSocketConfig;
use liveroom_core::service::TokenVerifier;
use liveroom_sfu::RelayManager;

use crate::observability::metrics_middleware::metrics_layer;

pub use error::{AppError, AppResult};
use websocket::{ConnectionRegistry, EventRouter};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub relay: Arc<RelayManager>,
    pub router: Arc<EventRouter>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub ws_config: WebSocketConfig,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let router = Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // WebSocket endpoint for real-time events
        .route("/ws", get(websocket::websocket_handler))
        .route("/ws/{room_id}", get(websocket::room_websocket_handler));

    // Apply layers before state
    let router = router
        .layer(middleware::from_fn(metrics_layer))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}
