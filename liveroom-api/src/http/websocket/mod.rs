//! WebSocket endpoint
//!
//! Clients authenticate with a participant token in the query string:
//! `ws://host/ws?token={jwt}` or `ws://host/ws/{room_id}?token={jwt}`.
//! The token fixes the room and participant for the connection's lifetime.

mod connection;
mod hub;
mod message;
mod router;

pub use connection::{serve, Connection, ConnectionId, SendError};
pub use hub::{ConnectionRegistry, HubStats, PresencePayload};
pub use message::{encode, events, ClientEvent, RawEnvelope};
pub use router::{EventRouter, MessageHandler, RouterError};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use liveroom_core::models::{Identity, RoomId};

use crate::http::{AppError, AppResult, AppState};
use crate::observability::metrics;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Participant JWT
    pub token: Option<String>,
}

/// `GET /ws`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let identity = authenticate(&state, query)?;
    Ok(upgrade(state, identity, ws))
}

/// `GET /ws/{room_id}`; the path must name the token's room
pub async fn room_websocket_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let room_id: RoomId = room_id
        .parse()
        .map_err(|_| AppError::bad_request("Invalid room id"))?;

    let identity = authenticate(&state, query)?;
    if identity.room_id != room_id {
        return Err(AppError::forbidden("Token is not valid for this room"));
    }
    Ok(upgrade(state, identity, ws))
}

fn authenticate(state: &AppState, query: WsQuery) -> AppResult<Identity> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::bad_request("Missing token query parameter"))?;

    // Missing room or participant claims come back as InvalidInput (400)
    state.verifier.verify(&token).map_err(|e| {
        debug!(error = %e, "Rejected WebSocket token");
        AppError::from(e)
    })
}

fn upgrade(state: AppState, identity: Identity, ws: WebSocketUpgrade) -> impl IntoResponse {
    let config = state.ws_config.clone();
    let (conn, outbound) = Connection::new(identity, config.send_buffer);
    let handler: Arc<dyn MessageHandler> = state.router.clone();

    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            metrics::WEBSOCKET_CONNECTIONS_TOTAL.inc();
            serve(socket, conn, outbound, state.registry, handler, config).await;
        })
}
