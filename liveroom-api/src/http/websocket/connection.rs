//! One client WebSocket: its outbound queue plus the read and write pumps

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use liveroom_core::config::WebSocketConfig;
use liveroom_core::models::Identity;

use super::hub::ConnectionRegistry;
use super::message::encode;
use super::router::MessageHandler;

pub type ConnectionId = String;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A registered client connection.
///
/// Frames are queued on a bounded channel drained by the write pump. Closing
/// the connection cancels `closed`; the write pump then flushes what is
/// queued, sends a close frame and exits.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<Utf8Bytes>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(identity: Identity, buffer: usize) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let conn = Arc::new(Self {
            id: nanoid::nanoid!(),
            identity,
            outbound,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a frame without waiting
    pub fn send(&self, frame: Utf8Bytes) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn send_event<T: Serialize>(&self, event: &str, data: &T) -> Result<(), SendError> {
        self.send(encode(event, data)?)
    }

    /// Stop accepting frames; idempotent
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("room_id", &self.identity.room_id)
            .field("participant_id", &self.identity.participant_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drive an upgraded socket until either side ends it.
///
/// The connection is registered first. Once the read pump returns it is
/// unregistered, the handler is told about the disconnect and the write pump
/// is given `write_wait` to flush the departure notice and say goodbye.
pub async fn serve(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Utf8Bytes>,
    registry: ConnectionRegistry,
    handler: Arc<dyn MessageHandler>,
    config: WebSocketConfig,
) {
    let (sink, stream) = socket.split();

    info!(
        connection_id = %conn.id(),
        room_id = %conn.identity().room_id,
        participant_id = %conn.identity().participant_id,
        "WebSocket connection established"
    );
    registry.register(Arc::clone(&conn));

    let mut writer = tokio::spawn(write_pump(
        sink,
        outbound,
        Arc::clone(&conn),
        config.write_wait(),
        config.ping_period(),
    ));
    let reader = tokio::spawn(read_pump(
        stream,
        Arc::clone(&conn),
        Arc::clone(&handler),
        config.pong_wait(),
    ));

    if let Err(e) = reader.await {
        error!(connection_id = %conn.id(), error = %e, "Read pump terminated abnormally");
    }

    // The registry closes the queue once `room:user_left` is in it
    registry.unregister(&conn);
    handler.on_disconnect(&conn).await;

    match timeout(config.write_wait(), &mut writer).await {
        Ok(Err(e)) => error!(connection_id = %conn.id(), error = %e, "Write pump terminated abnormally"),
        Err(_) => {
            warn!(connection_id = %conn.id(), "Write pump did not finish in time");
            conn.close();
            writer.abort();
        }
        Ok(Ok(())) => {}
    }
    conn.close();

    info!(
        connection_id = %conn.id(),
        room_id = %conn.identity().room_id,
        participant_id = %conn.identity().participant_id,
        "WebSocket connection closed"
    );
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    handler: Arc<dyn MessageHandler>,
    pong_wait: Duration,
) {
    loop {
        let next = tokio::select! {
            () = conn.closed.cancelled() => break,
            next = timeout(pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(connection_id = %conn.id(), "Read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %conn.id(), error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handler.handle(&conn, text.as_str().as_bytes()).await,
            Message::Binary(data) => handler.handle(&conn, &data).await,
            Message::Close(_) => break,
            // Any frame, pongs included, already reset the deadline
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    conn: Arc<Connection>,
    write_wait: Duration,
    ping_period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            () = conn.closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let written = timeout(write_wait, async {
                    sink.feed(Message::Text(frame)).await?;
                    while let Ok(next) = outbound.try_recv() {
                        sink.feed(Message::Text(next)).await?;
                    }
                    sink.flush().await
                })
                .await;

                if !write_ok(&conn, written) {
                    conn.close();
                    return;
                }
            }
            _ = ticker.tick() => {
                let written = timeout(write_wait, sink.send(Message::Ping(Bytes::new()))).await;
                if !write_ok(&conn, written) {
                    conn.close();
                    return;
                }
            }
        }
    }

    let _ = timeout(write_wait, async {
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(Message::Text(frame)).await?;
        }
        sink.send(Message::Close(None)).await
    })
    .await;
}

fn write_ok(
    conn: &Connection,
    written: Result<Result<(), axum::Error>, tokio::time::error::Elapsed>,
) -> bool {
    match written {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection_id = %conn.id(), error = %e, "WebSocket write error");
            false
        }
        Err(_) => {
            warn!(connection_id = %conn.id(), "WebSocket write timed out");
            false
        }
    }
}
