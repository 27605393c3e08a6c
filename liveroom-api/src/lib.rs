// Liveroom API Library
//
// HTTP surface and the realtime WebSocket layer: connection registry,
// connection pumps and the event router bridging clients to the relay.

pub mod http;
pub mod observability;

// Re-export commonly used types
pub use http::{create_router, AppState};
