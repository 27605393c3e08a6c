mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use liveroom_api::http::websocket::{ConnectionRegistry, EventRouter};
use liveroom_api::AppState;
use liveroom_core::{
    bootstrap::load_config,
    config::WebRtcConfig,
    logging,
    service::{InMemoryEngagement, JwtService},
};
use liveroom_sfu::{RelayManager, SfuConfig};

use server::LiveroomServer;

#[derive(Parser, Debug)]
#[command(name = "liveroom")]
#[command(about = "Liveroom realtime server: room events over WebSocket and a WebRTC relay", long_about = None)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, env = "LIVEROOM_CONFIG_PATH")]
    config: Option<String>,

    /// Override the HTTP listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the HTTP listen port
    #[arg(long)]
    port: Option<u16>,
}

fn sfu_config(webrtc: &WebRtcConfig) -> SfuConfig {
    let udp_port_range = (webrtc.udp_port_min != 0 && webrtc.udp_port_max != 0)
        .then_some((webrtc.udp_port_min, webrtc.udp_port_max));

    SfuConfig {
        ice_servers: webrtc.ice_servers.clone(),
        udp_port_range,
        nat_1to1_ips: webrtc.nat_1to1_ips.clone(),
        signal_buffer: webrtc.signal_buffer,
        max_rooms: webrtc.max_rooms,
        max_peers_per_room: webrtc.max_peers_per_room,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration (validated, fails fast)
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Liveroom server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Token verification
    let jwt = JwtService::from_config(&config.jwt)?;

    // 4. Media relay
    let relay = RelayManager::with_webrtc(sfu_config(&config.webrtc))?;
    info!(
        ice_servers = config.webrtc.ice_servers.len(),
        max_rooms = config.webrtc.max_rooms,
        max_peers_per_room = config.webrtc.max_peers_per_room,
        "Relay manager initialized"
    );

    // 5. Connection registry and event routing
    let registry = ConnectionRegistry::spawn();
    let engagement = Arc::new(InMemoryEngagement::new());
    let router = Arc::new(EventRouter::new(
        registry.clone(),
        Arc::clone(&relay),
        engagement,
    ));

    let state = AppState {
        registry,
        relay,
        router,
        verifier: Arc::new(jwt),
        ws_config: config.websocket.clone(),
    };

    LiveroomServer::new(config, state).start().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfu_config_port_range_needs_both_bounds() {
        let mut webrtc = WebRtcConfig::default();
        webrtc.udp_port_min = 50000;
        webrtc.udp_port_max = 0;
        assert_eq!(sfu_config(&webrtc).udp_port_range, None);

        webrtc.udp_port_max = 50100;
        assert_eq!(sfu_config(&webrtc).udp_port_range, Some((50000, 50100)));
    }

    #[test]
    fn test_args_parse_overrides() {
        let args = Args::parse_from(["liveroom", "--config", "dev.yaml", "--port", "9000"]);
        assert_eq!(args.config.as_deref(), Some("dev.yaml"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.host, None);
    }
}
