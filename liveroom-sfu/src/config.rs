//! SFU Configuration

use serde::{Deserialize, Serialize};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// STUN/TURN URLs handed to every server-side peer connection
    pub ice_servers: Vec<String>,
    /// Inclusive UDP port range for ICE candidates, `None` = OS assigned
    pub udp_port_range: Option<(u16, u16)>,
    /// Public IPs substituted into host candidates (container/NAT deployments)
    pub nat_1to1_ips: Vec<String>,
    /// Capacity of each peer's outbound signal queue
    pub signal_buffer: usize,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_range: None,
            nat_1to1_ips: Vec::new(),
            signal_buffer: 64,
            max_rooms: 0,
            max_peers_per_room: 0,
        }
    }
}
