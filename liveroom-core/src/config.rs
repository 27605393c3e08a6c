use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub logging: LoggingConfig,
    pub websocket: WebSocketConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// How long shutdown waits for open connections to go away
    pub drain_timeout_seconds: u64,
    /// Allowed CORS origins; empty allows any origin
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            drain_timeout_seconds: 30,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HS256 shared secret
    pub secret: String,
    pub token_duration_hours: u64,
    pub leeway_seconds: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_duration_hours: 24,
            leeway_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Timings and limits for client WebSocket connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Upper bound for a single write (including a coalesced burst)
    pub write_wait_seconds: u64,
    /// Inactivity window; any inbound frame resets it
    pub pong_wait_seconds: u64,
    /// Keepalive ping interval, must be shorter than `pong_wait_seconds`
    pub ping_period_seconds: u64,
    /// Largest accepted inbound frame in bytes
    pub max_message_size: usize,
    /// Outbound queue capacity per connection
    pub send_buffer: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_wait_seconds: 10,
            pong_wait_seconds: 60,
            ping_period_seconds: 54,
            max_message_size: 512 * 1024,
            send_buffer: 256,
        }
    }
}

impl WebSocketConfig {
    #[must_use]
    pub const fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_seconds)
    }

    #[must_use]
    pub const fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_seconds)
    }

    #[must_use]
    pub const fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_seconds)
    }
}

/// Media relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    /// Ephemeral UDP port range for ICE; 0/0 lets the OS choose
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Public IPs announced as host candidates when running behind NAT
    pub nat_1to1_ips: Vec<String>,
    /// Capacity of each peer's outbound signal queue
    pub signal_buffer: usize,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_min: 0,
            udp_port_max: 0,
            nat_1to1_ips: Vec::new(),
            signal_buffer: 64,
            max_rooms: 0,
            max_peers_per_room: 0,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVEROOM_SERVER__HTTP_PORT, LIVEROOM_JWT__SECRET, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVEROOM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("webrtc.ice_servers")
                .with_list_parse_key("webrtc.nat_1to1_ips")
                .with_list_parse_key("server.allowed_origins")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values the server cannot run with.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.jwt.secret.is_empty() {
            errors.push("jwt.secret must be set".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.websocket.ping_period_seconds == 0
            || self.websocket.ping_period_seconds >= self.websocket.pong_wait_seconds
        {
            errors.push(
                "websocket.ping_period_seconds must be non-zero and below pong_wait_seconds"
                    .to_string(),
            );
        }
        if self.websocket.write_wait_seconds == 0 {
            errors.push("websocket.write_wait_seconds must be non-zero".to_string());
        }
        if self.websocket.max_message_size == 0 {
            errors.push("websocket.max_message_size must be non-zero".to_string());
        }
        if self.websocket.send_buffer == 0 {
            errors.push("websocket.send_buffer must be non-zero".to_string());
        }
        if self.webrtc.signal_buffer == 0 {
            errors.push("webrtc.signal_buffer must be non-zero".to_string());
        }
        if self.webrtc.udp_port_min > self.webrtc.udp_port_max {
            errors.push(format!(
                "webrtc.udp_port_min ({}) exceeds udp_port_max ({})",
                self.webrtc.udp_port_min, self.webrtc.udp_port_max
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
