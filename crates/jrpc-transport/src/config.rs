//! Transport configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// An endpoint to listen on. Several may be active at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listener {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Listener {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }
}

impl std::fmt::Display for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Framing used on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// NUL-delimited JSON only.
    Json,
    /// WebSocket only.
    WebSocket,
    /// Pick per connection from the first bytes received.
    #[default]
    Auto,
}

impl FromStr for ProtocolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown protocol mode '{other}' (expected json, websocket or auto)")),
        }
    }
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Endpoints to bind
    pub listeners: Vec<Listener>,
    /// Framing strategy for accepted connections
    pub mode: ProtocolMode,
    /// Readiness events handled per poll
    pub max_events: usize,
    /// Upper bound on one poll; also paces the after-batch hook
    pub poll_timeout: Duration,
    /// Buffered request bytes at which the pending input is dropped
    pub max_request_len: usize,
    /// Initial capacity of each connection's request and response buffers
    pub initial_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listeners: vec![Listener::tcp("127.0.0.1", 7070)],
            mode: ProtocolMode::Auto,
            max_events: 64,
            poll_timeout: Duration::from_millis(50),
            max_request_len: 100_000_000,
            initial_buffer_size: 8192,
        }
    }
}
