//! Connection handshake types.
//!
//! The first message on a plain connection picks the session kind:
//! `{"protocol": "rpc"}` for request/response traffic, or
//! `{"protocol": "notify", "notifyServiceNames": [...]}` to subscribe to
//! server-pushed notifications. The server answers [`HANDSHAKE_OK`] or
//! closes the connection.

use serde::{Deserialize, Serialize};

/// Literal acknowledgment of an accepted plain handshake.
pub const HANDSHAKE_OK: &[u8] = b"handshake OK\r\n";

/// What a connection does once handshaked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// One response per request.
    Rpc,
    /// Receive-only subscription to notify services.
    Notify,
}

impl SessionKind {
    /// Match a protocol name, ignoring ASCII case.
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("rpc") {
            Some(Self::Rpc)
        } else if name.eq_ignore_ascii_case("notify") {
            Some(Self::Notify)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    #[serde(
        rename = "notifyServiceNames",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub notify_service_names: Vec<String>,
}

impl HandshakeRequest {
    pub fn rpc() -> Self {
        Self {
            protocol: SessionKind::Rpc.as_str().into(),
            notify_service_names: Vec::new(),
        }
    }

    pub fn notify<S: Into<String>>(services: impl IntoIterator<Item = S>) -> Self {
        Self {
            protocol: SessionKind::Notify.as_str().into(),
            notify_service_names: services.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> Option<SessionKind> {
        SessionKind::parse(&self.protocol)
    }
}
