//! Framing strategies.
//!
//! The event loop owns sockets and buffers; a [`Protocol`] decides where one
//! message ends, how the handshake is answered, how a request becomes a
//! response, and how a notification is framed. Three strategies share this
//! seam:
//! - [`JsonProtocol`]: NUL-delimited JSON
//! - [`WebSocketProtocol`]: HTTP upgrade plus WebSocket frames
//! - [`AutoProtocol`]: binds each connection to one of the two above

pub mod dispatch;
pub mod json;
pub mod websocket;

pub use dispatch::AutoProtocol;
pub use json::JsonProtocol;
pub use websocket::WebSocketProtocol;

use jrpc_collections::{Buffer, BufferError};
use jrpc_protocol::{HandlerResult, RpcRequest, RpcResponse};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::connection::Session;
use crate::notify::{NotifyError, NotifyRegistry};

/// Trait implemented by the method router to handle incoming requests.
/// The transport calls this once for every request on an rpc session.
pub trait RequestHandler {
    fn handle_request(&mut self, method: &str, params: &Value) -> HandlerResult;
}

/// What the loop does with a connection after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// Flush what is buffered, then close.
    Close,
}

/// Server state a handshake may consult.
pub struct HandshakeContext<'a> {
    pub(crate) notify: &'a NotifyRegistry,
}

impl<'a> HandshakeContext<'a> {
    pub fn new(notify: &'a NotifyRegistry) -> Self {
        Self { notify }
    }

    pub fn is_declared(&self, service: &str) -> bool {
        self.notify.is_declared(service)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("unsupported protocol '{0}'")]
    UnknownProtocol(String),

    #[error("notify service '{0}' is not registered")]
    UnknownService(String),

    #[error("expected a GET upgrade request, got {0}")]
    NotUpgrade(String),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("unsupported WebSocket version {0}")]
    UnsupportedVersion(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    /// Length of the first complete message at the front of `buf`, or `None`
    /// to wait for more bytes.
    fn message_len(&self, session: &mut Session, buf: &[u8]) -> Option<usize>;

    /// Answer the first message of a connection. On success the session's
    /// kind, protocol name and services are filled in and the acknowledgment
    /// is queued in `response`. On error nothing should be sent.
    fn handle_handshake(
        &self,
        session: &mut Session,
        ctx: &HandshakeContext<'_>,
        message: &[u8],
        response: &mut Buffer,
    ) -> Result<(), HandshakeError>;

    /// Handle one complete message on a handshaked rpc session.
    fn handle_request(
        &self,
        session: &mut Session,
        handler: &mut dyn RequestHandler,
        message: &[u8],
        response: &mut Buffer,
    ) -> Disposition;

    /// Frame a serialized notification for a subscriber.
    fn encode_notification(
        &self,
        session: &Session,
        payload: &[u8],
        out: &mut Buffer,
    ) -> Result<(), NotifyError>;

    /// Called after an oversized request has been dropped.
    fn reject_oversized(&self, _session: &mut Session, _response: &mut Buffer) -> Disposition {
        Disposition::Continue
    }
}

/// Shared request stage: parse, dispatch, serialize. The returned bytes are
/// the response JSON without any framing.
pub(crate) fn process_request(
    handler: &mut dyn RequestHandler,
    message: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let result = RpcRequest::parse(message).and_then(|request| {
        debug!("Request: {}", request.method);
        handler.handle_request(&request.method, &request.params)
    });
    if let Err(e) = &result {
        debug!(code = e.code.code(), "Request failed: {}", e.message);
    }
    serde_json::to_vec(&RpcResponse::from_result(result))
}
