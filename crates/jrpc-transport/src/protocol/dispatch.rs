//! Auto-detecting dispatcher.
//!
//! Binds each connection to plain JSON or WebSocket from its first buffered
//! bytes and forwards every call to the bound strategy. The binding is kept
//! in the session and never revisited.

use jrpc_collections::Buffer;

use super::{
    Disposition, HandshakeContext, HandshakeError, JsonProtocol, Protocol, RequestHandler,
    WebSocketProtocol,
};
use crate::connection::{Session, Wire};
use crate::notify::NotifyError;

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoProtocol {
    json: JsonProtocol,
    websocket: WebSocketProtocol,
}

impl AutoProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire implied by the first bytes of a stream, or `None` until there
    /// are enough of them.
    pub fn detect(buf: &[u8]) -> Option<Wire> {
        match buf {
            [] | [b'\n'] => None,
            [b'{', ..] | [b'\n', b'{', ..] => Some(Wire::Json),
            _ => Some(Wire::WebSocket),
        }
    }

    fn bound(&self, session: &Session) -> &dyn Protocol {
        match session.wire {
            Some(Wire::Json) => &self.json,
            _ => &self.websocket,
        }
    }
}

impl Protocol for AutoProtocol {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn message_len(&self, session: &mut Session, buf: &[u8]) -> Option<usize> {
        if session.wire.is_none() {
            session.wire = Some(Self::detect(buf)?);
        }
        self.bound(session).message_len(session, buf)
    }

    fn handle_handshake(
        &self,
        session: &mut Session,
        ctx: &HandshakeContext<'_>,
        message: &[u8],
        response: &mut Buffer,
    ) -> Result<(), HandshakeError> {
        self.bound(session).handle_handshake(session, ctx, message, response)
    }

    fn handle_request(
        &self,
        session: &mut Session,
        handler: &mut dyn RequestHandler,
        message: &[u8],
        response: &mut Buffer,
    ) -> Disposition {
        self.bound(session).handle_request(session, handler, message, response)
    }

    fn encode_notification(
        &self,
        session: &Session,
        payload: &[u8],
        out: &mut Buffer,
    ) -> Result<(), NotifyError> {
        self.bound(session).encode_notification(session, payload, out)
    }

    fn reject_oversized(&self, session: &mut Session, response: &mut Buffer) -> Disposition {
        self.bound(session).reject_oversized(session, response)
    }
}
