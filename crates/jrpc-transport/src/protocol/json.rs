//! NUL-delimited JSON framing.

use jrpc_collections::Buffer;
use jrpc_protocol::jsonrpc::strip_terminator;
use jrpc_protocol::{
    HANDSHAKE_OK, HandshakeRequest, SessionKind, complete_message_len, encode_notify_frame,
};
use tracing::error;

use super::{Disposition, HandshakeContext, HandshakeError, Protocol, RequestHandler, process_request};
use crate::connection::Session;
use crate::notify::NotifyError;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProtocol;

impl Protocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn message_len(&self, _session: &mut Session, buf: &[u8]) -> Option<usize> {
        complete_message_len(buf)
    }

    fn handle_handshake(
        &self,
        session: &mut Session,
        ctx: &HandshakeContext<'_>,
        message: &[u8],
        response: &mut Buffer,
    ) -> Result<(), HandshakeError> {
        let request: HandshakeRequest = serde_json::from_slice(strip_terminator(message))
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let kind = request
            .kind()
            .ok_or_else(|| HandshakeError::UnknownProtocol(request.protocol.clone()))?;

        if kind == SessionKind::Notify {
            if let Some(unknown) = request
                .notify_service_names
                .iter()
                .find(|name| !ctx.is_declared(name))
            {
                return Err(HandshakeError::UnknownService(unknown.clone()));
            }
            session.services = request.notify_service_names;
        }

        response.append(HANDSHAKE_OK)?;
        session.kind = Some(kind);
        session.protocol = Some(kind.as_str().to_string());
        Ok(())
    }

    fn handle_request(
        &self,
        _session: &mut Session,
        handler: &mut dyn RequestHandler,
        message: &[u8],
        response: &mut Buffer,
    ) -> Disposition {
        let body = match process_request(handler, message) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize response: {e}");
                return Disposition::Close;
            }
        };
        if let Err(e) = response.append(&body).and_then(|()| response.append(&[0])) {
            error!("Failed to queue response: {e}");
            return Disposition::Close;
        }
        Disposition::Continue
    }

    fn encode_notification(
        &self,
        _session: &Session,
        payload: &[u8],
        out: &mut Buffer,
    ) -> Result<(), NotifyError> {
        out.append(&encode_notify_frame(payload)?)?;
        Ok(())
    }
}
