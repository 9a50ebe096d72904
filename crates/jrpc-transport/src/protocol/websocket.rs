//! WebSocket framing.
//!
//! The opening message is an HTTP upgrade request; the `json` subprotocol
//! makes an rpc session and `notify` a subscription whose services are named
//! by the last path segment (`/clock+stats`). After the upgrade every
//! message is a run of client frames ending in a final frame, and each text
//! message goes through the same request stage as plain JSON.

use std::fmt::Write as _;

use jrpc_collections::Buffer;
use jrpc_protocol::SessionKind;
use jrpc_protocol::websocket::{
    CloseCode, FrameHeader, OpCode, WS_VERSION, accept_key, apply_mask, close_frame, encode_header,
};
use tracing::{debug, error};

use super::{Disposition, HandshakeContext, HandshakeError, Protocol, RequestHandler, process_request};
use crate::connection::{ConnState, Session};
use crate::notify::NotifyError;

const MAX_HEADERS: usize = 64;
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Advertised when the client offers no subprotocol we speak.
const ALL_SUBPROTOCOLS: &str = "json, notify";

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketProtocol;

impl Protocol for WebSocketProtocol {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn message_len(&self, session: &mut Session, buf: &[u8]) -> Option<usize> {
        if session.state != ConnState::Handshaked {
            return upgrade_request_len(buf);
        }

        let mut offset = 0;
        loop {
            let header = FrameHeader::parse(&buf[offset..])?;
            if !header.is_masked() {
                // rejected as a whole by the request stage
                return Some(buf.len());
            }
            let end = offset.checked_add(header.frame_len()?)?;
            if end > buf.len() {
                return None;
            }
            if header.fin {
                return Some(end);
            }
            offset = end;
        }
    }

    fn handle_handshake(
        &self,
        session: &mut Session,
        ctx: &HandshakeContext<'_>,
        message: &[u8],
        response: &mut Buffer,
    ) -> Result<(), HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(message) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HandshakeError::Malformed("incomplete HTTP request".into()));
            }
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        }

        let method = request.method.unwrap_or_default();
        if method != "GET" {
            return Err(HandshakeError::NotUpgrade(method.to_string()));
        }
        let header = |name: &str| find_header(&request.headers[..], name);

        let (kind, subprotocol) = match header("Sec-WebSocket-Protocol") {
            // no header echoed: RFC 6455 clients fail on a subprotocol they did not offer
            None => (SessionKind::Rpc, None),
            Some(offered) => offered
                .split(',')
                .map(str::trim)
                .find_map(subprotocol_kind)
                .map(|(kind, name)| (kind, Some(name)))
                .unwrap_or((SessionKind::Rpc, Some(ALL_SUBPROTOCOLS))),
        };

        let mut services = Vec::new();
        if kind == SessionKind::Notify {
            services = service_names(request.path.unwrap_or_default());
            if let Some(unknown) = services.iter().find(|name| !ctx.is_declared(name)) {
                return Err(HandshakeError::UnknownService(unknown.clone()));
            }
        }

        match header("Sec-WebSocket-Version") {
            Some(WS_VERSION) => {}
            Some(other) => return Err(HandshakeError::UnsupportedVersion(other.to_string())),
            None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version")),
        }
        let key = header("Sec-WebSocket-Key")
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

        let mut reply = String::from(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n",
        );
        let _ = write!(reply, "Sec-WebSocket-Accept: {}\r\n", accept_key(key));
        if let Some(name) = subprotocol {
            let _ = write!(reply, "Sec-WebSocket-Protocol: {name}\r\n");
        }
        reply.push_str("\r\n");
        response.append(reply.as_bytes())?;

        session.kind = Some(kind);
        session.protocol = Some(match kind {
            SessionKind::Rpc => "json".to_string(),
            SessionKind::Notify => "notify".to_string(),
        });
        session.services = services;
        Ok(())
    }

    fn handle_request(
        &self,
        _session: &mut Session,
        handler: &mut dyn RequestHandler,
        message: &[u8],
        response: &mut Buffer,
    ) -> Disposition {
        let Some(first) = FrameHeader::parse(message) else {
            return close(response, CloseCode::ProtocolError, "truncated frame");
        };
        if !first.is_masked() {
            return close(response, CloseCode::ProtocolError, "client frames must be masked");
        }

        if first.fin {
            match first.opcode {
                OpCode::Text => {}
                OpCode::Binary => {
                    return close(response, CloseCode::UnsupportedData, "binary messages are not supported");
                }
                OpCode::Close => {
                    debug!("Close frame received");
                    return close(response, CloseCode::Normal, "");
                }
                OpCode::Ping => {
                    let payload = unmasked_payload(message, &first);
                    return send(response, OpCode::Pong, &payload);
                }
                OpCode::Pong => return Disposition::Continue,
                OpCode::Continuation => {
                    return close(response, CloseCode::InvalidPayload, "continuation without a message");
                }
                OpCode::Reserved(_) => {
                    return close(response, CloseCode::ProtocolError, "reserved opcode");
                }
            }
        } else {
            match first.opcode {
                OpCode::Text => {}
                OpCode::Continuation => {
                    return close(response, CloseCode::InvalidPayload, "continuation without a message");
                }
                OpCode::Binary => {
                    return close(response, CloseCode::UnsupportedData, "binary messages are not supported");
                }
                _ => return close(response, CloseCode::ProtocolError, "fragmented control frame"),
            }
        }

        let payload = match reassemble(message) {
            Ok(payload) => payload,
            Err((code, reason)) => return close(response, code, reason),
        };
        if std::str::from_utf8(&payload).is_err() {
            return close(response, CloseCode::InvalidPayload, "text message is not valid UTF-8");
        }

        match process_request(handler, &payload) {
            Ok(body) => send(response, OpCode::Text, &body),
            Err(e) => {
                error!("Failed to serialize response: {e}");
                close(response, CloseCode::InternalError, "internal error")
            }
        }
    }

    fn encode_notification(
        &self,
        _session: &Session,
        payload: &[u8],
        out: &mut Buffer,
    ) -> Result<(), NotifyError> {
        out.append(&encode_header(OpCode::Text, payload.len()))?;
        out.append(payload)?;
        Ok(())
    }

    fn reject_oversized(&self, session: &mut Session, response: &mut Buffer) -> Disposition {
        if session.state == ConnState::Handshaked {
            close(response, CloseCode::MessageTooBig, "message too big")
        } else {
            Disposition::Close
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn upgrade_request_len(buf: &[u8]) -> Option<usize> {
    if buf.len() >= 3 && !buf.starts_with(b"GET") {
        // not an upgrade; hand it over so the handshake refuses it
        return Some(buf.len());
    }
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

fn find_header<'h>(headers: &[httparse::Header<'h>], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

fn subprotocol_kind(offered: &str) -> Option<(SessionKind, &'static str)> {
    if offered.eq_ignore_ascii_case("json") {
        Some((SessionKind::Rpc, "json"))
    } else if offered.eq_ignore_ascii_case("notify") {
        Some((SessionKind::Notify, "notify"))
    } else {
        None
    }
}

/// `/a/b/clock+stats?x=1` -> `["clock", "stats"]`
fn service_names(path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    last.split('+')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn unmasked_payload(frame: &[u8], header: &FrameHeader) -> Vec<u8> {
    let end = header.frame_len().unwrap_or(frame.len()).min(frame.len());
    let mut payload = frame[header.header_len.min(end)..end].to_vec();
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask);
    }
    payload
}

/// Concatenate the unmasked payloads of a frame run. Every frame after the
/// first must be a masked continuation.
fn reassemble(message: &[u8]) -> Result<Vec<u8>, (CloseCode, &'static str)> {
    let mut payload = Vec::new();
    let mut offset = 0;
    while offset < message.len() {
        let header = FrameHeader::parse(&message[offset..])
            .ok_or((CloseCode::ProtocolError, "truncated frame"))?;
        if !header.is_masked() {
            return Err((CloseCode::ProtocolError, "client frames must be masked"));
        }
        if offset > 0 && header.opcode != OpCode::Continuation {
            return Err((CloseCode::InvalidPayload, "expected a continuation frame"));
        }
        let len = header
            .frame_len()
            .ok_or((CloseCode::MessageTooBig, "message too big"))?;
        payload.extend_from_slice(&unmasked_payload(&message[offset..], &header));
        offset += len;
        if header.fin {
            break;
        }
    }
    Ok(payload)
}

fn send(response: &mut Buffer, opcode: OpCode, payload: &[u8]) -> Disposition {
    let queued = response
        .append(&encode_header(opcode, payload.len()))
        .and_then(|()| response.append(payload));
    if let Err(e) = queued {
        error!("Failed to queue frame: {e}");
        return Disposition::Close;
    }
    Disposition::Continue
}

fn close(response: &mut Buffer, code: CloseCode, reason: &str) -> Disposition {
    debug!("Closing WebSocket with {}: {reason}", code.code());
    if let Err(e) = response.append(&close_frame(code, reason)) {
        error!("Failed to queue close frame: {e}");
    }
    Disposition::Close
}

