//! jsonrpc-hub wire formats.
//!
//! This crate holds every byte-level format the server and client agree on:
//! - NUL-terminated JSON-RPC requests and responses ([`jsonrpc`])
//! - the connection handshake ([`handshake`])
//! - `$`-prefixed notification frames ([`notify`])
//! - the WebSocket codec: accept keys, frame headers, masking, close frames
//!   ([`websocket`])
//!
//! Nothing here does I/O.

pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod notify;
pub mod websocket;

pub use error::{RpcError, RpcErrorCode};
pub use handshake::{HANDSHAKE_OK, HandshakeRequest, SessionKind};
pub use jsonrpc::{
    HandlerResult, JSONRPC_VERSION, RpcErrorResponse, RpcRequest, RpcResponse,
    RpcSuccessResponse, complete_message_len,
};
pub use notify::{NotifyFrameError, decode_notify_frame, encode_notify_frame};
pub use websocket::{CloseCode, FrameHeader, OpCode};
