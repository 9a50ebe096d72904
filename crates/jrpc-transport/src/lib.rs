//! jsonrpc-hub Transport Layer
//!
//! A single-threaded, readiness-driven server for NUL-delimited JSON-RPC over
//! TCP and Unix domain sockets. The transport layer handles:
//! - Connection lifecycle (accept, handshake, request, half-close, teardown)
//! - Framing strategies: plain JSON, WebSocket, or auto-detected per connection
//! - Notify subscriptions and server-pushed notifications
//! - Backpressure and oversized-request policies
//!
//! The transport is decoupled from method dispatch via the [`RequestHandler`]
//! trait, and from application callbacks via [`Hooks`].

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use client::{ClientError, Endpoint, NotifyClient, RpcClient};
pub use config::{Listener, ProtocolMode, TransportConfig};
pub use connection::{ConnState, ConnectionId, PeerAddr, Session, Wire};
pub use error::TransportError;
pub use hooks::{Hooks, NoHooks};
pub use notify::{NotifyError, NotifyHandle, NotifyRegistry, Notifier};
pub use protocol::{
    AutoProtocol, Disposition, HandshakeContext, HandshakeError, JsonProtocol, Protocol,
    RequestHandler, WebSocketProtocol,
};
pub use server::TransportServer;
pub use shutdown::CancellationToken;
