//! Per-connection state.
//!
//! A [`Connection`] owns an accepted socket, its request and response
//! buffers, and the [`Session`] the protocol strategies read and update.
//! Connections are keyed by their raw file descriptor, which doubles as the
//! poll token.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use jrpc_collections::{Buffer, BufferError};
use jrpc_protocol::SessionKind;
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};

/// Bytes pulled from the socket per read call.
const READ_CHUNK: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identifies a live connection. Derived from the socket descriptor, so an
/// id can be reused once its connection has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub(crate) fn from_fd(fd: RawFd) -> Self {
        Self(fd as u32)
    }

    pub(crate) fn from_token(token: Token) -> Option<Self> {
        u32::try_from(token.0).ok().map(Self)
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Self::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connected,
    Handshaked,
}

/// Framing a connection has been bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Json,
    WebSocket,
}

/// Protocol-level state of one connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: ConnState,
    /// Framing bound to this connection; unset until auto-detection decides.
    pub wire: Option<Wire>,
    pub kind: Option<SessionKind>,
    /// Negotiated protocol name (`rpc`/`notify` on plain JSON, the
    /// subprotocol on WebSocket).
    pub protocol: Option<String>,
    /// Notify services this connection subscribed to.
    pub services: Vec<String>,
    /// Set once a close has been queued; no further input is handled.
    pub closing: bool,
    /// Input is skipped up to the next NUL, which ends a request that was
    /// dropped for size before all of it arrived.
    pub discarding: bool,
}

impl Session {
    pub fn new(wire: Option<Wire>) -> Self {
        Self {
            state: ConnState::Connected,
            wire,
            kind: None,
            protocol: None,
            services: Vec::new(),
            closing: false,
            discarding: false,
        }
    }

    pub fn is_notify(&self) -> bool {
        self.kind == Some(SessionKind::Notify)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sockets
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of draining the socket into the request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// The socket has no more bytes for now.
    Drained,
    /// The request buffer reached the size limit before the socket drained.
    Full,
    /// The peer closed its side or the read failed.
    Eof,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub stream: Stream,
    pub peer: PeerAddr,
    pub request: Buffer,
    pub response: Buffer,
    pub session: Session,
}

impl Connection {
    pub fn new(
        stream: Stream,
        peer: PeerAddr,
        buffer_size: usize,
        wire: Option<Wire>,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            id: ConnectionId::from_fd(stream.as_raw_fd()),
            stream,
            peer,
            request: Buffer::with_capacity(buffer_size)?,
            response: Buffer::with_capacity(buffer_size)?,
            session: Session::new(wire),
        })
    }

    /// Read until the socket would block, the peer closes, or the request
    /// buffer holds `limit` bytes.
    pub fn fill(&mut self, limit: usize) -> Result<ReadStatus, BufferError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.request.len() >= limit {
                return Ok(ReadStatus::Full);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => self.request.append(&chunk[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("{}: read failed: {e}", self.id);
                    return Ok(ReadStatus::Eof);
                }
            }
        }
    }

    /// Write as much of the response buffer as the socket accepts. Whatever
    /// is left stays buffered for the next write-ready event.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.response.is_empty() {
            match self.stream.write(self.response.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.response.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Shut down both directions and mark the session closed. The socket
    /// itself is released when the connection is dropped.
    pub fn half_close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::debug!("{}: shutdown failed: {e}", self.id);
        }
        let _ = self.stream.write(&[]);
        self.session.state = ConnState::Closed;
    }

    /// Flush, marking the session closed if the write fails. A closing
    /// session is half-closed once its response has drained.
    pub fn flush_or_close(&mut self) {
        if let Err(e) = self.flush() {
            tracing::debug!("{}: write failed: {e}", self.id);
            self.session.state = ConnState::Closed;
            return;
        }
        if self.session.closing && self.response.is_empty() && self.session.state != ConnState::Closed {
            self.half_close();
        }
    }
}
