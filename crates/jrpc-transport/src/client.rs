//! Blocking clients.
//!
//! [`RpcClient`] performs the rpc handshake and then makes one call at a
//! time, waiting for each NUL-terminated response. [`NotifyClient`]
//! subscribes to notify services and reads `$`-framed notifications.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use jrpc_collections::Buffer;
use jrpc_protocol::jsonrpc::strip_terminator;
use jrpc_protocol::{
    HANDSHAKE_OK, HandshakeRequest, NotifyFrameError, RpcRequest, RpcResponse,
    complete_message_len, decode_notify_frame,
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake refused by server")]
    HandshakeRefused,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection closed by server")]
    Closed,

    #[error("invalid notify frame: {0}")]
    Frame(#[from] NotifyFrameError),
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

impl From<PathBuf> for Endpoint {
    fn from(path: PathBuf) -> Self {
        Self::Unix(path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared stream plumbing
// ─────────────────────────────────────────────────────────────────────────────

enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        let stream = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)?;
                stream.set_nodelay(true)?;
                Self::Tcp(stream)
            }
            Endpoint::Unix(path) => Self::Unix(UnixStream::connect(path)?),
        };
        stream.set_timeouts(Some(DEFAULT_TIMEOUT))?;
        Ok(stream)
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        match self {
            Self::Tcp(s) => s.set_write_timeout(timeout),
            Self::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    /// Append one read's worth of bytes to `buf`. Zero means EOF.
    fn read_into(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match self {
            Self::Tcp(s) => s.read(&mut chunk)?,
            Self::Unix(s) => s.read(&mut chunk)?,
        };
        buf.append(&chunk[..n]).map_err(io::Error::other)?;
        Ok(n)
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(bytes),
            Self::Unix(s) => s.write_all(bytes),
        }
    }

    /// Serialize `message` and send it with its NUL terminator.
    fn send_json<T: serde::Serialize>(&mut self, message: &T) -> Result<(), ClientError> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(0);
        self.send(&bytes)?;
        Ok(())
    }

    /// Send the handshake and wait for the literal acknowledgment. Bytes
    /// past it stay in `buf`.
    fn handshake(&mut self, request: &HandshakeRequest, buf: &mut Buffer) -> Result<(), ClientError> {
        self.send_json(request)?;
        while buf.len() < HANDSHAKE_OK.len() {
            match self.read_into(buf) {
                Ok(0) => return Err(ClientError::HandshakeRefused),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !buf.as_slice().starts_with(HANDSHAKE_OK) {
            return Err(ClientError::HandshakeRefused);
        }
        buf.consume(HANDSHAKE_OK.len());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RPC client
// ─────────────────────────────────────────────────────────────────────────────

pub struct RpcClient {
    stream: ClientStream,
    buf: Buffer,
}

impl RpcClient {
    /// Connect and complete the rpc handshake.
    pub fn connect(endpoint: impl Into<Endpoint>) -> Result<Self, ClientError> {
        let endpoint = endpoint.into();
        let mut stream = ClientStream::connect(&endpoint)?;
        let mut buf = Buffer::new();
        stream.handshake(&HandshakeRequest::rpc(), &mut buf)?;
        debug!("Connected to {endpoint}");
        Ok(Self { stream, buf })
    }

    /// Replace the default read/write timeout. `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        Ok(self.stream.set_timeouts(timeout)?)
    }

    /// Call `method` and wait for its result. `None` params are sent as `[]`.
    pub fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.stream.send_json(&RpcRequest::new(method, params))?;

        loop {
            if let Some(len) = complete_message_len(self.buf.as_slice()) {
                let response: RpcResponse =
                    serde_json::from_slice(strip_terminator(&self.buf.as_slice()[..len]))?;
                self.buf.consume(len);
                return response.into_result().map_err(|e| ClientError::Remote(e.message));
            }
            match self.stream.read_into(&mut self.buf) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a request without waiting for the response, then close.
    pub fn notify(mut self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.stream.send_json(&RpcRequest::new(method, params))?;
        if let Err(e) = self.stream.shutdown() {
            debug!("Shutdown after notify failed: {e}");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notify client
// ─────────────────────────────────────────────────────────────────────────────

pub struct NotifyClient {
    stream: ClientStream,
    buf: Buffer,
}

impl NotifyClient {
    /// Connect and subscribe to `services`.
    pub fn subscribe<S: Into<String>>(
        endpoint: impl Into<Endpoint>,
        services: impl IntoIterator<Item = S>,
    ) -> Result<Self, ClientError> {
        let endpoint = endpoint.into();
        let mut stream = ClientStream::connect(&endpoint)?;
        let mut buf = Buffer::new();
        stream.handshake(&HandshakeRequest::notify(services), &mut buf)?;
        debug!("Subscribed at {endpoint}");
        Ok(Self { stream, buf })
    }

    /// Next notification, if one arrives in time.
    ///
    /// With `block` unset the call only consumes what is already readable.
    /// With `block` set it waits up to `timeout`, or indefinitely for `None`;
    /// a zero timeout behaves like a non-blocking read.
    /// `Ok(None)` means nothing complete arrived.
    pub fn next_notification(
        &mut self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, ClientError> {
        let block = block && timeout != Some(Duration::ZERO);
        if block {
            self.stream.set_nonblocking(false)?;
            self.stream.set_read_timeout(timeout)?;
        } else {
            self.stream.set_nonblocking(true)?;
        }

        let result = self.read_frame();
        if !block {
            self.stream.set_nonblocking(false)?;
        }
        result
    }

    fn read_frame(&mut self) -> Result<Option<Value>, ClientError> {
        loop {
            if let Some((notification, used)) = decode_notify_frame(self.buf.as_slice())? {
                self.buf.consume(used);
                return Ok(Some(notification));
            }
            match self.stream.read_into(&mut self.buf) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
