//! Event loop.
//!
//! One edge-triggered `mio::Poll` watches every listener and connection.
//! Each iteration accepts pending clients, drains readable sockets through
//! the protocol strategy, flushes writable ones, delivers notifications
//! queued from other threads, and finally runs the `on_processed` hook.
//! Connections are keyed by socket descriptor, and the descriptor is also
//! the poll token.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jrpc_collections::HashTable;
use mio::event::Event;
use mio::net::{TcpListener, UnixListener};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::config::{Listener, ProtocolMode, TransportConfig};
use crate::connection::{ConnState, Connection, ConnectionId, PeerAddr, ReadStatus, Stream, Wire};
use crate::error::TransportError;
use crate::hooks::Hooks;
use crate::notify::{NotifyHandle, NotifyQueue, NotifyRegistry, Notifier};
use crate::protocol::{
    AutoProtocol, Disposition, HandshakeContext, JsonProtocol, Protocol, RequestHandler,
    WebSocketProtocol,
};
use crate::shutdown::CancellationToken;

const WAKE_TOKEN: Token = Token(usize::MAX);

fn listener_token(index: usize) -> Token {
    Token(usize::MAX - 1 - index)
}

enum BoundListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// The transport server: listeners, connections and notify services, all
/// driven from the thread that calls [`TransportServer::serve`].
pub struct TransportServer {
    config: TransportConfig,
    poll: Poll,
    listeners: Vec<BoundListener>,
    connections: HashTable<Connection>,
    notify: NotifyRegistry,
    queue: Arc<NotifyQueue>,
    protocol: Box<dyn Protocol>,
    /// Connections whose last write failed outside the event handlers.
    failed: Vec<ConnectionId>,
}

impl TransportServer {
    /// Bind every configured listener. Stale Unix socket files are removed
    /// first.
    pub fn bind(config: TransportConfig) -> Result<Self, TransportError> {
        if config.listeners.is_empty() {
            return Err(TransportError::NoListeners);
        }

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for (index, wanted) in config.listeners.iter().enumerate() {
            let mut bound = bind_listener(wanted).map_err(|source| TransportError::Bind {
                endpoint: wanted.to_string(),
                source,
            })?;
            let token = listener_token(index);
            match &mut bound {
                BoundListener::Tcp(l) => poll.registry().register(l, token, Interest::READABLE)?,
                BoundListener::Unix { listener, .. } => {
                    poll.registry().register(listener, token, Interest::READABLE)?
                }
            }
            listeners.push(bound);
        }

        let protocol: Box<dyn Protocol> = match config.mode {
            ProtocolMode::Json => Box::new(JsonProtocol),
            ProtocolMode::WebSocket => Box::new(WebSocketProtocol),
            ProtocolMode::Auto => Box::new(AutoProtocol::new()),
        };

        let server = Self {
            poll,
            listeners,
            connections: HashTable::new(),
            notify: NotifyRegistry::new(),
            queue: Arc::new(NotifyQueue::new(waker)),
            protocol,
            failed: Vec::new(),
            config,
        };
        for listener in &server.listeners {
            match listener {
                BoundListener::Tcp(l) => match l.local_addr() {
                    Ok(addr) => info!("jsonrpc-hub listening on tcp://{addr} ({})", server.protocol.name()),
                    Err(e) => warn!("Listening on an unknown TCP address: {e}"),
                },
                BoundListener::Unix { path, .. } => {
                    info!("jsonrpc-hub listening on unix://{} ({})", path.display(), server.protocol.name())
                }
            }
        }
        Ok(server)
    }

    /// Address of the first TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(|l| match l {
            BoundListener::Tcp(l) => l.local_addr().ok(),
            BoundListener::Unix { .. } => None,
        })
    }

    /// Path of the first Unix listener.
    pub fn unix_path(&self) -> Option<&Path> {
        self.listeners.iter().find_map(|l| match l {
            BoundListener::Tcp(_) => None,
            BoundListener::Unix { path, .. } => Some(path.as_path()),
        })
    }

    /// Declare the notify services clients may subscribe to. Allowed once.
    pub fn register_notify_services<I, S>(&mut self, names: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notify.declare(names)
    }

    pub fn notify_registry(&self) -> &NotifyRegistry {
        &self.notify
    }

    pub fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle::new(self.queue.clone())
    }

    pub fn notifier(&mut self) -> Notifier<'_> {
        Notifier {
            connections: &mut self.connections,
            registry: &self.notify,
            protocol: self.protocol.as_ref(),
            failed: &mut self.failed,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the event loop until `cancel` fires. Every connection is torn down
    /// and Unix socket files are removed before returning.
    pub fn serve(
        &mut self,
        handler: &mut dyn RequestHandler,
        hooks: &mut dyn Hooks,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut events = Events::with_capacity(self.config.max_events.max(1));

        while !cancel.is_cancelled() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll failed: {e}");
                self.shutdown(hooks);
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if let Some(index) = self.listener_index(token) {
                    self.accept(index, hooks);
                    continue;
                }
                self.connection_event(token, event, handler, hooks);
            }

            self.deliver_queued();
            hooks.on_processed(&mut self.notifier());
            self.reap_failed(hooks);
        }

        self.shutdown(hooks);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept
    // ─────────────────────────────────────────────────────────────────────

    fn listener_index(&self, token: Token) -> Option<usize> {
        (usize::MAX - 1)
            .checked_sub(token.0)
            .filter(|&index| index < self.listeners.len())
    }

    fn accept(&mut self, index: usize, hooks: &mut dyn Hooks) {
        loop {
            let accepted = match &self.listeners[index] {
                BoundListener::Tcp(listener) => listener.accept().map(|(stream, addr)| {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {addr}: {e}");
                    }
                    (Stream::Tcp(stream), PeerAddr::Tcp(addr))
                }),
                BoundListener::Unix { listener, .. } => listener.accept().map(|(stream, addr)| {
                    let path = addr.as_pathname().map(Path::to_path_buf);
                    (Stream::Unix(stream), PeerAddr::Unix(path))
                }),
            };
            match accepted {
                Ok((stream, peer)) => self.register_connection(stream, peer, hooks),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: Stream, peer: PeerAddr, hooks: &mut dyn Hooks) {
        let wire = match self.config.mode {
            ProtocolMode::Json => Some(Wire::Json),
            ProtocolMode::WebSocket => Some(Wire::WebSocket),
            ProtocolMode::Auto => None,
        };
        let mut conn = match Connection::new(stream, peer, self.config.initial_buffer_size, wire) {
            Ok(conn) => conn,
            Err(e) => {
                error!("Dropping new connection: {e}");
                return;
            }
        };
        let id = conn.id;
        if let Err(e) = self.poll.registry().register(
            &mut conn.stream,
            id.token(),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("Failed to register {id}: {e}");
            return;
        }

        info!("Client connected: {id} ({})", conn.peer);
        hooks.on_client_connected(id, &conn.peer);
        self.connections.insert(id.as_u32(), conn);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection events
    // ─────────────────────────────────────────────────────────────────────

    fn connection_event(
        &mut self,
        token: Token,
        event: &Event,
        handler: &mut dyn RequestHandler,
        hooks: &mut dyn Hooks,
    ) {
        let Some(id) = ConnectionId::from_token(token) else {
            return;
        };
        if !self.connections.contains_key(id.as_u32()) {
            return;
        }

        if event.is_error() {
            debug!("{id}: socket error");
            self.finalize(id, hooks);
            return;
        }
        if event.is_readable() {
            self.on_readable(id, handler, hooks);
        }
        if event.is_writable()
            && let Some(conn) = self.connections.get_mut(id.as_u32())
            && conn.session.state != ConnState::Closed
        {
            conn.flush_or_close();
        }

        let hangup = event.is_read_closed() && event.is_write_closed();
        let closed = self
            .connections
            .get(id.as_u32())
            .is_none_or(|conn| conn.session.state == ConnState::Closed);
        if hangup || closed {
            self.finalize(id, hooks);
        }
    }

    fn on_readable(&mut self, id: ConnectionId, handler: &mut dyn RequestHandler, hooks: &mut dyn Hooks) {
        loop {
            let Some(conn) = self.connections.get_mut(id.as_u32()) else {
                return;
            };
            if conn.session.state == ConnState::Closed {
                return;
            }
            let status = match conn.fill(self.config.max_request_len) {
                Ok(status) => status,
                Err(e) => {
                    error!("{id}: {e}");
                    conn.half_close();
                    return;
                }
            };

            self.process(id, handler, hooks);

            match status {
                ReadStatus::Full => {
                    // nothing consumed the input; discard it so reading can go on
                    if let Some(conn) = self.connections.get_mut(id.as_u32())
                        && conn.request.len() >= self.config.max_request_len
                    {
                        conn.request.clear();
                    }
                }
                ReadStatus::Drained => return,
                ReadStatus::Eof => {
                    if let Some(conn) = self.connections.get_mut(id.as_u32())
                        && conn.session.state != ConnState::Closed
                    {
                        debug!("{id}: peer closed the connection");
                        conn.half_close();
                    }
                    return;
                }
            }
        }
    }

    /// Extract and handle every complete message in the request buffer.
    fn process(&mut self, id: ConnectionId, handler: &mut dyn RequestHandler, hooks: &mut dyn Hooks) {
        let Some(conn) = self.connections.get_mut(id.as_u32()) else {
            return;
        };
        if conn.request.is_empty() {
            return;
        }
        hooks.on_request(id, &conn.session, &mut conn.request);

        loop {
            if conn.session.state == ConnState::Closed || conn.session.closing {
                break;
            }
            if conn.session.state == ConnState::Handshaked && conn.session.is_notify() {
                conn.request.clear();
                break;
            }
            if conn.session.discarding {
                // rest of a dropped request, up to and including its NUL
                match conn.request.as_slice().iter().position(|&b| b == 0) {
                    Some(pos) => {
                        debug!("{id}: discarded the tail of an oversized request");
                        conn.request.consume(pos + 1);
                        conn.session.discarding = false;
                        continue;
                    }
                    None => {
                        conn.request.clear();
                        break;
                    }
                }
            }
            if conn.request.len() >= self.config.max_request_len {
                warn!(
                    "{id}: request of {} bytes exceeds the {} byte limit, dropping it",
                    conn.request.len(),
                    self.config.max_request_len
                );
                conn.session.discarding = conn.request.as_slice().last() != Some(&0);
                conn.request.clear();
                if self.protocol.reject_oversized(&mut conn.session, &mut conn.response)
                    == Disposition::Close
                {
                    conn.session.closing = true;
                }
                conn.flush_or_close();
                break;
            }

            let Some(len) = self
                .protocol
                .message_len(&mut conn.session, conn.request.as_slice())
            else {
                break;
            };
            let len = len.min(conn.request.len());

            if conn.session.state == ConnState::Handshaked && !conn.response.is_empty() {
                warn!("{id}: response still pending, dropping request of {len} bytes");
                conn.request.consume(len);
                continue;
            }

            let message = &conn.request.as_slice()[..len];
            match conn.session.state {
                ConnState::Connected => {
                    let ctx = HandshakeContext::new(&self.notify);
                    match self
                        .protocol
                        .handle_handshake(&mut conn.session, &ctx, message, &mut conn.response)
                    {
                        Ok(()) => {
                            conn.session.state = ConnState::Handshaked;
                            info!(
                                "{id}: handshake complete ({} over {})",
                                conn.session.protocol.as_deref().unwrap_or("rpc"),
                                self.protocol.name()
                            );
                            if conn.session.is_notify() {
                                self.notify.subscribe(id, &conn.session.services);
                            }
                        }
                        Err(e) => {
                            warn!("{id}: handshake refused: {e}");
                            conn.response.clear();
                            conn.request.clear();
                            conn.half_close();
                            break;
                        }
                    }
                }
                ConnState::Handshaked => {
                    let disposition =
                        self.protocol
                            .handle_request(&mut conn.session, handler, message, &mut conn.response);
                    if disposition == Disposition::Close {
                        conn.session.closing = true;
                    }
                }
                ConnState::Closed => break,
            }

            conn.request.consume(len);
            conn.flush_or_close();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────

    fn deliver_queued(&mut self) {
        let pending = self.queue.take();
        if pending.is_empty() {
            return;
        }
        let mut notifier = self.notifier();
        for (service, notification) in pending {
            if let Err(e) = notifier.dispatch(&service, &notification) {
                warn!("Queued notification for '{service}' dropped: {e}");
            }
        }
    }

    fn reap_failed(&mut self, hooks: &mut dyn Hooks) {
        while let Some(id) = self.failed.pop() {
            self.finalize(id, hooks);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Deregister, unlink from notify lists, drop from the registry, then
    /// run the close hook. The socket closes when the connection drops.
    fn finalize(&mut self, id: ConnectionId, hooks: &mut dyn Hooks) {
        let Some(conn) = self.connections.get_mut(id.as_u32()) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!("{id}: deregister failed: {e}");
        }
        if conn.session.is_notify() {
            self.notify.unsubscribe(id, &conn.session.services);
        }
        let conn = self.connections.remove(id.as_u32());
        hooks.on_client_closed(id);
        info!("Client disconnected: {id}");
        drop(conn);
    }

    fn shutdown(&mut self, hooks: &mut dyn Hooks) {
        let mut cursor = self.connections.cursor();
        while let Some(id) = cursor.next_entry(&self.connections).map(|(_, conn)| conn.id) {
            if let Some(conn) = self.connections.get_mut(id.as_u32()) {
                conn.half_close();
            }
            self.finalize(id, hooks);
        }
        self.failed.clear();
        self.remove_socket_files();
        info!("jsonrpc-hub transport stopped");
    }

    fn remove_socket_files(&self) {
        for listener in &self.listeners {
            if let BoundListener::Unix { path, .. } = listener {
                remove_stale_socket(path);
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.remove_socket_files();
    }
}

fn bind_listener(listener: &Listener) -> io::Result<BoundListener> {
    match listener {
        Listener::Tcp { host, port } => {
            let addr = (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses"))?;
            Ok(BoundListener::Tcp(TcpListener::bind(addr)?))
        }
        Listener::Unix { path } => {
            remove_stale_socket(path);
            let listener = UnixListener::bind(path)?;
            Ok(BoundListener::Unix {
                listener,
                path: path.clone(),
            })
        }
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket file {}: {e}", path.display()),
    }
}
