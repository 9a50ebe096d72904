//! Application callbacks run by the event loop.

use jrpc_collections::Buffer;

use crate::connection::{ConnectionId, PeerAddr, Session};
use crate::notify::Notifier;

/// Every callback runs on the loop thread and defaults to a no-op.
pub trait Hooks {
    fn on_client_connected(&mut self, _id: ConnectionId, _peer: &PeerAddr) {}

    fn on_client_closed(&mut self, _id: ConnectionId) {}

    /// Sees the raw request buffer before messages are extracted from it.
    /// Whatever the hook leaves in `request` is what gets parsed.
    fn on_request(&mut self, _id: ConnectionId, _session: &Session, _request: &mut Buffer) {}

    /// Runs once per loop iteration, after events and queued notifications.
    fn on_processed(&mut self, _notifier: &mut Notifier<'_>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
