//! Notify services.
//!
//! Services are declared once, up front. A connection that completes a
//! notify handshake is listed under each service it named; a notification
//! for a service is framed by the connection's strategy and queued on every
//! subscriber's response buffer.
//!
//! Inside the loop thread notifications go through a [`Notifier`] (the
//! `on_processed` hook receives one). Other threads publish through a
//! [`NotifyHandle`], which queues the notification and wakes the poller.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use jrpc_collections::{BufferError, HashTable};
use jrpc_protocol::NotifyFrameError;
use mio::Waker;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{ConnState, Connection, ConnectionId};
use crate::error::TransportError;
use crate::protocol::Protocol;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify service '{0}' is not registered")]
    UnknownService(String),

    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] NotifyFrameError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Service name to subscriber list.
#[derive(Default)]
pub struct NotifyRegistry {
    services: HashTable<Vec<ConnectionId>>,
    declared: bool,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the notify services. Allowed once.
    pub fn declare<I, S>(&mut self, names: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.declared {
            return Err(TransportError::NotifyServicesAlreadyRegistered);
        }
        for name in names {
            let name = name.into();
            debug!("Declared notify service: {name}");
            self.services.insert(name, Vec::new());
        }
        self.declared = true;
        Ok(())
    }

    pub fn is_declared(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn subscribers(&self, service: &str) -> Option<&[ConnectionId]> {
        self.services.get(service).map(Vec::as_slice)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().filter_map(|key| key.as_str())
    }

    pub(crate) fn subscribe(&mut self, id: ConnectionId, services: &[String]) {
        for service in services {
            if let Some(list) = self.services.get_mut(service)
                && !list.contains(&id)
            {
                list.push(id);
            }
        }
    }

    pub(crate) fn unsubscribe(&mut self, id: ConnectionId, services: &[String]) {
        for service in services {
            if let Some(list) = self.services.get_mut(service) {
                list.retain(|&subscriber| subscriber != id);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Loop-thread view used to deliver notifications.
pub struct Notifier<'a> {
    pub(crate) connections: &'a mut HashTable<Connection>,
    pub(crate) registry: &'a NotifyRegistry,
    pub(crate) protocol: &'a dyn Protocol,
    pub(crate) failed: &'a mut Vec<ConnectionId>,
}

impl Notifier<'_> {
    /// Send `notification` to every subscriber of `service` and return how
    /// many were reached. A declared service with no subscribers reaches
    /// zero; an undeclared one is an error.
    pub fn dispatch(&mut self, service: &str, notification: &Value) -> Result<usize, NotifyError> {
        let subscribers = self
            .registry
            .subscribers(service)
            .ok_or_else(|| NotifyError::UnknownService(service.to_string()))?;
        if subscribers.is_empty() {
            return Ok(0);
        }

        let payload = serde_json::to_vec(notification)?;
        let mut delivered = 0;
        for &id in subscribers {
            let Some(conn) = self.connections.get_mut(id.as_u32()) else {
                continue;
            };
            if conn.session.state != ConnState::Handshaked {
                continue;
            }
            if let Err(e) = self.protocol.encode_notification(&conn.session, &payload, &mut conn.response) {
                warn!("{id}: dropping '{service}' notification: {e}");
                continue;
            }
            conn.flush_or_close();
            if conn.session.state == ConnState::Closed {
                self.failed.push(id);
                continue;
            }
            delivered += 1;
        }
        debug!("Notification '{service}' delivered to {delivered} subscriber(s)");
        Ok(delivered)
    }

    pub fn subscriber_count(&self, service: &str) -> usize {
        self.registry.subscribers(service).map_or(0, <[_]>::len)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cross-thread publishing
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct NotifyQueue {
    pending: Mutex<VecDeque<(String, Value)>>,
    waker: Waker,
}

impl NotifyQueue {
    pub fn new(waker: Waker) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub fn take(&self) -> VecDeque<(String, Value)> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Publishes notifications from any thread. Delivery happens on the loop
/// thread during its next iteration.
#[derive(Clone)]
pub struct NotifyHandle {
    queue: Arc<NotifyQueue>,
}

impl NotifyHandle {
    pub(crate) fn new(queue: Arc<NotifyQueue>) -> Self {
        Self { queue }
    }

    pub fn publish(&self, service: impl Into<String>, notification: Value) -> io::Result<()> {
        self.queue.pending.lock().push_back((service.into(), notification));
        self.queue.waker.wake()
    }
}
