//! Local registry of UI client connections for one conductor
//!
//! Tracks which UI clients are connected so signals can be fanned out to all
//! of them. Iteration follows registration order.

use std::collections::BTreeMap;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use super::handle::{ConnId, ConnectionHandle};
use crate::types::{MuxError, Result};

/// Connected UI clients of one conductor
#[derive(Debug, Default)]
pub struct LocalRegistry {
    clients: BTreeMap<ConnId, ConnectionHandle>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted client
    pub fn add(&mut self, client: ConnectionHandle) {
        debug!(client = %client.id(), "Registry: added client");
        self.clients.insert(client.id(), client);
    }

    /// Forget a client. Returns whether it was registered.
    pub fn remove(&mut self, id: ConnId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!(client = %id, "Registry: removed client");
        }
        removed
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send to one client, removing it if the send fails
    pub fn send_to(&mut self, id: ConnId, message: Message) -> Result<()> {
        let Some(client) = self.clients.get(&id) else {
            return Err(MuxError::ConnectionClosed);
        };
        let result = client.send(message);
        if result.is_err() {
            self.remove(id);
        }
        result
    }

    /// Send a frame to every registered client.
    ///
    /// A failed send removes that client only; the rest still receive the
    /// frame. Returns the number of clients the frame was queued for.
    pub fn broadcast(&mut self, message: &Message) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;

        for (id, client) in &self.clients {
            if client.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }

        for id in failed {
            self.remove(id);
        }

        delivered
    }
}
