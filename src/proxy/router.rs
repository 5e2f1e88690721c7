//! Request correlation for one conductor
//!
//! Maps the id of every in-flight request to the UI client that issued it.
//! A response resolves its id exactly once; later responses with the same id
//! find nothing and are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use super::handle::ConnId;

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    client: ConnId,
    registered_at: Instant,
}

/// Pending requests of one conductor, keyed by correlation id
#[derive(Debug, Default)]
pub struct RequestRouter {
    pending: HashMap<u64, PendingRequest>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `client` is waiting for the response to request `id`.
    ///
    /// Must happen before the request is forwarded upstream. An existing entry
    /// for the same id is overwritten.
    pub fn register(&mut self, id: u64, client: ConnId) {
        self.register_at(id, client, Instant::now());
    }

    fn register_at(&mut self, id: u64, client: ConnId, now: Instant) {
        let previous = self.pending.insert(
            id,
            PendingRequest {
                client,
                registered_at: now,
            },
        );
        if let Some(previous) = previous {
            warn!(
                id,
                orphaned = %previous.client,
                client = %client,
                "Request id reused while still pending, earlier caller will not get a response"
            );
        }
    }

    /// Take the client waiting for `id`, if any
    pub fn resolve(&mut self, id: u64) -> Option<ConnId> {
        self.pending.remove(&id).map(|p| p.client)
    }

    /// Drop entries registered more than `ttl` ago. Returns how many were dropped.
    pub fn sweep_expired(&mut self, ttl: Duration) -> usize {
        self.sweep_expired_at(ttl, Instant::now())
    }

    fn sweep_expired_at(&mut self, ttl: Duration, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.registered_at) < ttl);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
