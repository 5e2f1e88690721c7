//! Upstream connection pool for one conductor
//!
//! Holds up to `target` connections to the conductor's app interface and
//! hands them out round robin. The pool grows lazily, one dial at a time, and
//! never dials on its own: the owner asks for a dial with [`UpstreamPool::begin_dial`],
//! runs the returned future wherever it likes and reports the outcome with
//! [`UpstreamPool::finish_dial`]. At most one dial is in flight, so the pool
//! never exceeds its target.
//!
//! The first fill is a warm-up: acquisitions wait ([`Acquire::Pending`])
//! until the pool reaches its target or a dial fails. Later refills, after
//! evictions, happen behind live connections, which keep being served.
//!
//! Failed dials arm an exponential backoff. While it is running no dial is
//! started; acquisitions rotate over the connections that are still alive, or
//! fail with [`MuxError::Unavailable`] if there are none.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::handle::{ConnId, ConnectionHandle};
use crate::types::{MuxError, Result};

const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Opens new upstream connections for a pool
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Dial the conductor. Resolves once the socket is open; the returned
    /// handle is already wired to a writer task and a frame reader.
    async fn connect(&self) -> Result<ConnectionHandle>;
}

/// Exponential dial backoff
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    next_delay: Duration,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            next_delay: min,
            retry_at: None,
        }
    }

    fn is_waiting(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now < at)
    }

    /// Record a failed dial, returns the delay before the next attempt
    fn fail(&mut self, now: Instant) -> Duration {
        let delay = self.next_delay;
        self.retry_at = Some(now + delay);
        self.next_delay = (delay * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next_delay = self.min;
        self.retry_at = None;
    }
}

/// Outcome of [`UpstreamPool::acquire`]
#[derive(Debug)]
pub enum Acquire {
    /// Next connection in rotation
    Ready(ConnectionHandle),
    /// The pool is warming up; retry once the in-flight dial finishes
    Pending,
    /// Nothing to hand out and no dial allowed right now
    Unavailable(MuxError),
}

/// Round-robin pool of upstream connections
pub struct UpstreamPool<C> {
    conductor: usize,
    connector: Arc<C>,
    target: usize,
    /// Pool membership
    members: BTreeMap<ConnId, ConnectionHandle>,
    /// Acquisition order; always a permutation of `members`
    rotation: VecDeque<ConnId>,
    backoff: Backoff,
    dialing: bool,
    warming: bool,
}

impl<C: UpstreamConnector + 'static> UpstreamPool<C> {
    /// Create an empty pool that grows to `target` connections
    pub fn new(conductor: usize, connector: C, target: usize) -> Self {
        Self {
            conductor,
            connector: Arc::new(connector),
            target: target.max(1),
            members: BTreeMap::new(),
            rotation: VecDeque::new(),
            backoff: Backoff::new(MIN_RETRY_DELAY, MAX_RETRY_DELAY),
            dialing: false,
            warming: false,
        }
    }

    /// Override the dial backoff bounds
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(min, max.max(min));
        self
    }

    /// Get the next connection in rotation.
    ///
    /// An empty pool outside backoff starts a warm-up and answers
    /// [`Acquire::Pending`]; the caller should then [`begin_dial`](Self::begin_dial).
    pub fn acquire(&mut self) -> Acquire {
        if self.members.is_empty() {
            if self.backoff.is_waiting(Instant::now()) {
                return Acquire::Unavailable(MuxError::Unavailable(format!(
                    "conductor {} has no upstream connections, dial backoff in effect",
                    self.conductor
                )));
            }
            self.warming = true;
        }
        if self.warming {
            return Acquire::Pending;
        }

        let Some(id) = self.rotation.pop_front() else {
            return Acquire::Unavailable(MuxError::Unavailable(format!(
                "conductor {} has no upstream connections",
                self.conductor
            )));
        };
        self.rotation.push_back(id);

        match self.members.get(&id) {
            Some(conn) => Acquire::Ready(conn.clone()),
            None => Acquire::Unavailable(MuxError::Internal(format!(
                "rotation holds unknown connection {}",
                id
            ))),
        }
    }

    /// Start the next dial towards the target, if one is due.
    ///
    /// Returns `None` when the pool is full, a dial is already in flight or
    /// the backoff window is open. The returned future must be driven to
    /// completion and its output handed to [`finish_dial`](Self::finish_dial).
    pub fn begin_dial(
        &mut self,
    ) -> Option<impl Future<Output = Result<ConnectionHandle>> + Send + 'static> {
        if self.dialing
            || self.members.len() >= self.target
            || self.backoff.is_waiting(Instant::now())
        {
            return None;
        }
        self.dialing = true;
        let connector = Arc::clone(&self.connector);
        Some(async move { connector.connect().await })
    }

    /// Record the outcome of a dial started by [`begin_dial`](Self::begin_dial).
    ///
    /// A new connection joins the front of the rotation. A failure is handed
    /// back and ends the warm-up, so waiting acquisitions are served by
    /// whatever connections exist.
    pub fn finish_dial(&mut self, result: Result<ConnectionHandle>) -> Result<ConnId> {
        self.dialing = false;
        match result {
            Ok(conn) => {
                self.backoff.reset();
                let id = conn.id();
                self.members.insert(id, conn);
                self.rotation.push_front(id);
                debug!(
                    conductor = self.conductor,
                    upstream = %id,
                    "Upstream connection added ({}/{})",
                    self.members.len(),
                    self.target
                );
                if self.members.len() >= self.target {
                    self.warming = false;
                    info!(
                        conductor = self.conductor,
                        "Upstream pool at target size ({})", self.target
                    );
                }
                Ok(id)
            }
            Err(e) => {
                self.warming = false;
                let delay = self.backoff.fail(Instant::now());
                warn!(
                    conductor = self.conductor,
                    "Upstream connect failed ({}/{} open), next attempt in {:?}: {}",
                    self.members.len(),
                    self.target,
                    delay,
                    e
                );
                Err(e)
            }
        }
    }

    /// Remove a connection. Evicting an absent connection does nothing.
    pub fn evict(&mut self, id: ConnId) {
        if self.members.remove(&id).is_none() {
            return;
        }
        self.rotation = self.members.keys().copied().collect();
        info!(
            conductor = self.conductor,
            upstream = %id,
            "Upstream connection evicted ({}/{} remain)",
            self.members.len(),
            self.target
        );
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.members.contains_key(&id)
    }

    /// Current number of connections
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Whether a dial is in flight
    pub fn is_dialing(&self) -> bool {
        self.dialing
    }

    /// Whether acquisitions are waiting for the first fill
    pub fn is_warming(&self) -> bool {
        self.warming
    }
}
