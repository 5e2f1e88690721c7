//! Per-conductor multiplexer
//!
//! One actor task per conductor owns that conductor's upstream pool, local
//! registry and request router. Socket tasks never touch that state directly;
//! they post [`ShardEvent`]s to the actor's mailbox through a [`ShardHandle`].
//! Nothing is shared between conductors, so one conductor's outage cannot
//! affect another's routing.
//!
//! Forwarding rules:
//! - client `request`: register `id -> client`, then forward on the next pooled
//!   upstream connection
//! - client `response`: protocol violation, logged and dropped
//! - client anything else: forwarded upstream as-is
//! - upstream `response`: delivered to the client that registered the id, once
//! - upstream `request`: protocol violation, logged and dropped
//! - upstream anything else: broadcast to every connected client
//!
//! Upstream dials never run on the actor. A dial is spawned as its own task
//! and reports back on an internal channel. Frames that arrive while the pool
//! is warming up are held and released, in arrival order, once the warm-up
//! ends; refills after an eviction run behind the surviving connections.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use super::frame::{self, FrameKind};
use super::handle::{ConnId, ConnectionHandle};
use super::pool::{Acquire, UpstreamConnector, UpstreamPool};
use super::registry::LocalRegistry;
use super::router::RequestRouter;
use crate::types::{MuxError, Result};

/// Events processed by a conductor's actor
#[derive(Debug)]
pub enum ShardEvent {
    /// A UI client finished its WebSocket handshake
    ClientConnected(ConnectionHandle),
    /// A data frame from a UI client
    ClientFrame { client: ConnId, message: Message },
    /// A UI client went away
    ClientClosed(ConnId),
    /// A data frame from an upstream connection
    UpstreamFrame { upstream: ConnId, message: Message },
    /// An upstream connection closed or errored
    UpstreamClosed { upstream: ConnId, reason: String },
    /// Snapshot request
    Status(oneshot::Sender<ShardStatus>),
}

/// Point-in-time view of one conductor's shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStatus {
    pub conductor: usize,
    pub upstream_connections: usize,
    pub pool_target: usize,
    pub local_connections: usize,
    pub pending_requests: usize,
}

/// Mailbox of one conductor's actor
#[derive(Debug, Clone)]
pub struct ShardHandle {
    conductor: usize,
    tx: mpsc::UnboundedSender<ShardEvent>,
}

impl ShardHandle {
    /// Create a handle and the receiving end the actor runs on
    pub fn channel(conductor: usize) -> (Self, mpsc::UnboundedReceiver<ShardEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { conductor, tx }, rx)
    }

    pub fn conductor(&self) -> usize {
        self.conductor
    }

    /// Post an event. Returns false once the actor has stopped.
    pub fn post(&self, event: ShardEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn client_connected(&self, client: ConnectionHandle) -> bool {
        self.post(ShardEvent::ClientConnected(client))
    }

    pub fn client_frame(&self, client: ConnId, message: Message) -> bool {
        self.post(ShardEvent::ClientFrame { client, message })
    }

    pub fn client_closed(&self, client: ConnId) -> bool {
        self.post(ShardEvent::ClientClosed(client))
    }

    pub fn upstream_frame(&self, upstream: ConnId, message: Message) -> bool {
        self.post(ShardEvent::UpstreamFrame { upstream, message })
    }

    pub fn upstream_closed(&self, upstream: ConnId, reason: impl Into<String>) -> bool {
        self.post(ShardEvent::UpstreamClosed {
            upstream,
            reason: reason.into(),
        })
    }

    /// Ask the actor for a status snapshot
    pub async fn status(&self) -> Result<ShardStatus> {
        let (reply, rx) = oneshot::channel();
        if !self.post(ShardEvent::Status(reply)) {
            return Err(MuxError::Internal(format!(
                "conductor {} shard has stopped",
                self.conductor
            )));
        }
        rx.await
            .map_err(|_| MuxError::Internal("shard dropped status request".into()))
    }
}

/// State owned by one conductor's actor
pub struct Multiplexer<C> {
    conductor: usize,
    pool: UpstreamPool<C>,
    registry: LocalRegistry,
    router: RequestRouter,
    pending_ttl: Option<Duration>,
    /// Frames waiting for the pool's warm-up
    held: VecDeque<Message>,
    dial_tx: mpsc::UnboundedSender<Result<ConnectionHandle>>,
    dial_rx: mpsc::UnboundedReceiver<Result<ConnectionHandle>>,
}

impl<C: UpstreamConnector + 'static> Multiplexer<C> {
    pub fn new(conductor: usize, pool: UpstreamPool<C>, pending_ttl: Option<Duration>) -> Self {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        Self {
            conductor,
            pool,
            registry: LocalRegistry::new(),
            router: RequestRouter::new(),
            pending_ttl,
            held: VecDeque::new(),
            dial_tx,
            dial_rx,
        }
    }

    /// Process events until every [`ShardHandle`] is dropped
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ShardEvent>) {
        info!(conductor = self.conductor, "Multiplexer shard started");

        let sweep_period = self
            .pending_ttl
            .map(|ttl| (ttl / 2).clamp(Duration::from_millis(100), Duration::from_secs(30)))
            .unwrap_or(Duration::from_secs(30));
        let mut sweep = tokio::time::interval(sweep_period);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(result) = self.dial_rx.recv() => self.on_dial_finished(result),
                _ = sweep.tick(), if self.pending_ttl.is_some() => self.sweep_pending(),
            }
        }

        info!(conductor = self.conductor, "Multiplexer shard stopped");
    }

    /// Process one event
    pub fn handle_event(&mut self, event: ShardEvent) {
        match event {
            ShardEvent::ClientConnected(client) => {
                info!(
                    conductor = self.conductor,
                    client = %client.id(),
                    "Client connected ({} total)",
                    self.registry.len() + 1
                );
                self.registry.add(client);
            }
            ShardEvent::ClientFrame { client, message } => {
                self.on_client_frame(client, message);
            }
            ShardEvent::ClientClosed(client) => {
                if self.registry.remove(client) {
                    info!(
                        conductor = self.conductor,
                        client = %client,
                        "Client disconnected ({} remain)",
                        self.registry.len()
                    );
                }
            }
            ShardEvent::UpstreamFrame { upstream, message } => {
                self.on_upstream_frame(upstream, message);
            }
            ShardEvent::UpstreamClosed { upstream, reason } => {
                error!(
                    conductor = self.conductor,
                    upstream = %upstream,
                    "Upstream connection lost: {}", reason
                );
                self.pool.evict(upstream);
            }
            ShardEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn on_client_frame(&mut self, client: ConnId, message: Message) {
        let header = match frame::inspect(&message) {
            Ok(header) => header,
            Err(e) => {
                error!(
                    conductor = self.conductor,
                    client = %client,
                    "Dropping client frame: {}", e
                );
                return;
            }
        };

        match header.kind {
            FrameKind::Response => {
                warn!(
                    conductor = self.conductor,
                    client = %client,
                    id = header.id,
                    "Unexpected response from client, not forwarded"
                );
            }
            FrameKind::Request => {
                self.router.register(header.id, client);
                self.forward_upstream(message);
            }
            FrameKind::Signal => {
                self.forward_upstream(message);
            }
        }
    }

    /// Send a frame on the next pooled connection, or hold it while the pool
    /// warms up
    fn forward_upstream(&mut self, message: Message) {
        match self.pool.acquire() {
            Acquire::Ready(upstream) => {
                if let Err(e) = upstream.send(message) {
                    warn!(
                        conductor = self.conductor,
                        upstream = %upstream.id(),
                        "Forwarding upstream failed: {}", e
                    );
                    self.pool.evict(upstream.id());
                }
            }
            Acquire::Pending => self.held.push_back(message),
            Acquire::Unavailable(e) => {
                warn!(conductor = self.conductor, "No upstream connection for frame: {}", e);
            }
        }
        self.start_dial();
    }

    /// Spawn the pool's next dial, if one is due
    fn start_dial(&mut self) {
        let Some(dial) = self.pool.begin_dial() else {
            return;
        };
        let done = self.dial_tx.clone();
        tokio::spawn(async move {
            let _ = done.send(dial.await);
        });
    }

    fn on_dial_finished(&mut self, result: Result<ConnectionHandle>) {
        let failed = self.pool.finish_dial(result).is_err();
        if !failed {
            self.start_dial();
        }
        if self.pool.is_warming() || self.held.is_empty() {
            return;
        }

        if failed && self.pool.is_empty() {
            warn!(
                conductor = self.conductor,
                "Dropping {} held frame(s), no upstream connection",
                self.held.len()
            );
            self.held.clear();
            return;
        }

        debug!(
            conductor = self.conductor,
            "Releasing {} held frame(s)",
            self.held.len()
        );
        for message in std::mem::take(&mut self.held) {
            self.forward_upstream(message);
        }
    }

    fn on_upstream_frame(&mut self, upstream: ConnId, message: Message) {
        let header = match frame::inspect(&message) {
            Ok(header) => header,
            Err(e) => {
                error!(
                    conductor = self.conductor,
                    upstream = %upstream,
                    "Dropping upstream frame: {}", e
                );
                return;
            }
        };

        match header.kind {
            FrameKind::Response => match self.router.resolve(header.id) {
                Some(client) => {
                    if let Err(e) = self.registry.send_to(client, message) {
                        debug!(
                            conductor = self.conductor,
                            client = %client,
                            id = header.id,
                            "Response for departed client dropped: {}", e
                        );
                    }
                }
                None => {
                    debug!(
                        conductor = self.conductor,
                        id = header.id,
                        "Dropping response with no pending request"
                    );
                }
            },
            FrameKind::Request => {
                warn!(
                    conductor = self.conductor,
                    upstream = %upstream,
                    id = header.id,
                    "Unexpected request from conductor, not forwarded"
                );
            }
            FrameKind::Signal => {
                let delivered = self.registry.broadcast(&message);
                debug!(
                    conductor = self.conductor,
                    "Signal fanned out to {} client(s)", delivered
                );
            }
        }
    }

    fn sweep_pending(&mut self) {
        let Some(ttl) = self.pending_ttl else {
            return;
        };
        let dropped = self.router.sweep_expired(ttl);
        if dropped > 0 {
            warn!(
                conductor = self.conductor,
                "Dropped {} pending request(s) unanswered after {:?}", dropped, ttl
            );
        }
    }

    /// Current counters
    pub fn status(&self) -> ShardStatus {
        ShardStatus {
            conductor: self.conductor,
            upstream_connections: self.pool.len(),
            pool_target: self.pool.target(),
            local_connections: self.registry.len(),
            pending_requests: self.router.len(),
        }
    }

    /// Apply dial results until no dial is in flight
    #[cfg(test)]
    async fn settle(&mut self) {
        while self.pool.is_dialing() {
            match self.dial_rx.recv().await {
                Some(result) => self.on_dial_finished(result),
                None => return,
            }
        }
    }
}

/// Spawn a conductor's actor task
pub fn spawn<C>(
    multiplexer: Multiplexer<C>,
    events: mpsc::UnboundedReceiver<ShardEvent>,
) -> JoinHandle<()>
where
    C: UpstreamConnector + 'static,
{
    tokio::spawn(multiplexer.run(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::frame::encode_envelope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    /// Upstream connector whose "sockets" are in-memory channels the test reads
    #[derive(Clone, Default)]
    struct FakeConnector {
        dials: Arc<AtomicUsize>,
        upstreams: Arc<Mutex<Vec<(ConnId, UnboundedReceiver<Message>)>>>,
        /// While set, dials block until `release` is notified
        hang: Arc<AtomicBool>,
        release: Arc<Notify>,
    }

    impl FakeConnector {
        /// Everything sent upstream so far, across all connections
        fn drain(&self) -> Vec<Message> {
            let mut out = Vec::new();
            for (_, rx) in self.upstreams.lock().unwrap().iter_mut() {
                while let Ok(msg) = rx.try_recv() {
                    out.push(msg);
                }
            }
            out
        }

        /// Simulate the socket of the `index`-th dialed connection dying
        fn kill(&self, index: usize) -> ConnId {
            let mut upstreams = self.upstreams.lock().unwrap();
            let (id, rx) = &mut upstreams[index];
            rx.close();
            *id
        }

        fn upstream_id(&self, index: usize) -> ConnId {
            self.upstreams.lock().unwrap()[index].0
        }
    }

    #[async_trait]
    impl UpstreamConnector for FakeConnector {
        async fn connect(&self) -> Result<ConnectionHandle> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            let (handle, rx) = ConnectionHandle::channel();
            self.upstreams.lock().unwrap().push((handle.id(), rx));
            Ok(handle)
        }
    }

    fn multiplexer(pool_size: usize) -> (Multiplexer<FakeConnector>, FakeConnector) {
        let connector = FakeConnector::default();
        let pool = UpstreamPool::new(0, connector.clone(), pool_size);
        (Multiplexer::new(0, pool, None), connector)
    }

    fn connect_client(mux: &mut Multiplexer<FakeConnector>) -> (ConnId, UnboundedReceiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel();
        let id = handle.id();
        mux.handle_event(ShardEvent::ClientConnected(handle));
        (id, rx)
    }

    /// Deliver a client frame and let any dial it started finish
    async fn client_sends(mux: &mut Multiplexer<FakeConnector>, client: ConnId, frame: Vec<u8>) {
        mux.handle_event(ShardEvent::ClientFrame {
            client,
            message: Message::Binary(frame),
        });
        mux.settle().await;
    }

    fn client_sends_without_settling(
        mux: &mut Multiplexer<FakeConnector>,
        client: ConnId,
        frame: Vec<u8>,
    ) {
        mux.handle_event(ShardEvent::ClientFrame {
            client,
            message: Message::Binary(frame),
        });
    }

    fn upstream_sends(mux: &mut Multiplexer<FakeConnector>, frame: Vec<u8>) {
        mux.handle_event(ShardEvent::UpstreamFrame {
            upstream: ConnId::next(),
            message: Message::Binary(frame),
        });
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (mut mux, connector) = multiplexer(2);
        let (client, mut client_rx) = connect_client(&mut mux);

        let request = encode_envelope("request", Some(7), b"P");
        client_sends(&mut mux, client, request.clone()).await;

        assert_eq!(connector.drain(), vec![Message::Binary(request)]);
        assert_eq!(mux.status().pending_requests, 1);
        assert_eq!(mux.status().upstream_connections, 2);

        let response = encode_envelope("response", Some(7), b"Q");
        upstream_sends(&mut mux, response.clone());

        assert_eq!(client_rx.try_recv().unwrap(), Message::Binary(response));
        assert_eq!(mux.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_frames_are_held_during_warm_up() {
        let (mut mux, connector) = multiplexer(2);
        let (client, _rx) = connect_client(&mut mux);

        let first = encode_envelope("request", Some(1), b"");
        let second = encode_envelope("signal", None, b"");
        client_sends_without_settling(&mut mux, client, first.clone());
        client_sends_without_settling(&mut mux, client, second.clone());
        assert!(connector.drain().is_empty());
        assert_eq!(mux.held.len(), 2);

        mux.settle().await;
        assert!(mux.held.is_empty());
        assert_eq!(
            connector.drain(),
            vec![Message::Binary(first), Message::Binary(second)]
        );
    }

    #[tokio::test]
    async fn test_response_goes_only_to_requester() {
        let (mut mux, _connector) = multiplexer(1);
        let (alice, mut alice_rx) = connect_client(&mut mux);
        let (_bob, mut bob_rx) = connect_client(&mut mux);

        client_sends(&mut mux, alice, encode_envelope("request", Some(1), b"")).await;
        upstream_sends(&mut mux, encode_envelope("response", Some(1), b"ok"));

        assert!(alice_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let (mut mux, _connector) = multiplexer(1);
        let (client, mut client_rx) = connect_client(&mut mux);

        client_sends(&mut mux, client, encode_envelope("request", Some(3), b"")).await;
        let response = encode_envelope("response", Some(3), b"");
        upstream_sends(&mut mux, response.clone());
        upstream_sends(&mut mux, response);

        assert!(client_rx.try_recv().is_ok());
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signal_fans_out_and_leaves_router_alone() {
        let (mut mux, _connector) = multiplexer(1);
        let (client_a, mut rx_a) = connect_client(&mut mux);
        let (_b, mut rx_b) = connect_client(&mut mux);

        client_sends(&mut mux, client_a, encode_envelope("request", Some(9), b"")).await;

        let signal = encode_envelope("signal", Some(0), b"S");
        upstream_sends(&mut mux, signal.clone());

        assert_eq!(rx_a.try_recv().unwrap(), Message::Binary(signal.clone()));
        assert_eq!(rx_b.try_recv().unwrap(), Message::Binary(signal));
        assert_eq!(mux.status().pending_requests, 1);
    }

    #[tokio::test]
    async fn test_client_response_is_not_forwarded() {
        let (mut mux, connector) = multiplexer(1);
        let (client, _rx) = connect_client(&mut mux);

        client_sends(&mut mux, client, encode_envelope("response", Some(4), b"")).await;

        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
        assert!(connector.drain().is_empty());
        assert_eq!(mux.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_client_signal_is_forwarded_without_registration() {
        let (mut mux, connector) = multiplexer(1);
        let (client, _rx) = connect_client(&mut mux);

        let auth = encode_envelope("authenticate", None, b"token");
        client_sends(&mut mux, client, auth.clone()).await;

        assert_eq!(connector.drain(), vec![Message::Binary(auth)]);
        assert_eq!(mux.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_upstream_request_is_not_forwarded() {
        let (mut mux, _connector) = multiplexer(1);
        let (_client, mut rx) = connect_client(&mut mux);

        upstream_sends(&mut mux, encode_envelope("request", Some(1), b""));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_client_frame_is_dropped() {
        let (mut mux, connector) = multiplexer(1);
        let (client, _rx) = connect_client(&mut mux);

        client_sends(&mut mux, client, vec![0xc1]).await;
        mux.handle_event(ShardEvent::ClientFrame {
            client,
            message: Message::Ping(vec![]),
        });

        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
        assert_eq!(mux.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_undecodable_text_is_dropped() {
        let (mut mux, connector) = multiplexer(1);
        let (client, _rx) = connect_client(&mut mux);

        // Undecodable text is dropped, never converted to binary
        mux.handle_event(ShardEvent::ClientFrame {
            client,
            message: Message::Text("not msgpack".into()),
        });
        mux.settle().await;
        assert!(connector.drain().is_empty());
    }

    #[tokio::test]
    async fn test_failed_forward_evicts_upstream() {
        let (mut mux, connector) = multiplexer(1);
        let (client, _rx) = connect_client(&mut mux);

        client_sends(&mut mux, client, encode_envelope("request", Some(1), b"")).await;
        let dead = connector.kill(0);

        client_sends_without_settling(&mut mux, client, encode_envelope("request", Some(2), b""));
        assert_eq!(mux.status().upstream_connections, 0);
        // The registration stays behind; it simply never resolves
        assert_eq!(mux.status().pending_requests, 2);

        // The eviction started a replacement dial
        mux.settle().await;
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(mux.status().upstream_connections, 1);
        assert!(!mux.pool.contains(dead));
    }

    #[tokio::test]
    async fn test_upstream_close_evicts() {
        let (mut mux, connector) = multiplexer(2);
        let (client, _rx) = connect_client(&mut mux);
        client_sends(&mut mux, client, encode_envelope("request", Some(1), b"")).await;

        let lost = connector.upstream_id(0);
        mux.handle_event(ShardEvent::UpstreamClosed {
            upstream: lost,
            reason: "closed by conductor".into(),
        });

        assert_eq!(mux.status().upstream_connections, 1);
        assert!(!mux.pool.contains(lost));
    }

    #[tokio::test]
    async fn test_refill_runs_behind_survivors() {
        let (mut mux, connector) = multiplexer(2);
        let (client, _rx) = connect_client(&mut mux);
        client_sends(&mut mux, client, encode_envelope("request", Some(1), b"")).await;
        connector.drain();

        mux.handle_event(ShardEvent::UpstreamClosed {
            upstream: connector.upstream_id(0),
            reason: "closed by conductor".into(),
        });
        connector.hang.store(true, Ordering::SeqCst);

        // Sent on the survivor right away, while the refill dial is pending
        let request = encode_envelope("request", Some(2), b"");
        client_sends_without_settling(&mut mux, client, request.clone());
        assert!(mux.pool.is_dialing());
        assert!(mux.held.is_empty());
        assert_eq!(connector.drain(), vec![Message::Binary(request)]);

        connector.release.notify_one();
        mux.settle().await;
        assert_eq!(mux.status().upstream_connections, 2);
    }

    #[tokio::test]
    async fn test_client_close_stops_signals() {
        let (mut mux, _connector) = multiplexer(1);
        let (a, mut rx_a) = connect_client(&mut mux);
        let (_b, mut rx_b) = connect_client(&mut mux);

        mux.handle_event(ShardEvent::ClientClosed(a));
        upstream_sends(&mut mux, encode_envelope("signal", None, b""));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(mux.status().local_connections, 1);
    }

    #[tokio::test]
    async fn test_response_to_departed_client_is_dropped() {
        let (mut mux, _connector) = multiplexer(1);
        let (client, client_rx) = connect_client(&mut mux);
        client_sends(&mut mux, client, encode_envelope("request", Some(5), b"")).await;

        drop(client_rx);
        upstream_sends(&mut mux, encode_envelope("response", Some(5), b""));

        assert_eq!(mux.status().local_connections, 0);
        assert_eq!(mux.status().pending_requests, 0);
    }

    /// Poll the shard until its pool holds `count` connections
    async fn wait_for_upstreams(handle: &ShardHandle, count: usize) {
        timeout(Duration::from_secs(5), async {
            while handle.status().await.unwrap().upstream_connections != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_shard_answers_status() {
        let connector = FakeConnector::default();
        let pool = UpstreamPool::new(4, connector, 3);
        let (handle, events) = ShardHandle::channel(4);
        let task = spawn(
            Multiplexer::new(4, pool, Some(Duration::from_secs(60))),
            events,
        );

        let (client, _client_rx) = ConnectionHandle::channel();
        let client_id = client.id();
        assert!(handle.client_connected(client));
        assert!(handle.client_frame(
            client_id,
            Message::Binary(encode_envelope("request", Some(1), b""))
        ));
        wait_for_upstreams(&handle, 3).await;

        let status = handle.status().await.unwrap();
        assert_eq!(
            status,
            ShardStatus {
                conductor: 4,
                upstream_connections: 3,
                pool_target: 3,
                local_connections: 1,
                pending_requests: 1,
            }
        );

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_refill_does_not_stall_responses() {
        let connector = FakeConnector::default();
        let pool = UpstreamPool::new(0, connector.clone(), 2);
        let (handle, events) = ShardHandle::channel(0);
        let task = spawn(Multiplexer::new(0, pool, None), events);

        let (alice, mut alice_rx) = ConnectionHandle::channel();
        let (bob, _bob_rx) = ConnectionHandle::channel();
        let (alice_id, bob_id) = (alice.id(), bob.id());
        handle.client_connected(alice);
        handle.client_connected(bob);

        handle.client_frame(
            alice_id,
            Message::Binary(encode_envelope("request", Some(1), b"")),
        );
        wait_for_upstreams(&handle, 2).await;

        // Lose one upstream; the refill Bob's request triggers never completes
        handle.upstream_closed(connector.upstream_id(0), "closed by conductor");
        connector.hang.store(true, Ordering::SeqCst);
        handle.client_frame(
            bob_id,
            Message::Binary(encode_envelope("request", Some(2), b"")),
        );

        let response = encode_envelope("response", Some(1), b"ok");
        handle.upstream_frame(connector.upstream_id(1), Message::Binary(response.clone()));

        let delivered = timeout(Duration::from_secs(1), alice_rx.recv())
            .await
            .expect("response waited on the pending dial");
        assert_eq!(delivered, Some(Message::Binary(response)));

        connector.release.notify_one();
        wait_for_upstreams(&handle, 2).await;

        drop(handle);
        task.await.unwrap();
    }
}
