//! Outbound handles to WebSocket peers
//!
//! Every socket the multiplexer holds (UI client or upstream conductor
//! connection) is driven by a writer task that drains an unbounded channel
//! into the socket sink. A [`ConnectionHandle`] is the sending half of that
//! channel plus a process-unique id; a send fails exactly when the writer task
//! has gone away, which is how transport send failures surface to the pool and
//! the registry.

use futures_util::{Sink, SinkExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use crate::types::{MuxError, Result};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id, allocated in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next id
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending side of one socket
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task must drain
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a message for the socket
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| MuxError::ConnectionClosed)
    }

    /// Whether the writer task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for a socket sink.
///
/// The task ends when every handle is dropped or the sink rejects a write;
/// either way the receiver is dropped, so later sends on any clone fail.
pub fn spawn_writer<S>(
    id: ConnId,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(conn = %id, "Write failed, closing writer: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        rx.close();
        let _ = sink.close().await;
    })
}
