//! Pooled app interface connections
//!
//! [`WsConnector`] dials one WebSocket to a conductor's app interface and
//! wires it into the conductor's shard: a writer task drains the returned
//! [`ConnectionHandle`], a reader task posts every inbound data frame to the
//! shard mailbox and reports the socket's end as `UpstreamClosed`.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use super::dial;
use crate::proxy::handle::{spawn_writer, ConnId, ConnectionHandle};
use crate::proxy::multiplexer::ShardHandle;
use crate::proxy::pool::UpstreamConnector;
use crate::types::Result;

/// Dials app interface connections for one conductor
pub struct WsConnector {
    url: String,
    timeout: Duration,
    shard: ShardHandle,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, timeout: Duration, shard: ShardHandle) -> Self {
        Self {
            url: url.into(),
            timeout,
            shard,
        }
    }
}

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self) -> Result<ConnectionHandle> {
        let (sink, stream) = dial(&self.url, self.timeout).await?.split();
        let (handle, rx) = ConnectionHandle::channel();
        spawn_writer(handle.id(), sink, rx);
        tokio::spawn(read_upstream(
            handle.id(),
            stream,
            handle.clone(),
            self.shard.clone(),
        ));

        info!(
            conductor = self.shard.conductor(),
            upstream = %handle.id(),
            "Connected to {}", self.url
        );
        Ok(handle)
    }
}

/// Forward inbound frames to the shard until the socket ends
async fn read_upstream<S>(id: ConnId, mut stream: S, handle: ConnectionHandle, shard: ShardHandle)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(message @ (Message::Binary(_) | Message::Text(_)))) => {
                if !shard.upstream_frame(id, message) {
                    break "shard stopped".to_string();
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = handle.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("closed by conductor: {} {}", frame.code, frame.reason),
                    None => "closed by conductor".to_string(),
                };
            }
            Some(Err(e)) => break format!("read error: {}", e),
            None => break "stream ended".to_string(),
        }
    };

    debug!(upstream = %id, "Upstream reader finished: {}", reason);
    // Dropping our handle lets the writer finish once the pool lets go too
    drop(handle);
    shard.upstream_closed(id, reason);
}
