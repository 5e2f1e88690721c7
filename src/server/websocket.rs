//! UI client WebSocket handling
//!
//! Upgrades the HTTP request, then runs the client's socket: a writer task
//! drains its [`ConnectionHandle`] and this task posts every inbound data
//! frame to the conductor's shard until the socket ends.

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info};

use crate::proxy::handle::{spawn_writer, ConnectionHandle};
use crate::proxy::multiplexer::ShardHandle;
use crate::types::{MuxError, Result};

type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Upgrade a UI client request and spawn its socket task
pub fn handle_upgrade(
    shard: ShardHandle,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let (response, websocket) = hyper_tungstenite::upgrade(req, None)
        .map_err(|e| MuxError::WebSocket(format!("upgrade failed: {}", e)))?;

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => run_client(ws, shard, addr).await,
            Err(e) => error!("WebSocket handshake with {} failed: {}", addr, e),
        }
    });

    Ok(response)
}

async fn run_client(ws: HyperWebSocket, shard: ShardHandle, addr: SocketAddr) {
    let (sink, mut stream) = ws.split();
    let (handle, rx) = ConnectionHandle::channel();
    let id = handle.id();
    spawn_writer(id, sink, rx);

    info!(
        conductor = shard.conductor(),
        client = %id,
        "UI client connected from {}", addr
    );
    if !shard.client_connected(handle.clone()) {
        error!(conductor = shard.conductor(), "Shard is not running, dropping client");
        return;
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(message @ (Message::Binary(_) | Message::Text(_))) => {
                if !shard.client_frame(id, message) {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = handle.send(Message::Pong(data));
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!(client = %id, "Client closed connection: {:?}", frame);
                break;
            }
            Err(e) => {
                error!(client = %id, "Client WebSocket error: {}", e);
                break;
            }
        }
    }

    shard.client_closed(id);
    info!(conductor = shard.conductor(), client = %id, "UI client disconnected");
}
