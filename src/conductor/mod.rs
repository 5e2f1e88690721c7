//! Outbound connections to a Holochain conductor
//!
//! Two kinds: pooled app interface sockets carrying proxied traffic
//! ([`upstream`]), and short-lived admin interface calls ([`admin_client`]).

pub mod admin_client;
pub mod upstream;

pub use admin_client::AdminClient;
pub use upstream::WsConnector;

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{handshake::client::generate_key, http::Request};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::types::{MuxError, Result};

pub(crate) type ConductorSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Origin presented to the conductor; app interfaces are attached with `*`
const ORIGIN: &str = "http://localhost";

/// Build the client handshake request for a conductor WebSocket URL.
///
/// Holochain rejects upgrades without an Origin header, so the request is
/// built by hand instead of letting tungstenite derive it from the URL.
pub(crate) fn handshake_request(url: &str) -> std::result::Result<Request<()>, String> {
    let host = url
        .split("//")
        .last()
        .and_then(|rest| rest.split('/').next())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| format!("Invalid conductor URL: {url}"))?;

    Request::builder()
        .uri(url)
        .header("Host", host)
        .header("Origin", ORIGIN)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| format!("Failed to build request: {e}"))
}

/// Open a WebSocket to a conductor interface, giving up after `timeout`
pub(crate) async fn dial(url: &str, timeout: Duration) -> Result<ConductorSocket> {
    let request = handshake_request(url).map_err(MuxError::Upstream)?;

    let (ws_stream, _) =
        tokio::time::timeout(timeout, connect_async_with_config(request, None, false))
            .await
            .map_err(|_| {
                MuxError::Upstream(format!("timeout after {:?} connecting to {}", timeout, url))
            })?
            .map_err(|e| MuxError::Upstream(format!("connect to {} failed: {}", url, e)))?;

    Ok(ws_stream)
}
