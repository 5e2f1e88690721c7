//! Local endpoint of one conductor
//!
//! Uses hyper http1 with TokioIo. Any WebSocket upgrade, on any path, becomes
//! a UI client of the conductor; `GET /status` reports the shard's counters.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::proxy::multiplexer::{ShardHandle, ShardStatus};
use crate::server::websocket;
use crate::types::MuxError;

/// `/status` body
#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    shard: ShardStatus,
    version: &'static str,
    commit: &'static str,
}

/// Accept connections for one conductor until the task is aborted
pub async fn serve(listener: TcpListener, shard: ShardHandle) {
    match listener.local_addr() {
        Ok(local) => info!(
            conductor = shard.conductor(),
            "Listening for UI clients on {}", local
        ),
        Err(e) => error!("Listener has no local address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shard = shard.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let shard = shard.clone();
                        async move { handle_request(shard, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    shard: ShardHandle,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if hyper_tungstenite::is_upgrade_request(&req) {
        return Ok(match websocket::handle_upgrade(shard, addr, req) {
            Ok(response) => response,
            Err(e) => error_response(&e),
        });
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => match shard.status().await {
            Ok(status) => json_response(
                StatusCode::OK,
                &StatusBody {
                    shard: status,
                    version: env!("CARGO_PKG_VERSION"),
                    commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
                },
            ),
            Err(e) => error_response(&e),
        },
        _ => not_found_response(&path),
    };

    Ok(response)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap_or_default(),
        Err(e) => error_response(&MuxError::from(e)),
    }
}

fn error_response(error: &MuxError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": error.to_string() });
    Response::builder()
        .status(error.status_code())
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_default()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "Open a WebSocket connection on any path, or GET /status"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_default()
}
