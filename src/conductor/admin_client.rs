//! Holochain Admin API client
//!
//! Short-lived WebSocket connections with raw MessagePack envelopes. Each call
//! opens a fresh connection, sends one request, reads one response and closes.
//! The multiplexer only needs this once per conductor at startup.

use futures_util::{SinkExt, Stream, StreamExt};
use rmpv::Value;
use std::io::Cursor;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};

use super::dial;
use crate::proxy::frame::{
    decode_envelope, encode_envelope, get_field, get_string_field, header_of, payload, FrameKind,
};

/// Default timeout for admin WebSocket operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Each call owns its socket, so one fixed id is enough
const REQUEST_ID: u64 = 1;

/// Holochain admin API client using short-lived WebSocket connections.
pub struct AdminClient {
    admin_url: String,
    timeout: Duration,
}

impl AdminClient {
    /// Create a new admin client targeting the given admin WebSocket URL.
    pub fn new(admin_url: String) -> Self {
        Self {
            admin_url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout for WebSocket operations.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the conductor to open an app interface on `port`, any origin allowed.
    ///
    /// Returns the port the conductor reports as attached.
    pub async fn attach_app_interface(&self, port: u16) -> Result<u16, String> {
        let response = self.send_request(&attach_app_interface_request(port)).await?;
        let Value::Map(ref map) = response else {
            return Err(format!(
                "Unexpected attach_app_interface response: {response:?}"
            ));
        };
        check_error_response(map, "attach_app_interface")?;

        // Response inner: { type: "app_interface_attached", value: { port } }
        if let Some(Value::Map(ref value)) = get_field(map, "value") {
            if let Some(attached) = get_field(value, "port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
            {
                return Ok(attached);
            }
        }

        Err(format!(
            "Unexpected attach_app_interface response: {response:?}"
        ))
    }

    /// Open a WebSocket connection, send a request, read the response, close.
    async fn send_request(&self, inner: &Value) -> Result<Value, String> {
        let envelope = encode_envelope("request", Some(REQUEST_ID), &encode_msgpack(inner)?);

        let mut ws = dial(&self.admin_url, self.timeout)
            .await
            .map_err(|e| format!("Admin interface unreachable: {e}"))?;
        ws.send(Message::Binary(envelope))
            .await
            .map_err(|e| format!("Failed to send admin request: {e}"))?;

        let response = tokio::time::timeout(self.timeout, read_response(&mut ws, REQUEST_ID))
            .await
            .map_err(|_| "Timeout waiting for admin response".to_string());

        let _ = ws.close(None).await;
        response?
    }
}

/// Read frames until the response to `id` arrives
async fn read_response<S>(stream: &mut S, id: u64) -> Result<Value, String>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let data = match message.map_err(|e| format!("WebSocket error: {e}"))? {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => return Err("Admin connection closed".to_string()),
            _ => continue,
        };
        if let Some(inner) = parse_response_envelope(&data, id)? {
            return Ok(inner);
        }
    }
    Err("No response received".to_string())
}

/// `{ type: "attach_app_interface", value: { port, allowed_origins: "*", installed_app_id: nil } }`
fn attach_app_interface_request(port: u16) -> Value {
    let value = Value::Map(vec![
        (Value::String("port".into()), Value::Integer(port.into())),
        (
            Value::String("allowed_origins".into()),
            Value::String("*".into()),
        ),
        (Value::String("installed_app_id".into()), Value::Nil),
    ]);

    Value::Map(vec![
        (
            Value::String("type".into()),
            Value::String("attach_app_interface".into()),
        ),
        (Value::String("value".into()), value),
    ])
}

/// Return Err if the map is an admin error, at envelope or inner level.
fn check_error_response(map: &[(Value, Value)], operation: &str) -> Result<(), String> {
    if get_string_field(map, "type") != Some("error") {
        return Ok(());
    }
    match get_field(map, "value") {
        Some(Value::Map(ref err_data)) => {
            let msg = get_string_field(err_data, "message")
                .or_else(|| get_string_field(err_data, "value"));
            match msg {
                Some(msg) => Err(format!("Admin error ({operation}): {msg}")),
                None => Err(format!("Unknown admin error during {operation}")),
            }
        }
        Some(Value::String(msg)) => Err(format!(
            "Admin error ({operation}): {}",
            msg.as_str().unwrap_or_default()
        )),
        _ => Err(format!("Unknown admin error during {operation}")),
    }
}

fn encode_msgpack(value: &Value) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| format!("Failed to encode MessagePack: {e}"))?;
    Ok(buf)
}

/// Decode the inner data of the response to `id`.
///
/// Frames that are not that response yield `None`; error envelopes
/// (`{ type: "error", value: { type, value } }`) yield `Err`.
fn parse_response_envelope(data: &[u8], id: u64) -> Result<Option<Value>, String> {
    let map = decode_envelope(data).map_err(|e| format!("Invalid admin response: {e}"))?;
    check_error_response(&map, "admin request")?;

    let header = header_of(&map).map_err(|e| format!("Invalid admin response: {e}"))?;
    if header.kind != FrameKind::Response || header.id != id {
        return Ok(None);
    }

    let inner = payload(&map).ok_or_else(|| "Admin response without data".to_string())?;
    rmpv::decode::read_value(&mut Cursor::new(inner))
        .map(Some)
        .map_err(|e| format!("Failed to decode inner response: {e}"))
}
