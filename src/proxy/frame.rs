//! Frame inspection for Holochain wire messages
//!
//! Decodes just enough of a MessagePack envelope to learn its kind and
//! correlation id. The payload is never touched: the caller forwards the
//! original [`Message`] unchanged, so binary frames stay binary and text
//! frames stay text.
//!
//! Envelope format: `{ type: "request" | "response" | "signal" | ..., id: u64, data: <bytes> }`

use rmpv::Value;
use std::fmt;
use std::io::Cursor;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::types::{MuxError, Result};

/// Kind of a frame, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A call that expects a response with the same id
    Request,
    /// The answer to a pending request
    Response,
    /// Everything else: fanned out, never correlated
    Signal,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

/// Routing metadata extracted from a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Correlation id; `0` when the envelope carries none
    pub id: u64,
}

/// Inspect a transport message.
///
/// Binary and text frames are decoded from their bytes. Control frames are a
/// representation this decoder does not handle and fail with
/// [`MuxError::UnsupportedFrame`].
pub fn inspect(message: &Message) -> Result<FrameHeader> {
    match message {
        Message::Binary(data) => inspect_bytes(data),
        Message::Text(text) => inspect_bytes(text.as_bytes()),
        Message::Ping(_) => Err(MuxError::UnsupportedFrame("ping")),
        Message::Pong(_) => Err(MuxError::UnsupportedFrame("pong")),
        Message::Close(_) => Err(MuxError::UnsupportedFrame("close")),
        Message::Frame(_) => Err(MuxError::UnsupportedFrame("raw frame")),
    }
}

/// Inspect a borrowed MessagePack buffer
pub fn inspect_bytes(data: &[u8]) -> Result<FrameHeader> {
    header_of(&decode_envelope(data)?)
}

/// Decode an envelope into its map entries
pub(crate) fn decode_envelope(data: &[u8]) -> Result<Vec<(Value, Value)>> {
    let mut cursor = Cursor::new(data);
    let envelope = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| MuxError::MalformedFrame(format!("failed to decode envelope: {}", e)))?;

    match envelope {
        Value::Map(map) => Ok(map),
        _ => Err(MuxError::MalformedFrame("envelope is not a map".into())),
    }
}

/// Routing metadata of a decoded envelope
pub(crate) fn header_of(map: &[(Value, Value)]) -> Result<FrameHeader> {
    let msg_type = get_string_field(map, "type")
        .ok_or_else(|| MuxError::MalformedFrame("missing 'type' field".into()))?;

    let kind = match msg_type {
        "request" => FrameKind::Request,
        "response" => FrameKind::Response,
        _ => FrameKind::Signal,
    };

    let id = match (kind, get_field(map, "id").and_then(Value::as_u64)) {
        (_, Some(id)) => id,
        (FrameKind::Signal, None) => 0,
        (kind, None) => {
            return Err(MuxError::MalformedFrame(format!(
                "{} without an unsigned 'id'",
                kind
            )))
        }
    };

    Ok(FrameHeader { kind, id })
}

/// The envelope's `data` bytes
pub(crate) fn payload(map: &[(Value, Value)]) -> Option<&[u8]> {
    match get_field(map, "data") {
        Some(Value::Binary(data)) => Some(data.as_slice()),
        _ => None,
    }
}

/// Get a string field from a MessagePack map
pub(crate) fn get_string_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    match get_field(map, key) {
        Some(Value::String(s)) => s.as_str(),
        _ => None,
    }
}

/// Get a field from a MessagePack map
pub(crate) fn get_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::String(s) if s.as_str() == Some(key)))
        .map(|(_, v)| v)
}

/// Encode an envelope `{ type, id, data }` (used by tests and the admin client)
pub fn encode_envelope(msg_type: &str, id: Option<u64>, data: &[u8]) -> Vec<u8> {
    let mut fields = Vec::with_capacity(3);
    if let Some(id) = id {
        fields.push((Value::String("id".into()), Value::Integer(id.into())));
    }
    fields.push((Value::String("type".into()), Value::String(msg_type.into())));
    fields.push((Value::String("data".into()), Value::Binary(data.to_vec())));

    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = rmpv::encode::write_value(&mut buf, &Value::Map(fields));
    buf
}
