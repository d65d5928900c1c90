//! # Socket.IO Framing
//!
//! Engine.IO v4 / Socket.IO v4 text packets as carried over a WebSocket.
//!
//! | text            | meaning                                  |
//! |-----------------|------------------------------------------|
//! | `0{...}`        | Engine.IO open (sid, ping interval/timeout) |
//! | `1`             | Engine.IO close                          |
//! | `2` / `3`       | ping / pong                              |
//! | `40` / `41`     | Socket.IO connect / disconnect           |
//! | `42[..]`        | event, optional ack id digits after `42` |
//! | `44{...}`       | connect error                            |
//!
//! Only the default namespace is handled; packets for any other namespace
//! decode to [`Packet::Unsupported`].

use serde::Deserialize;
use serde_json::Value;

use crate::core::errors::{TransportError, TransportResult};

/// Socket.IO connect request for the default namespace.
pub const CONNECT: &str = "40";
/// Engine.IO pong.
pub const PONG: &str = "3";
/// Socket.IO disconnect for the default namespace.
pub const DISCONNECT: &str = "41";

/// Parameters announced by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine.IO session id.
    pub sid: String,
    /// Server ping cadence.
    #[serde(default)]
    pub ping_interval: u64,
    /// Silence tolerated before the server drops us.
    #[serde(default)]
    pub ping_timeout: u64,
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO open.
    Open(OpenHandshake),
    /// Engine.IO close.
    Close,
    /// Server heartbeat; must be answered with [`PONG`].
    Ping,
    /// Heartbeat answer.
    Pong,
    /// Engine.IO noop.
    Noop,
    /// Namespace joined.
    Connect,
    /// Namespace left (server side kick).
    Disconnect,
    /// Named event with its arguments.
    Event {
        /// Event name.
        name: String,
        /// Remaining array elements after the name.
        args: Vec<Value>,
        /// Acknowledgement id when the sender expects one.
        ack_id: Option<u64>,
    },
    /// The server refused the namespace connection.
    ConnectError(String),
    /// Valid framing this client does not act on (acks, binary, other namespaces).
    Unsupported(String),
}

/// Decodes one WebSocket text frame.
pub fn decode(text: &str) -> TransportResult<Packet> {
    let mut chars = text.chars();
    let engine_type = chars
        .next()
        .ok_or_else(|| TransportError::Malformed("empty frame".to_string()))?;
    let rest = chars.as_str();

    match engine_type {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(rest),
        '6' => Ok(Packet::Noop),
        other => Err(TransportError::Malformed(format!("unknown engine packet type {other:?}"))),
    }
}

fn decode_socket(text: &str) -> TransportResult<Packet> {
    let mut chars = text.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| TransportError::Malformed("empty socket packet".to_string()))?;
    let mut rest = chars.as_str();

    if rest.starts_with('/') {
        let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
        if namespace != "/" {
            return Ok(Packet::Unsupported(text.to_string()));
        }
        rest = tail;
    }

    match socket_type {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(rest),
        '4' => Ok(Packet::ConnectError(connect_error_message(rest))),
        _ => Ok(Packet::Unsupported(text.to_string())),
    }
}

fn decode_event(text: &str) -> TransportResult<Packet> {
    let digits = text.chars().take_while(char::is_ascii_digit).count();
    let (ack, body) = text.split_at(digits);
    let ack_id = if ack.is_empty() {
        None
    } else {
        Some(
            ack.parse::<u64>()
                .map_err(|e| TransportError::Malformed(format!("bad ack id: {e}")))?,
        )
    };

    let mut items: Vec<Value> = serde_json::from_str(body)?;
    if items.is_empty() {
        return Err(TransportError::Malformed("event without name".to_string()));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        other => return Err(TransportError::Malformed(format!("event name is not a string: {other}"))),
    };
    Ok(Packet::Event { name, args: items, ack_id })
}

fn connect_error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.to_string())
}

/// Encodes a default-namespace event with one argument.
pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(name.to_string()), data.clone()]))
}
