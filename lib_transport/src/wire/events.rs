//! # Inbound Event Validation
//!
//! Schema checks at the transport boundary. Raw JSON from the channel or the
//! REST API either becomes typed [`TransportEvent`]s or is rejected as
//! malformed; no code past this module looks at `serde_json::Value`.
//!
//! The server is loose with numbers (ids arrive as `5`, `"5"` or `5.0`
//! depending on the code path), so id fields accept all three.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::errors::{TransportError, TransportResult};
use crate::core::events::TransportEvent;
use crate::core::types::{InboundMessageEvent, MessageTarget, TransportMode};

/// Direct-message event names, current and legacy.
pub const DIRECT_MESSAGE_EVENTS: [&str; 4] =
    ["private_message", "new_message", "private_message_page", "page_message"];
/// Group message event.
pub const GROUP_MESSAGE_EVENT: &str = "group_message";
/// Typing start/stop.
pub const TYPING_EVENT: &str = "typing";
/// Typing stop (legacy).
pub const TYPING_DONE_EVENT: &str = "typing_done";
/// Last seen heartbeat.
pub const LAST_SEEN_EVENT: &str = "ping_for_lastseen";
/// Read receipt.
pub const SEEN_EVENT: &str = "seen_messages";
/// User online.
pub const USER_ONLINE_EVENT: &str = "on_user_loggedin";
/// User offline.
pub const USER_OFFLINE_EVENT: &str = "on_user_loggedoff";
/// Presence as markup fragments.
pub const STATUS_CHANGE_EVENT: &str = "user_status_change";

/// `is_typing` value the server sends while the peer types.
const TYPING_ACTIVE_CODE: u64 = 200;

static ONLINE_ID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r#"id="online_(\d+)""#).ok());

/// # Parse Channel Event
///
/// Maps one named Socket.IO event to zero or more transport events.
///
/// # Returns
/// - `Ok(events)`: recognised; `events` may be empty (e.g. a fragment with no ids).
/// - `Ok(vec![])` as well for event names this client does not handle.
/// - `Err(Malformed)`: recognised name, unusable payload.
pub fn parse_channel_event(name: &str, args: &[Value]) -> TransportResult<Vec<TransportEvent>> {
    let first = args.first();

    if DIRECT_MESSAGE_EVENTS.contains(&name) || name == GROUP_MESSAGE_EVENT {
        let payload = first.ok_or_else(|| missing(name, "payload"))?;
        let message = parse_message(payload, TransportMode::PersistentChannel)?;
        if name == GROUP_MESSAGE_EVENT && !matches!(message.target, MessageTarget::Group { .. }) {
            return Err(missing(name, "group_id"));
        }
        return Ok(vec![TransportEvent::Message(message)]);
    }

    match name {
        TYPING_EVENT | TYPING_DONE_EVENT => {
            let data = object(name, first)?;
            let sender_id = field_u64(data, "sender_id").ok_or_else(|| missing(name, "sender_id"))?;
            let is_typing = name == TYPING_EVENT
                && match data.get("is_typing") {
                    Some(Value::Bool(b)) => *b,
                    Some(v) => lenient_u64(v) == Some(TYPING_ACTIVE_CODE),
                    None => false,
                };
            Ok(vec![TransportEvent::Typing { sender_id, is_typing }])
        }
        LAST_SEEN_EVENT => {
            let data = object(name, first)?;
            let user_id = field_u64(data, "user_id").ok_or_else(|| missing(name, "user_id"))?;
            let last_seen = data.get("last_seen").and_then(lenient_i64).unwrap_or(0);
            Ok(vec![TransportEvent::LastSeen { user_id, last_seen }])
        }
        SEEN_EVENT => {
            let data = object(name, first)?;
            let message_id = field_u64(data, "message_id").ok_or_else(|| missing(name, "message_id"))?;
            let user_id = field_u64(data, "user_id").ok_or_else(|| missing(name, "user_id"))?;
            Ok(vec![TransportEvent::ReadReceipt { message_id, user_id }])
        }
        USER_ONLINE_EVENT | USER_OFFLINE_EVENT => {
            let user_id = first
                .and_then(|v| match v {
                    Value::Object(_) => field_u64(v, "user_id"),
                    other => lenient_u64(other),
                })
                .filter(|id| *id > 0)
                .ok_or_else(|| missing(name, "user_id"))?;
            Ok(vec![TransportEvent::Presence {
                user_id,
                online: name == USER_ONLINE_EVENT,
            }])
        }
        STATUS_CHANGE_EVENT => {
            let Some(data) = first.filter(|v| v.is_object()) else {
                return Ok(Vec::new());
            };
            let mut events = Vec::new();
            for (key, online) in [("online_users", true), ("offline_users", false)] {
                let fragment = data.get(key).and_then(Value::as_str).unwrap_or_default();
                events.extend(
                    extract_presence_ids(fragment)
                        .into_iter()
                        .map(|user_id| TransportEvent::Presence { user_id, online }),
                );
            }
            Ok(events)
        }
        _ => Ok(Vec::new()),
    }
}

/// # Parse Message
///
/// Validates one message object (channel payload or REST list item).
///
/// Required: `id`, `from_id`, and one of `group_id` (non-zero) or `to_id`.
/// Optional with defaults: `text` (""), `time` (0), `type` ("text"), `media`.
pub fn parse_message(value: &Value, via: TransportMode) -> TransportResult<InboundMessageEvent> {
    if !value.is_object() {
        return Err(TransportError::Malformed(format!("message is not an object: {value}")));
    }
    let id = field_u64(value, "id").ok_or_else(|| missing("message", "id"))?;
    let from_id = field_u64(value, "from_id").ok_or_else(|| missing("message", "from_id"))?;

    let target = match field_u64(value, "group_id").filter(|g| *g > 0) {
        Some(group_id) => MessageTarget::Group { group_id },
        None => MessageTarget::Direct {
            to_id: field_u64(value, "to_id").ok_or_else(|| missing("message", "to_id"))?,
        },
    };

    let body = value.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
    let timestamp = value.get("time").and_then(lenient_i64).unwrap_or(0);
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("text")
        .to_string();
    let media_url = value
        .get("media")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(InboundMessageEvent {
        id,
        from_id,
        target,
        body,
        timestamp,
        kind,
        media_url,
        via,
    })
}

/// Pulls user ids out of a presence markup fragment. Unparseable input
/// yields nothing.
pub fn extract_presence_ids(fragment: &str) -> Vec<u64> {
    let Some(re) = ONLINE_ID.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(fragment)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .collect()
}

/// Accepts `5`, `"5"` and `5.0`.
pub fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Signed variant of [`lenient_u64`].
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_u64(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(lenient_u64)
}

fn object<'a>(name: &str, value: Option<&'a Value>) -> TransportResult<&'a Value> {
    value
        .filter(|v| v.is_object())
        .ok_or_else(|| TransportError::Malformed(format!("{name}: payload is not an object")))
}

fn missing(name: &str, field: &str) -> TransportError {
    TransportError::Malformed(format!("{name}: missing or invalid {field}"))
}
