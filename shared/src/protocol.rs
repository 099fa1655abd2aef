//! Wire protocol for the duel relay
//!
//! Every frame is one JSON object tagged by a `type` field, carried in a
//! WebSocket text message. Both directions use closed enums so a frame is
//! decoded exactly once at the transport boundary and matched exhaustively
//! afterwards:
//! - [`ClientFrame`]: everything a client may send to the relay
//! - [`ServerFrame`]: everything the relay sends back
//!
//! Malformed input (invalid JSON, a non-object, an unknown tag, missing
//! fields) decodes to `None` and is dropped by the caller. The relay treats
//! bad frames as silence, never as an error.
//!
//! The one frame outside the closed set is the NOTIFY delivery
//! `{type: <event>, payload}`: its tag is chosen by the sending client, so it
//! is built with [`notice_frame`] and recovered with [`decode_notice`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity attached to a connection by HELLO or HELLO_USER.
///
/// The id and display name come from the account layer; the relay only
/// stores and echoes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
}

/// One roster entry in a SNAPSHOT broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    pub id: String,
    pub name: String,
    pub ready: bool,
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Join a room. With a `user` the connection also enters the room's
    /// presence roster.
    Hello {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserProfile>,
    },
    /// Toggle the requester's ready flag in its current room.
    Ready { ready: bool },
    /// Associate a user identity without joining any room.
    HelloUser { user: UserProfile },
    /// Ask the relay to deliver `{type: event, payload}` to every connection
    /// recorded under `toUserId`, wherever it is.
    #[serde(rename_all = "camelCase")]
    Notify {
        to_user_id: String,
        event: String,
        payload: Value,
    },
    /// Leave the current room.
    Leave,
    /// Application-level liveness probe; answered with PONG.
    Ping,
    /// Relay an opaque payload to the other members of `room`.
    Event { room: String, payload: Value },
}

/// Frames the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// HELLO accepted; the connection is now in `room`.
    Ack { room: String },
    /// HELLO_USER accepted.
    AckUser,
    /// Current presence roster of `room`.
    Snapshot { room: String, users: Vec<RoomUser> },
    /// A user left `room` (clean LEAVE or liveness prune).
    #[serde(rename_all = "camelCase")]
    Left { room: String, user_id: String },
    /// Greeting sent right after the WebSocket handshake. `ts` is unix millis.
    Connected { ts: u64 },
    /// Answer to PING.
    Pong,
    /// A payload relayed from another member of `room`.
    Event { room: String, payload: Value },
}

impl ClientFrame {
    /// Serializes the frame to its wire form.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

impl ServerFrame {
    /// Serializes the frame to its wire form.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

/// Decodes one inbound client frame. Malformed input is `None`, not an error.
pub fn decode_client_frame(text: &str) -> Option<ClientFrame> {
    serde_json::from_str(text).ok()
}

/// Decodes one inbound server frame. Malformed input is `None`, not an error.
pub fn decode_server_frame(text: &str) -> Option<ServerFrame> {
    serde_json::from_str(text).ok()
}

/// Builds the NOTIFY delivery frame `{type: <event>, payload}`.
///
/// The tag is caller-supplied, so this frame cannot live in [`ServerFrame`].
pub fn notice_frame(event: &str, payload: &Value) -> String {
    serde_json::json!({ "type": event, "payload": payload }).to_string()
}

/// Recovers `(event, payload)` from a frame whose tag is outside the fixed
/// protocol, i.e. a NOTIFY delivery. Anything without a string `type` is
/// `None`.
pub fn decode_notice(text: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let event = value.get("type")?.as_str()?.to_string();
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    Some((event, payload))
}
