//! Core event model for the Matrixon sync engine
//!
//! Raw JSON events coming off the wire are decoded exactly once into
//! [`RoomEvent`], which carries a closed [`EventKind`] computed from the
//! `type`, `state_key` and `content` fields. Everything downstream matches on
//! the kind instead of comparing type strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known event type names
pub mod event_type {
    pub const ROOM_MESSAGE: &str = "m.room.message";
    pub const ROOM_MEMBER: &str = "m.room.member";
    pub const ROOM_TOMBSTONE: &str = "m.room.tombstone";
    pub const ROOM_CREATE: &str = "m.room.create";
    pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
    pub const ROOM_NAME: &str = "m.room.name";
    pub const ROOM_TOPIC: &str = "m.room.topic";
    pub const ROOM_ENCRYPTION: &str = "m.room.encryption";
}

/// Membership state carried by `m.room.member` events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    #[serde(other)]
    Unknown,
}

impl Membership {
    /// Whether this membership removes the user from the room.
    pub fn is_departure(&self) -> bool {
        matches!(self, Membership::Leave | Membership::Ban)
    }

    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("join") => Membership::Join,
            Some("invite") => Membership::Invite,
            Some("leave") => Membership::Leave,
            Some("ban") => Membership::Ban,
            Some("knock") => Membership::Knock,
            _ => Membership::Unknown,
        }
    }
}

/// Closed classification of an event, decoded once at the protocol boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `m.room.message`
    Message,
    /// `m.room.member`
    Member { membership: Membership },
    /// `m.room.tombstone`
    Tombstone { replacement_room: Option<String> },
    /// `m.room.create`, with the predecessor room if this is an upgrade
    Create { predecessor: Option<String> },
    /// `m.room.encrypted`
    Encrypted,
    /// `m.room.name`
    Name { name: Option<String> },
    /// `m.room.topic`
    Topic { topic: Option<String> },
    /// `m.room.encryption`
    Encryption,
    /// Anything else
    Other,
}

impl EventKind {
    fn decode(event_type: &str, content: &Value) -> Self {
        let string_field = |key: &str| content.get(key).and_then(Value::as_str).map(str::to_owned);
        match event_type {
            event_type::ROOM_MESSAGE => EventKind::Message,
            event_type::ROOM_MEMBER => EventKind::Member {
                membership: Membership::parse(content.get("membership")),
            },
            event_type::ROOM_TOMBSTONE => EventKind::Tombstone {
                replacement_room: string_field("replacement_room"),
            },
            event_type::ROOM_CREATE => EventKind::Create {
                predecessor: content
                    .get("predecessor")
                    .and_then(|p| p.get("room_id"))
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned),
            },
            event_type::ROOM_ENCRYPTED => EventKind::Encrypted,
            event_type::ROOM_NAME => EventKind::Name {
                name: string_field("name"),
            },
            event_type::ROOM_TOPIC => EventKind::Topic {
                topic: string_field("topic"),
            },
            event_type::ROOM_ENCRYPTION => EventKind::Encryption,
            _ => EventKind::Other,
        }
    }
}

/// `unsigned` block of an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    /// Milliseconds since the server saw the event, relative to this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Wire shape of an event; only used for (de)serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRoomEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(default)]
    sender: String,
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_server_ts: Option<u64>,
    #[serde(default = "empty_object")]
    content: Value,
    #[serde(default)]
    unsigned: Unsigned,
    #[serde(flatten)]
    other: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A room event (timeline, state, stripped invite state or leave timeline)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRoomEvent", into = "RawRoomEvent")]
pub struct RoomEvent {
    pub event_id: Option<String>,
    pub sender: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub origin_server_ts: Option<u64>,
    pub content: Value,
    pub unsigned: Unsigned,
    /// Remaining top-level fields, kept so the event re-serializes faithfully
    pub other: Map<String, Value>,
    /// Decoded classification
    pub kind: EventKind,
}

impl From<RawRoomEvent> for RoomEvent {
    fn from(raw: RawRoomEvent) -> Self {
        let kind = EventKind::decode(&raw.event_type, &raw.content);
        Self {
            event_id: raw.event_id,
            sender: raw.sender,
            event_type: raw.event_type,
            state_key: raw.state_key,
            origin_server_ts: raw.origin_server_ts,
            content: raw.content,
            unsigned: raw.unsigned,
            other: raw.other,
            kind,
        }
    }
}

impl From<RoomEvent> for RawRoomEvent {
    fn from(event: RoomEvent) -> Self {
        Self {
            event_id: event.event_id,
            sender: event.sender,
            event_type: event.event_type,
            state_key: event.state_key,
            origin_server_ts: event.origin_server_ts,
            content: event.content,
            unsigned: event.unsigned,
            other: event.other,
        }
    }
}

impl RoomEvent {
    /// Decode a raw JSON value.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Re-encode as raw JSON.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Relative recency within one response; a missing age counts as 0.
    pub fn age(&self) -> i64 {
        self.unsigned.age.unwrap_or(0)
    }

    /// Whether this is a state event (has a state key, possibly empty).
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Whether this is a state event with the empty state key.
    pub fn has_empty_state_key(&self) -> bool {
        self.state_key.as_deref() == Some("")
    }

    /// Membership carried by this event, if it is an `m.room.member` event.
    pub fn membership(&self) -> Option<&Membership> {
        match &self.kind {
            EventKind::Member { membership } => Some(membership),
            _ => None,
        }
    }

    /// Membership of `user_id` if this event is that user's own member event.
    pub fn own_membership(&self, user_id: &str) -> Option<&Membership> {
        if self.state_key.as_deref() == Some(user_id) {
            self.membership()
        } else {
            None
        }
    }
}
