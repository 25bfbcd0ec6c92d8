//! Wire types for the two sync protocols
//!
//! Field names follow the Matrix client-server API bit for bit: the classic
//! `GET /sync` long poll and the unstable windowed (MSC3575) `POST /sync`.

use std::{collections::BTreeMap, fmt::Display, time::Duration};

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::types::RoomEvent;

/// Client-side request timeout once a cursor exists
pub const INCREMENTAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(40);

/// Client-side request timeout for the very first poll
pub const INITIAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Presence hint sent with each classic poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
    Unavailable,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "online",
            PresenceState::Offline => "offline",
            PresenceState::Unavailable => "unavailable",
        }
    }
}

/// One classic `GET /sync` poll
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub since: Option<String>,
    pub filter: Option<String>,
    /// Server-side long-poll timeout
    pub timeout_ms: u64,
    pub full_state: bool,
    pub presence: Option<PresenceState>,
    /// How long the transport waits for the whole response
    pub request_timeout: Duration,
}

impl SyncRequest {
    /// Build a poll for `since`, choosing the client-side timeout from whether
    /// this is the initial poll.
    pub fn new(since: Option<String>, filter: Option<String>, timeout_ms: u64) -> Self {
        let request_timeout = if since.is_some() {
            INCREMENTAL_REQUEST_TIMEOUT
        } else {
            INITIAL_REQUEST_TIMEOUT
        };
        Self {
            since,
            filter,
            timeout_ms,
            full_state: false,
            presence: None,
            request_timeout,
        }
    }

    pub fn with_presence(mut self, presence: Option<PresenceState>) -> Self {
        self.presence = presence;
        self
    }

    /// Query string pairs; absent values are omitted rather than sent empty.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("full_state", self.full_state.to_string()),
            ("timeout", self.timeout_ms.to_string()),
        ];
        if let Some(since) = &self.since {
            pairs.push(("since", since.clone()));
        }
        if let Some(filter) = &self.filter {
            pairs.push(("filter", filter.clone()));
        }
        if let Some(presence) = self.presence {
            pairs.push(("presence", presence.as_str().to_string()));
        }
        pairs
    }
}

/// Identifiers the server got wrong are dropped with a warning instead of
/// failing the whole batch, which would otherwise be re-polled forever.
mod lenient {
    use super::*;

    fn parse<I>(raw: String) -> Option<I>
    where
        I: TryFrom<String>,
        I::Error: Display,
    {
        match I::try_from(raw.clone()) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(id = %raw, error = %e, "Skipping malformed identifier in sync response");
                None
            }
        }
    }

    pub fn id_map<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: TryFrom<String> + Ord,
        K::Error: Display,
        V: Deserialize<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, value)| parse(key).map(|id| (id, value)))
            .collect())
    }

    pub fn ids<'de, D, I>(deserializer: D) -> Result<Vec<I>, D::Error>
    where
        D: Deserializer<'de>,
        I: TryFrom<String>,
        I::Error: Display,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        Ok(raw.into_iter().filter_map(parse).collect())
    }

    pub fn optional_id<'de, D, I>(deserializer: D) -> Result<Option<I>, D::Error>
    where
        D: Deserializer<'de>,
        I: TryFrom<String>,
        I::Error: Display,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.and_then(parse))
    }
}

/// `{ "events": [...] }` wrapper used all over the sync response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch<T> {
    #[serde(default = "Vec::new")]
    pub events: Vec<T>,
}

impl<T> Default for EventBatch<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// Timeline section of a room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub state: EventBatch<RoomEvent>,
    #[serde(default)]
    pub account_data: EventBatch<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventBatch<RoomEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub state: EventBatch<RoomEvent>,
    #[serde(default)]
    pub account_data: EventBatch<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default, deserialize_with = "lenient::id_map")]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    #[serde(default, deserialize_with = "lenient::id_map")]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
    #[serde(default, deserialize_with = "lenient::id_map")]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default, deserialize_with = "lenient::ids")]
    pub changed: Vec<OwnedUserId>,
    #[serde(default, deserialize_with = "lenient::ids")]
    pub left: Vec<OwnedUserId>,
}

/// Classic `GET /sync` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub account_data: EventBatch<Value>,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub to_device: EventBatch<Value>,
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_unused_fallback_key_types: Option<Vec<String>>,
    #[serde(
        default,
        rename = "org.matrix.msc2732.device_unused_fallback_key_types",
        skip_serializing_if = "Option::is_none"
    )]
    pub unstable_device_unused_fallback_key_types: Option<Vec<String>>,
    #[serde(default)]
    pub device_lists: DeviceLists,
}

impl SyncResponse {
    /// Unused fallback key algorithms, preferring the unstable field.
    pub fn unused_fallback_key_types(&self) -> Vec<String> {
        self.unstable_device_unused_fallback_key_types
            .clone()
            .or_else(|| self.device_unused_fallback_key_types.clone())
            .unwrap_or_default()
    }
}

/// Server-side filters of one windowed list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_invite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name_like: Option<String>,
}

/// One list entry of a windowed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    /// `[start, end)` windows the client wants kept in sync
    pub rooms: Vec<[u64; 2]>,
    pub sort: Vec<String>,
    /// `[event type, state key]` pairs
    pub required_state: Vec<[String; 2]>,
    pub timeline_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<ListFilters>,
}

/// Windowed `POST /sync` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingSyncRequest {
    pub lists: Vec<ListRequest>,
}

/// Room payload carried by SYNC/INSERT/UPDATE operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPayload {
    #[serde(
        default,
        deserialize_with = "lenient::optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub room_id: Option<OwnedRoomId>,
    #[serde(default)]
    pub required_state: Vec<RoomEvent>,
    #[serde(default)]
    pub timeline: Vec<RoomEvent>,
    #[serde(default)]
    pub invite_state: Vec<RoomEvent>,
}

/// A list operation, applied strictly in the order received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum ListOperation {
    Sync {
        list: usize,
        range: [u64; 2],
        #[serde(default)]
        rooms: Vec<Option<RoomPayload>>,
    },
    Update {
        list: usize,
        index: u64,
        room: RoomPayload,
    },
    Insert {
        list: usize,
        index: u64,
        room: RoomPayload,
    },
    Delete {
        list: usize,
        index: u64,
    },
    Invalidate {
        list: usize,
        range: [u64; 2],
    },
}

impl ListOperation {
    /// Index of the list this operation targets.
    pub fn list(&self) -> usize {
        match self {
            ListOperation::Sync { list, .. }
            | ListOperation::Update { list, .. }
            | ListOperation::Insert { list, .. }
            | ListOperation::Delete { list, .. }
            | ListOperation::Invalidate { list, .. } => *list,
        }
    }
}

/// Windowed `POST /sync` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingSyncResponse {
    pub pos: String,
    /// Authoritative total per list, by list index
    #[serde(default)]
    pub counts: Vec<u64>,
    #[serde(default)]
    pub ops: Vec<ListOperation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_query_omits_absent_values() {
        let request = SyncRequest::new(None, None, 30_000);
        let pairs = request.query_pairs();
        assert!(pairs.iter().all(|(k, _)| *k != "since" && *k != "filter"));
        assert!(pairs.contains(&("full_state", "false".to_string())));
        assert_eq!(request.request_timeout, INITIAL_REQUEST_TIMEOUT);

        let request = SyncRequest::new(Some("s1".into()), Some("7".into()), 30_000)
            .with_presence(Some(PresenceState::Offline));
        let pairs = request.query_pairs();
        assert!(pairs.contains(&("since", "s1".to_string())));
        assert!(pairs.contains(&("filter", "7".to_string())));
        assert!(pairs.contains(&("presence", "offline".to_string())));
        assert_eq!(request.request_timeout, INCREMENTAL_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_decodes_sync_response() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s72595_4483_1934",
            "rooms": {
                "join": {
                    "!a:example.org": {
                        "timeline": { "events": [
                            { "type": "m.room.message", "sender": "@alice:example.org",
                              "event_id": "$1", "content": { "body": "hi" } }
                        ] }
                    }
                },
                "leave": { "!gone:example.org": {} }
            },
            "device_unused_fallback_key_types": ["stable"],
            "org.matrix.msc2732.device_unused_fallback_key_types": ["signed_curve25519"]
        }))
        .unwrap();

        assert_eq!(response.next_batch, "s72595_4483_1934");
        assert_eq!(response.rooms.join.len(), 1);
        assert_eq!(response.rooms.leave.len(), 1);
        assert_eq!(response.unused_fallback_key_types(), vec!["signed_curve25519"]);
    }

    #[test]
    fn test_decodes_list_operations() {
        let response: SlidingSyncResponse = serde_json::from_value(json!({
            "pos": "12",
            "counts": [3],
            "ops": [
                { "op": "SYNC", "list": 0, "range": [0, 3],
                  "rooms": [ { "room_id": "!a:example.org" }, null, { "room_id": "!c:example.org" } ] },
                { "op": "DELETE", "list": 0, "index": 1 },
                { "op": "INVALIDATE", "list": 0, "range": [0, 1000] }
            ]
        }))
        .unwrap();

        assert_eq!(response.ops.len(), 3);
        match &response.ops[0] {
            ListOperation::Sync { range, rooms, .. } => {
                assert_eq!(*range, [0, 3]);
                assert!(rooms[1].is_none());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(response.ops[1], ListOperation::Delete { list: 0, index: 1 });
    }

    #[test]
    fn test_malformed_ids_are_skipped() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!good:example.org": {},
                    "not-a-room-id": {}
                },
                "leave": { "": {} }
            },
            "device_lists": { "changed": ["@alice:example.org", "alice"], "left": [""] }
        }))
        .unwrap();

        let joined: Vec<&str> = response.rooms.join.keys().map(|id| id.as_str()).collect();
        assert_eq!(joined, vec!["!good:example.org"]);
        assert!(response.rooms.leave.is_empty());
        assert_eq!(response.device_lists.changed.len(), 1);
        assert!(response.device_lists.left.is_empty());

        let payload: RoomPayload =
            serde_json::from_value(json!({ "room_id": "garbage", "timeline": [] })).unwrap();
        assert_eq!(payload.room_id, None);
    }
}
