// =============================================================================
// Matrixon Sync - Windowed Room Projection
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-room view kept by the windowed engine: required state merged field
//   by field plus a short timeline, with a lossy persisted form.
//
// =============================================================================

use matrixon_sync_core::{EventKind, Membership, RoomEvent, RoomPayload};
use ruma::{OwnedRoomId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timeline events kept per room for consumers peeking at recent history
const TIMELINE_HISTORY: usize = 50;

/// The required-state fields tracked for every windowed room.
///
/// Each field is overwritten only when an event for that field arrives;
/// a delta that carries just a topic leaves the name alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequiredState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Content of `m.room.encryption`, present once the room is encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_membership: Option<Membership>,
}

impl RequiredState {
    /// Fold one state event in. Returns whether a tracked field changed.
    fn apply(&mut self, user_id: &UserId, event: &RoomEvent) -> bool {
        if !event.is_state() {
            return false;
        }
        match &event.kind {
            EventKind::Name { name } if event.has_empty_state_key() => {
                replace(&mut self.name, name.clone())
            }
            EventKind::Topic { topic } if event.has_empty_state_key() => {
                replace(&mut self.topic, topic.clone())
            }
            EventKind::Encryption if event.has_empty_state_key() => {
                replace(&mut self.encryption, Some(event.content.clone()))
            }
            EventKind::Member { membership } if event.state_key.as_deref() == Some(user_id.as_str()) => {
                replace(&mut self.own_membership, Some(membership.clone()))
            }
            _ => false,
        }
    }
}

fn replace<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Client-side view of one room delivered by the windowed protocol
#[derive(Debug, Clone, PartialEq)]
pub struct V3Room {
    room_id: OwnedRoomId,
    required_state: RequiredState,
    timeline: Vec<RoomEvent>,
}

/// Lossy persisted shape of a [`V3Room`]: required state only, no timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossyRoom {
    pub room_id: OwnedRoomId,
    #[serde(flatten)]
    pub required_state: RequiredState,
}

impl V3Room {
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            required_state: RequiredState::default(),
            timeline: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn required_state(&self) -> &RequiredState {
        &self.required_state
    }

    pub fn name(&self) -> Option<&str> {
        self.required_state.name.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.required_state.topic.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.required_state.encryption.is_some()
    }

    pub fn own_membership(&self) -> Option<&Membership> {
        self.required_state.own_membership.as_ref()
    }

    pub fn timeline(&self) -> &[RoomEvent] {
        &self.timeline
    }

    /// Merge a payload: required state field by field, then timeline events
    /// (whose state events also feed the tracked fields).
    pub fn apply_payload(&mut self, user_id: &UserId, payload: &RoomPayload) {
        for event in payload.required_state.iter().chain(payload.invite_state.iter()) {
            self.required_state.apply(user_id, event);
        }
        for event in &payload.timeline {
            self.required_state.apply(user_id, event);
        }
        self.timeline.extend(payload.timeline.iter().cloned());
        if self.timeline.len() > TIMELINE_HISTORY {
            let excess = self.timeline.len() - TIMELINE_HISTORY;
            self.timeline.drain(..excess);
        }
    }

    pub fn lossy_serialized(&self) -> LossyRoom {
        LossyRoom {
            room_id: self.room_id.clone(),
            required_state: self.required_state.clone(),
        }
    }

    pub fn from_lossy(lossy: LossyRoom) -> Self {
        Self {
            room_id: lossy.room_id,
            required_state: lossy.required_state,
            timeline: Vec::new(),
        }
    }
}
