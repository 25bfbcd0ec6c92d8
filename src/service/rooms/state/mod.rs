// =============================================================================
// Matrixon Sync - Room State
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Latest state event per (type, state key) for a single room, applied
//   in observation order and never rolled back.
//
// =============================================================================

use std::collections::{HashMap, HashSet};

use matrixon_sync_core::RoomEvent;
use ruma::{OwnedRoomId, RoomId};

#[derive(Debug, Clone)]
struct StateEntry {
    event: RoomEvent,
    /// Position in the order this room's state events were observed
    order: u64,
}

/// Latest state event per `(event type, state key)` for one room.
#[derive(Debug, Clone)]
pub struct RoomState {
    room_id: OwnedRoomId,
    entries: HashMap<(String, String), StateEntry>,
    applied_event_ids: HashSet<String>,
    next_order: u64,
}

impl RoomState {
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            entries: HashMap::new(),
            applied_event_ids: HashSet::new(),
            next_order: 0,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Apply one state event. Returns whether the table changed.
    ///
    /// Non-state events, events already applied (by event id) and stripped
    /// events identical to the stored one are no-ops, so replaying a batch
    /// never rolls the table back.
    pub fn apply(&mut self, event: &RoomEvent) -> bool {
        let Some(state_key) = &event.state_key else {
            return false;
        };
        let key = (event.event_type.clone(), state_key.clone());

        match &event.event_id {
            Some(event_id) => {
                if !self.applied_event_ids.insert(event_id.clone()) {
                    return false;
                }
            }
            None => {
                if self.entries.get(&key).is_some_and(|entry| &entry.event == event) {
                    return false;
                }
            }
        }

        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            key,
            StateEntry {
                event: event.clone(),
                order,
            },
        );
        true
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&RoomEvent> {
        self.entries
            .get(&(event_type.to_owned(), state_key.to_owned()))
            .map(|entry| &entry.event)
    }

    /// All current state events, oldest observation first.
    pub fn events(&self) -> Vec<RoomEvent> {
        let mut entries: Vec<&StateEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.order);
        entries.into_iter().map(|entry| entry.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
