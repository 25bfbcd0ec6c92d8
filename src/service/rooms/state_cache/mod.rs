// =============================================================================
// Matrixon Sync - Room State Cache
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   State tables for every known room. Written by the sync task, readable
//   concurrently by consumers, dropped when the user leaves a room.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc};

use matrixon_sync_core::RoomEvent;
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::RwLock;
use tracing::debug;

use super::state::RoomState;

/// Room state tables for every room the client currently knows about.
///
/// Written only by the sync task; consumers may read concurrently.
#[derive(Debug, Clone, Default)]
pub struct RoomStateCache {
    rooms: Arc<RwLock<HashMap<OwnedRoomId, RoomState>>>,
}

impl RoomStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply state events to a room, creating its table on first sight.
    /// Returns how many entries changed.
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    pub async fn apply_state_events(&self, room_id: &RoomId, events: &[RoomEvent]) -> usize {
        let state_events: Vec<&RoomEvent> = events.iter().filter(|e| e.is_state()).collect();
        if state_events.is_empty() {
            return 0;
        }

        let mut rooms = self.rooms.write().await;
        let state = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| RoomState::new(room_id.to_owned()));
        state_events.into_iter().filter(|event| state.apply(event)).count()
    }

    pub async fn get_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Option<RoomEvent> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .and_then(|state| state.get(event_type, state_key).cloned())
    }

    pub async fn get_all_state(&self, room_id: &RoomId) -> Vec<RoomEvent> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(RoomState::events)
            .unwrap_or_default()
    }

    /// Drop a room's table after the local user left it.
    pub async fn on_leave(&self, room_id: &RoomId) -> bool {
        let removed = self.rooms.write().await.remove(room_id).is_some();
        if removed {
            debug!(%room_id, "🧹 Dropped room state after leave");
        }
        removed
    }

    pub async fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_ids(&self) -> Vec<OwnedRoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::room_id;
    use serde_json::json;

    fn topic(event_id: &str, topic: &str) -> RoomEvent {
        RoomEvent::from_value(json!({
            "type": "m.room.topic",
            "state_key": "",
            "event_id": event_id,
            "sender": "@alice:example.org",
            "content": { "topic": topic }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let cache = RoomStateCache::new();
        let room = room_id!("!a:example.org");
        let events = vec![topic("$1", "one"), topic("$2", "two")];

        assert_eq!(cache.apply_state_events(room, &events).await, 2);
        assert_eq!(cache.apply_state_events(room, &events).await, 0);

        let current = cache.get_state(room, "m.room.topic", "").await.unwrap();
        assert_eq!(current.content["topic"], "two");
        assert_eq!(cache.get_all_state(room).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_drops_room() {
        let cache = RoomStateCache::new();
        let room = room_id!("!a:example.org");
        cache.apply_state_events(room, &[topic("$1", "one")]).await;
        assert!(cache.contains(room).await);

        assert!(cache.on_leave(room).await);
        assert!(!cache.contains(room).await);
        assert!(cache.get_state(room, "m.room.topic", "").await.is_none());
        assert!(!cache.on_leave(room).await);
    }

    #[tokio::test]
    async fn test_readers_run_alongside_writer() {
        let cache = RoomStateCache::new();
        let room = room_id!("!a:example.org");

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    cache
                        .apply_state_events(room_id!("!a:example.org"), &[topic(&format!("${i}"), "t")])
                        .await;
                }
            })
        };
        for _ in 0..50 {
            let _ = cache.get_all_state(room).await;
        }
        writer.await.unwrap();
        assert_eq!(cache.get_all_state(room).await.len(), 1);
    }
}
