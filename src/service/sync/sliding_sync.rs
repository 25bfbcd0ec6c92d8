// =============================================================================
// Matrixon Sync - Sliding Sync Engine
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Windowed (MSC3575) sync. Keeps one paged mirror per configured list,
//   applies the server's list operations strictly in order, and feeds every
//   room payload through the shared classifier. Position and lossy list pages
//   are persisted once per processed batch and resumed on start.
//
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use matrixon_sync_core::{
    Membership, Result, SlidingSyncRequest, SlidingSyncResponse, StorageProvider, SyncTransport,
};
use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{
    classifier::EventClassifier,
    list::{ListBehaviour, LossyList, SyncCollectionList, DEFAULT_PAGE_SIZE},
    SyncStrategy,
};

/// Storage key of the persisted windowed state
pub const WINDOWED_STATE_KEY: &str = "sync_v3";

/// Timeline events requested per room
pub const DEFAULT_TIMELINE_LIMIT: u32 = 20;

/// Tunables of the windowed engine
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedSyncOptions {
    /// Width of every list page
    pub page_size: u64,
    /// Timeline events requested per room
    pub timeline_limit: u32,
    /// Lists to keep, in request order
    pub lists: Vec<ListBehaviour>,
}

impl Default for WindowedSyncOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            timeline_limit: DEFAULT_TIMELINE_LIMIT,
            lists: ListBehaviour::DEFAULT.to_vec(),
        }
    }
}

/// Persisted form: position plus lossy lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedWindowState {
    pos: Option<String>,
    #[serde(default)]
    lists: Vec<LossyList>,
}

/// Windowed sync strategy
pub struct WindowedSyncEngine {
    user_id: OwnedUserId,
    transport: Arc<dyn SyncTransport>,
    storage: Arc<dyn StorageProvider>,
    classifier: EventClassifier,
    options: WindowedSyncOptions,
    lists: Vec<SyncCollectionList>,
    /// Server position of the last processed batch
    pos: Option<String>,
}

impl WindowedSyncEngine {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        storage: Arc<dyn StorageProvider>,
        classifier: EventClassifier,
        options: WindowedSyncOptions,
    ) -> Self {
        let lists = Self::fresh_lists(&options);
        Self {
            user_id: classifier.user_id().to_owned(),
            transport,
            storage,
            classifier,
            options,
            lists,
            pos: None,
        }
    }

    fn fresh_lists(options: &WindowedSyncOptions) -> Vec<SyncCollectionList> {
        options
            .lists
            .iter()
            .map(|behaviour| SyncCollectionList::new(*behaviour, options.page_size))
            .collect()
    }

    pub fn pos(&self) -> Option<&str> {
        self.pos.as_deref()
    }

    pub fn lists(&self) -> &[SyncCollectionList] {
        &self.lists
    }

    pub fn list(&self, behaviour: ListBehaviour) -> Option<&SyncCollectionList> {
        self.lists.iter().find(|list| list.behaviour() == behaviour)
    }

    pub fn classifier(&self) -> &EventClassifier {
        &self.classifier
    }

    pub fn request(&self) -> SlidingSyncRequest {
        SlidingSyncRequest {
            lists: self
                .lists
                .iter()
                .map(|list| list.request(&self.user_id, self.options.timeline_limit))
                .collect(),
        }
    }

    /// Tell the classifier which restored rooms are already joined or
    /// invited, so a resumed session neither repeats joins nor misses leaves.
    /// Rooms without a known own membership take it from their list.
    async fn restore_memberships(&self) {
        let mut restored = 0usize;
        for list in &self.lists {
            let implied = match list.behaviour() {
                ListBehaviour::JoinedOnly => Some(Membership::Join),
                ListBehaviour::InvitedOnly => Some(Membership::Invite),
                ListBehaviour::DirectMessagesOnly => None,
            };
            for room in list.rooms() {
                let Some(membership) = room.own_membership().or(implied.as_ref()) else {
                    continue;
                };
                self.classifier
                    .restore_membership(room.room_id(), membership)
                    .await;
                restored += 1;
            }
        }
        if restored > 0 {
            debug!(rooms = restored, "Restored room memberships");
        }
    }

    async fn persist(&self, pos: &str) -> Result<()> {
        let state = PersistedWindowState {
            pos: Some(pos.to_owned()),
            lists: self.lists.iter().map(SyncCollectionList::lossy_serialized).collect(),
        };
        self.storage
            .store_value(WINDOWED_STATE_KEY, serde_json::to_string(&state)?)
            .await
    }

    /// Apply one response's counts and operations in order.
    #[instrument(skip_all, fields(pos = %response.pos, ops = response.ops.len()))]
    pub async fn apply_response(&mut self, response: &SlidingSyncResponse) {
        for (list, count) in self.lists.iter_mut().zip(response.counts.iter()) {
            list.set_total_count(*count);
        }

        for op in response.ops.iter().cloned() {
            let index = op.list();
            let Some(list) = self.lists.get_mut(index) else {
                warn!(list = index, "Operation for an unknown list skipped");
                continue;
            };
            let behaviour = list.behaviour();
            match list.apply(&self.user_id, op) {
                Ok(touched) => {
                    for room in touched {
                        self.classifier
                            .handle_windowed_room(&room.room_id, behaviour, &room.payload)
                            .await;
                    }
                }
                Err(e) => {
                    warn!(list = behaviour.name(), kind = e.kind(), error = %e, "List operation rejected, range will be re-synced");
                }
            }
        }
    }
}

#[async_trait]
impl SyncStrategy for WindowedSyncEngine {
    type Batch = SlidingSyncResponse;

    fn name(&self) -> &'static str {
        "windowed"
    }

    async fn prepare(&mut self) -> Result<()> {
        self.lists = Self::fresh_lists(&self.options);
        self.pos = None;

        if let Some(text) = self.storage.read_value(WINDOWED_STATE_KEY).await? {
            match serde_json::from_str::<PersistedWindowState>(&text) {
                Ok(state) => {
                    self.pos = state.pos;
                    for lossy in state.lists {
                        let page_size = self.options.page_size;
                        if let Some(slot) = self
                            .lists
                            .iter_mut()
                            .find(|list| list.behaviour() == lossy.behaviour)
                        {
                            *slot = SyncCollectionList::from_lossy(lossy, page_size);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Discarding unreadable windowed sync state"),
            }
        }
        self.restore_memberships().await;

        info!(
            user_id = %self.user_id,
            resumed = self.pos.is_some(),
            lists = self.lists.len(),
            "Windowed sync prepared"
        );
        Ok(())
    }

    async fn poll(&mut self) -> Result<SlidingSyncResponse> {
        let request = self.request();
        debug!(pos = ?self.pos, "🔄 Polling windowed sync");
        self.transport.sliding_sync(self.pos.clone(), &request).await
    }

    async fn process(&mut self, response: SlidingSyncResponse) -> Result<()> {
        self.apply_response(&response).await;
        self.persist(&response.pos).await?;
        self.pos = Some(response.pos);
        debug!(pos = ?self.pos, "✅ Windowed batch processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        signals::{SignalKind, SyncSignal},
        storage::MemoryStorageProvider,
    };
    use matrixon_sync_core::{ListOperation, SyncRequest, SyncResponse};
    use mockall::mock;
    use ruma::{owned_user_id, room_id, UserId};
    use serde_json::{json, Value};

    mock! {
        Transport {}
        #[async_trait]
        impl SyncTransport for Transport {
            async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse>;
            async fn create_filter(&self, user_id: &UserId, filter: &Value) -> Result<String>;
            async fn sliding_sync(
                &self,
                pos: Option<String>,
                request: &SlidingSyncRequest,
            ) -> Result<SlidingSyncResponse>;
        }
    }

    fn engine(transport: MockTransport, storage: Arc<MemoryStorageProvider>) -> WindowedSyncEngine {
        WindowedSyncEngine::new(
            Arc::new(transport),
            storage,
            EventClassifier::new(owned_user_id!("@bot:example.org")),
            WindowedSyncOptions::default(),
        )
    }

    fn batch(value: Value) -> SlidingSyncResponse {
        serde_json::from_value(value).unwrap()
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SyncSignal>) -> Vec<SignalKind> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal.kind());
        }
        out
    }

    fn joined_room_batch(pos: &str) -> SlidingSyncResponse {
        batch(json!({
            "pos": pos,
            "counts": [1, 0, 0],
            "ops": [{
                "op": "SYNC", "list": 0, "range": [0, 1],
                "rooms": [{
                    "room_id": "!r:example.org",
                    "required_state": [
                        { "type": "m.room.name", "state_key": "", "sender": "@alice:example.org",
                          "content": { "name": "Lobby" } }
                    ],
                    "timeline": [
                        { "type": "m.room.member", "event_id": "$join", "sender": "@bot:example.org",
                          "state_key": "@bot:example.org", "content": { "membership": "join" } },
                        { "type": "m.room.message", "event_id": "$m", "sender": "@alice:example.org",
                          "content": { "msgtype": "m.text", "body": "hi" } }
                    ]
                }]
            }]
        }))
    }

    #[tokio::test]
    async fn test_sync_op_drives_classifier() {
        let mut engine = engine(MockTransport::new(), Arc::new(MemoryStorageProvider::new()));
        let mut rx = engine.classifier().signals().subscribe().await;

        engine.process(joined_room_batch("p1")).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                SignalKind::RoomJoin,
                SignalKind::RoomEvent,
                SignalKind::RoomMessage,
                SignalKind::RoomEvent,
            ]
        );
        let joined = engine.list(ListBehaviour::JoinedOnly).unwrap();
        assert_eq!(joined.total_count(), 1);
        assert_eq!(joined.room_at(0).unwrap().name(), Some("Lobby"));
        assert_eq!(engine.pos(), Some("p1"));

        // The same page re-sent after a reconnect does not replay signals.
        engine.process(joined_room_batch("p2")).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_state_is_persisted_and_resumed() {
        let storage = Arc::new(MemoryStorageProvider::new());
        let mut first = engine(MockTransport::new(), storage.clone());
        first.process(joined_room_batch("p7")).await.unwrap();

        let mut transport = MockTransport::new();
        transport
            .expect_sliding_sync()
            .withf(|pos, request| pos.as_deref() == Some("p7") && request.lists.len() == 3)
            .times(1)
            .returning(|_, _| Ok(SlidingSyncResponse { pos: "p8".to_string(), ..Default::default() }));

        let mut resumed = engine(transport, storage);
        resumed.prepare().await.unwrap();
        assert_eq!(resumed.pos(), Some("p7"));
        let joined = resumed.list(ListBehaviour::JoinedOnly).unwrap();
        assert_eq!(joined.room_id_at(0).map(|id| id.as_str()), Some("!r:example.org"));
        assert_eq!(joined.room_at(0).unwrap().name(), Some("Lobby"));

        let next = resumed.poll().await.unwrap();
        assert_eq!(next.pos, "p8");
    }

    #[tokio::test]
    async fn test_inconsistent_op_does_not_fail_batch() {
        let storage = Arc::new(MemoryStorageProvider::new());
        let mut engine = engine(MockTransport::new(), storage.clone());
        engine.process(joined_room_batch("p1")).await.unwrap();

        engine
            .process(batch(json!({
                "pos": "p2",
                "ops": [ { "op": "UPDATE", "list": 0, "index": 500, "room": {} } ]
            })))
            .await
            .unwrap();

        assert_eq!(engine.pos(), Some("p2"));
        let joined = engine.list(ListBehaviour::JoinedOnly).unwrap();
        assert!(joined.page_ranges().is_empty());
        // Counts are only replaced when supplied.
        assert_eq!(joined.total_count(), 1);
    }

    #[tokio::test]
    async fn test_invite_list_signals_invite_once() {
        let mut engine = engine(MockTransport::new(), Arc::new(MemoryStorageProvider::new()));
        let mut rx = engine.classifier().signals().subscribe().await;

        let op = ListOperation::Sync {
            list: 1,
            range: [0, 1],
            rooms: vec![Some(serde_json::from_value(json!({
                "room_id": "!inv:example.org",
                "invite_state": [
                    { "type": "m.room.member", "sender": "@alice:example.org",
                      "state_key": "@bot:example.org", "content": { "membership": "invite" } }
                ]
            }))
            .unwrap())],
        };
        for pos in ["p1", "p2"] {
            engine
                .process(SlidingSyncResponse {
                    pos: pos.to_string(),
                    counts: vec![0, 1, 0],
                    ops: vec![op.clone()],
                })
                .await
                .unwrap();
        }

        assert_eq!(drain(&mut rx), vec![SignalKind::RoomInvite]);
        assert!(engine
            .classifier()
            .state_cache()
            .contains(room_id!("!inv:example.org"))
            .await);
    }

    #[tokio::test]
    async fn test_leave_in_timeline_is_detected() {
        let mut engine = engine(MockTransport::new(), Arc::new(MemoryStorageProvider::new()));
        engine.process(joined_room_batch("p1")).await.unwrap();
        let mut rx = engine.classifier().signals().subscribe().await;

        engine
            .process(batch(json!({
                "pos": "p2",
                "ops": [{
                    "op": "UPDATE", "list": 0, "index": 0,
                    "room": { "timeline": [
                        { "type": "m.room.member", "event_id": "$kick", "sender": "@mod:example.org",
                          "state_key": "@bot:example.org", "content": { "membership": "leave" } }
                    ] }
                }]
            })))
            .await
            .unwrap();

        assert_eq!(drain(&mut rx), vec![SignalKind::RoomLeave]);
        assert!(!engine.classifier().is_joined(room_id!("!r:example.org")).await);
    }

    #[tokio::test]
    async fn test_resumed_session_keeps_memberships() {
        let storage = Arc::new(MemoryStorageProvider::new());
        let mut first = engine(MockTransport::new(), storage.clone());
        first.process(joined_room_batch("p1")).await.unwrap();

        let mut resumed = engine(MockTransport::new(), storage);
        resumed.prepare().await.unwrap();
        assert!(resumed.classifier().is_joined(room_id!("!r:example.org")).await);
        let mut rx = resumed.classifier().signals().subscribe().await;

        // A new message in a restored room does not announce the join again.
        resumed
            .process(batch(json!({
                "pos": "p2",
                "ops": [{
                    "op": "UPDATE", "list": 0, "index": 0,
                    "room": { "timeline": [
                        { "type": "m.room.message", "event_id": "$m2", "sender": "@alice:example.org",
                          "content": { "msgtype": "m.text", "body": "again" } }
                    ] }
                }]
            })))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![SignalKind::RoomMessage, SignalKind::RoomEvent]);

        resumed
            .process(batch(json!({
                "pos": "p3",
                "ops": [{
                    "op": "UPDATE", "list": 0, "index": 0,
                    "room": { "timeline": [
                        { "type": "m.room.member", "event_id": "$kick", "sender": "@mod:example.org",
                          "state_key": "@bot:example.org", "content": { "membership": "leave" } }
                    ] }
                }]
            })))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![SignalKind::RoomLeave]);
    }

    #[tokio::test]
    async fn test_restored_invite_is_not_repeated() {
        let classifier = EventClassifier::new(owned_user_id!("@bot:example.org"));
        let room = room_id!("!inv:example.org");
        classifier.restore_membership(room, &Membership::Invite).await;
        let mut rx = classifier.signals().subscribe().await;

        let payload = serde_json::from_value(json!({
            "room_id": "!inv:example.org",
            "invite_state": [
                { "type": "m.room.member", "sender": "@alice:example.org",
                  "state_key": "@bot:example.org", "content": { "membership": "invite" } }
            ]
        }))
        .unwrap();
        classifier
            .handle_windowed_room(room, ListBehaviour::InvitedOnly, &payload)
            .await;
        assert!(drain(&mut rx).is_empty());
        assert!(!classifier.is_joined(room).await);
    }

    #[tokio::test]
    async fn test_unaddressable_insert_keeps_engine_running() {
        let storage = Arc::new(MemoryStorageProvider::new());
        let mut engine = engine(MockTransport::new(), storage.clone());
        engine.process(joined_room_batch("p1")).await.unwrap();

        engine
            .process(batch(json!({
                "pos": "p2",
                "ops": [{
                    "op": "INSERT", "list": 0, "index": u64::MAX,
                    "room": { "room_id": "!far:example.org" }
                }]
            })))
            .await
            .unwrap();

        assert_eq!(engine.pos(), Some("p2"));
        let joined = engine.list(ListBehaviour::JoinedOnly).unwrap();
        assert_eq!(joined.room_id_at(0).map(|id| id.as_str()), Some("!r:example.org"));
        assert!(storage.read_value(WINDOWED_STATE_KEY).await.unwrap().is_some());
    }
}
