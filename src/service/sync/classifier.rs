// =============================================================================
// Matrixon Sync - Event Classifier
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Turns raw per-room event batches into lifecycle signals. Shared by the
//   cursor loop and the windowed engine so both produce the same stream:
//   - Own-membership selection (most recent wins, first wins on ties)
//   - Exactly-once join detection, re-armed by a leave
//   - Crypto hand-off for encrypted timeline events
//   - Message / archived / upgraded / generic event signals
//
// =============================================================================

use std::{collections::HashSet, num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use matrixon_sync_core::{
    CryptoEngine, Error, EventKind, EventPreprocessor, Membership, Result, RoomEvent,
    RoomPayload,
};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::service::{
    rooms::state_cache::RoomStateCache,
    signals::{SignalBus, SyncSignal},
    sync::list::ListBehaviour,
};

/// How many recent (room, event id) pairs are remembered for deduplication
const DEDUP_CAPACITY: usize = 4096;

/// Pick the authoritative own-membership event of a batch.
///
/// Only `m.room.member` events whose state key is `user_id` and whose
/// membership passes `accept` are candidates. The one with the smallest
/// `unsigned.age` wins; on equal age the first encountered is kept.
pub fn select_membership_event<'a, I, F>(
    events: I,
    user_id: &UserId,
    accept: F,
) -> Option<&'a RoomEvent>
where
    I: IntoIterator<Item = &'a RoomEvent>,
    F: Fn(&Membership) -> bool,
{
    let mut selected: Option<&'a RoomEvent> = None;
    for event in events {
        let Some(membership) = event.own_membership(user_id.as_str()) else {
            continue;
        };
        if !accept(membership) {
            continue;
        }
        match selected {
            Some(current) if event.age() >= current.age() => {}
            _ => selected = Some(event),
        }
    }
    selected
}

/// Shape-dependent signals for one timeline event, `room.event` last.
pub fn timeline_signals(room_id: &RoomId, event: &RoomEvent) -> Vec<SyncSignal> {
    let room_id = room_id.to_owned();
    let mut signals = Vec::with_capacity(2);
    match &event.kind {
        EventKind::Message => signals.push(SyncSignal::RoomMessage {
            room_id: room_id.clone(),
            event: event.clone(),
        }),
        EventKind::Tombstone { .. } if event.has_empty_state_key() => {
            signals.push(SyncSignal::RoomArchived {
                room_id: room_id.clone(),
                event: event.clone(),
            })
        }
        EventKind::Create {
            predecessor: Some(_),
        } if event.has_empty_state_key() => signals.push(SyncSignal::RoomUpgraded {
            room_id: room_id.clone(),
            event: event.clone(),
        }),
        _ => {}
    }
    signals.push(SyncSignal::RoomEvent {
        room_id,
        event: event.clone(),
    });
    signals
}

/// Classification state shared by both sync strategies
#[derive(Clone)]
pub struct EventClassifier {
    user_id: OwnedUserId,
    signals: SignalBus,
    state_cache: RoomStateCache,
    crypto: Option<Arc<dyn CryptoEngine>>,
    preprocessors: Vec<Arc<dyn EventPreprocessor>>,
    joined_rooms: Arc<RwLock<HashSet<OwnedRoomId>>>,
    invited_rooms: Arc<RwLock<HashSet<OwnedRoomId>>>,
    seen_events: Arc<Mutex<LruCache<(OwnedRoomId, String), ()>>>,
}

impl EventClassifier {
    pub fn new(user_id: OwnedUserId) -> Self {
        let capacity = NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            user_id,
            signals: SignalBus::new(),
            state_cache: RoomStateCache::new(),
            crypto: None,
            preprocessors: Vec::new(),
            joined_rooms: Arc::new(RwLock::new(HashSet::new())),
            invited_rooms: Arc::new(RwLock::new(HashSet::new())),
            seen_events: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoEngine>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn EventPreprocessor>) -> Self {
        self.preprocessors.push(preprocessor);
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn state_cache(&self) -> &RoomStateCache {
        &self.state_cache
    }

    pub fn crypto(&self) -> Option<&Arc<dyn CryptoEngine>> {
        self.crypto.as_ref()
    }

    /// The crypto engine, or [`Error::CryptoNotReady`] when none is configured.
    pub fn require_crypto(&self) -> Result<&Arc<dyn CryptoEngine>> {
        self.crypto.as_ref().ok_or(Error::CryptoNotReady)
    }

    pub async fn is_joined(&self, room_id: &RoomId) -> bool {
        self.joined_rooms.read().await.contains(room_id)
    }

    pub async fn joined_rooms(&self) -> Vec<OwnedRoomId> {
        self.joined_rooms.read().await.iter().cloned().collect()
    }

    /// Seed the known membership of a room restored from storage, without
    /// emitting anything. Departures are ignored.
    pub async fn restore_membership(&self, room_id: &RoomId, membership: &Membership) {
        match membership {
            Membership::Join => {
                self.invited_rooms.write().await.remove(room_id);
                self.joined_rooms.write().await.insert(room_id.to_owned());
            }
            Membership::Invite => {
                if !self.is_joined(room_id).await {
                    self.invited_rooms.write().await.insert(room_id.to_owned());
                }
            }
            _ => {}
        }
    }

    pub async fn emit_account_data(&self, event: Value) {
        self.signals.emit(SyncSignal::AccountData { event }).await;
    }

    pub async fn emit_room_account_data(&self, room_id: &RoomId, event: Value) {
        self.signals
            .emit(SyncSignal::RoomAccountData {
                room_id: room_id.to_owned(),
                event,
            })
            .await;
    }

    /// Run matching preprocessors over an event. A failing preprocessor is
    /// logged and the event passes through unchanged.
    pub async fn preprocess(&self, room_id: &RoomId, mut event: RoomEvent) -> RoomEvent {
        for preprocessor in &self.preprocessors {
            if !preprocessor
                .supported_event_types()
                .iter()
                .any(|t| *t == event.event_type)
            {
                continue;
            }
            match preprocessor.process(room_id, event.clone()).await {
                Ok(processed) => event = processed,
                Err(e) => warn!(%room_id, error = %e, "Event preprocessor failed"),
            }
        }
        event
    }

    /// Emit `room.join` unless the room is already known joined.
    pub async fn handle_join(&self, room_id: &RoomId) -> bool {
        let newly_joined = self.joined_rooms.write().await.insert(room_id.to_owned());
        if !newly_joined {
            return false;
        }
        self.invited_rooms.write().await.remove(room_id);
        debug!(%room_id, "🏠 Joined room");
        self.signals
            .emit(SyncSignal::RoomJoin {
                room_id: room_id.to_owned(),
            })
            .await;
        true
    }

    /// Leave detection over a left room's timeline. Returns whether a leave
    /// was emitted.
    pub async fn handle_leave(&self, room_id: &RoomId, timeline: &[RoomEvent]) -> bool {
        let Some(event) =
            select_membership_event(timeline, &self.user_id, Membership::is_departure).cloned()
        else {
            warn!(%room_id, "Left room without receiving a leave event");
            return false;
        };
        self.emit_leave(room_id, event).await;
        true
    }

    /// Invite detection over stripped invite state. Returns whether an invite
    /// was emitted.
    pub async fn handle_invite(&self, room_id: &RoomId, invite_state: &[RoomEvent]) -> bool {
        let Some(event) = select_membership_event(invite_state, &self.user_id, |m| {
            *m == Membership::Invite
        })
        .cloned() else {
            warn!(%room_id, "Invited to room without receiving an invite event");
            return false;
        };
        self.state_cache.apply_state_events(room_id, invite_state).await;
        self.emit_invite(room_id, event).await;
        true
    }

    async fn emit_leave(&self, room_id: &RoomId, event: RoomEvent) {
        let event = self.preprocess(room_id, event).await;
        self.signals
            .emit(SyncSignal::RoomLeave {
                room_id: room_id.to_owned(),
                event,
            })
            .await;
        self.joined_rooms.write().await.remove(room_id);
        self.invited_rooms.write().await.remove(room_id);
        self.state_cache.on_leave(room_id).await;
        debug!(%room_id, "👋 Left room");
    }

    async fn emit_invite(&self, room_id: &RoomId, event: RoomEvent) {
        let event = self.preprocess(room_id, event).await;
        self.invited_rooms.write().await.insert(room_id.to_owned());
        self.signals
            .emit(SyncSignal::RoomInvite {
                room_id: room_id.to_owned(),
                event,
            })
            .await;
    }

    /// Classify a joined room's timeline, in order.
    pub async fn handle_timeline(&self, room_id: &RoomId, events: Vec<RoomEvent>) {
        for event in events {
            if let Some(event_id) = &event.event_id {
                let key = (room_id.to_owned(), event_id.clone());
                if self.seen_events.lock().await.put(key, ()).is_some() {
                    debug!(%room_id, %event_id, "Skipping duplicate timeline event");
                    continue;
                }
            }

            if event.is_state() {
                self.state_cache
                    .apply_state_events(room_id, std::slice::from_ref(&event))
                    .await;
            }

            let event = self.hand_off_encrypted(room_id, event).await;
            let event = self.preprocess(room_id, event).await;
            for signal in timeline_signals(room_id, &event) {
                self.signals.emit(signal).await;
            }
        }
    }

    /// Pass an encrypted event through the crypto engine, emitting the
    /// encrypted/decrypted/failed signals. Returns the event to classify.
    async fn hand_off_encrypted(&self, room_id: &RoomId, event: RoomEvent) -> RoomEvent {
        if event.kind != EventKind::Encrypted {
            return event;
        }
        let Some(crypto) = &self.crypto else {
            return event;
        };
        if !crypto.is_room_encrypted(room_id).await {
            return event;
        }

        self.signals
            .emit(SyncSignal::RoomEncryptedEvent {
                room_id: room_id.to_owned(),
                event: event.clone(),
            })
            .await;

        match crypto.decrypt(&event, room_id).await {
            Ok(decrypted) => {
                self.signals
                    .emit(SyncSignal::RoomDecryptedEvent {
                        room_id: room_id.to_owned(),
                        event: decrypted.clone(),
                    })
                    .await;
                decrypted
            }
            Err(e) => {
                error!(%room_id, event_id = ?event.event_id, error = %e, "Decryption error");
                self.signals
                    .emit(SyncSignal::RoomFailedDecryption {
                        room_id: room_id.to_owned(),
                        event: event.clone(),
                        error: e.to_string(),
                    })
                    .await;
                event
            }
        }
    }

    /// Classify one room payload from the windowed protocol, where membership
    /// transitions arrive inside ordinary timeline deltas.
    pub async fn handle_windowed_room(
        &self,
        room_id: &RoomId,
        behaviour: ListBehaviour,
        payload: &RoomPayload,
    ) {
        self.state_cache
            .apply_state_events(room_id, &payload.required_state)
            .await;

        let candidates = payload
            .required_state
            .iter()
            .chain(payload.invite_state.iter())
            .chain(payload.timeline.iter());
        let own = select_membership_event(candidates, &self.user_id, |_| true).cloned();

        let membership = own.as_ref().and_then(RoomEvent::membership).cloned();
        match (membership, own) {
            (Some(m), Some(event)) if m.is_departure() => {
                let known = self.is_joined(room_id).await
                    || self.invited_rooms.read().await.contains(room_id);
                if known {
                    self.emit_leave(room_id, event).await;
                }
                return;
            }
            (Some(Membership::Invite), Some(event)) => {
                if !self.invited_rooms.read().await.contains(room_id)
                    && !self.is_joined(room_id).await
                {
                    self.state_cache
                        .apply_state_events(room_id, &payload.invite_state)
                        .await;
                    self.emit_invite(room_id, event).await;
                }
                return;
            }
            (Some(Membership::Join), _) => {
                self.handle_join(room_id).await;
            }
            _ if behaviour != ListBehaviour::InvitedOnly && !payload.timeline.is_empty() => {
                // A joined-room list entry with no own member event in this delta.
                self.handle_join(room_id).await;
            }
            _ => {}
        }

        if self.is_joined(room_id).await {
            self.handle_timeline(room_id, payload.timeline.clone()).await;
        }
    }
}

impl std::fmt::Debug for EventClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventClassifier")
            .field("user_id", &self.user_id)
            .field("crypto", &self.crypto.is_some())
            .field("preprocessors", &self.preprocessors.len())
            .finish_non_exhaustive()
    }
}
