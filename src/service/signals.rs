// =============================================================================
// Matrixon Sync - Signal Bus
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Typed lifecycle signals produced by the sync engine and the per-client
//   bus that delivers them. Handlers registered for a kind run in emission
//   order; stream subscribers receive every signal in the same order.
//
// =============================================================================

use std::{collections::HashMap, fmt, sync::Arc};

use matrixon_sync_core::RoomEvent;
use ruma::OwnedRoomId;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

/// Names of the signals, as exposed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    AccountData,
    RoomAccountData,
    RoomLeave,
    RoomInvite,
    RoomJoin,
    RoomMessage,
    RoomArchived,
    RoomUpgraded,
    RoomEncryptedEvent,
    RoomDecryptedEvent,
    RoomFailedDecryption,
    RoomEvent,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::AccountData => "account_data",
            SignalKind::RoomAccountData => "room.account_data",
            SignalKind::RoomLeave => "room.leave",
            SignalKind::RoomInvite => "room.invite",
            SignalKind::RoomJoin => "room.join",
            SignalKind::RoomMessage => "room.message",
            SignalKind::RoomArchived => "room.archived",
            SignalKind::RoomUpgraded => "room.upgraded",
            SignalKind::RoomEncryptedEvent => "room.encrypted_event",
            SignalKind::RoomDecryptedEvent => "room.decrypted_event",
            SignalKind::RoomFailedDecryption => "room.failed_decryption",
            SignalKind::RoomEvent => "room.event",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle signal
#[derive(Debug, Clone, PartialEq)]
pub enum SyncSignal {
    AccountData {
        event: Value,
    },
    RoomAccountData {
        room_id: OwnedRoomId,
        event: Value,
    },
    RoomLeave {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomInvite {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomJoin {
        room_id: OwnedRoomId,
    },
    RoomMessage {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomArchived {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomUpgraded {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomEncryptedEvent {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomDecryptedEvent {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
    RoomFailedDecryption {
        room_id: OwnedRoomId,
        event: RoomEvent,
        error: String,
    },
    RoomEvent {
        room_id: OwnedRoomId,
        event: RoomEvent,
    },
}

impl SyncSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            SyncSignal::AccountData { .. } => SignalKind::AccountData,
            SyncSignal::RoomAccountData { .. } => SignalKind::RoomAccountData,
            SyncSignal::RoomLeave { .. } => SignalKind::RoomLeave,
            SyncSignal::RoomInvite { .. } => SignalKind::RoomInvite,
            SyncSignal::RoomJoin { .. } => SignalKind::RoomJoin,
            SyncSignal::RoomMessage { .. } => SignalKind::RoomMessage,
            SyncSignal::RoomArchived { .. } => SignalKind::RoomArchived,
            SyncSignal::RoomUpgraded { .. } => SignalKind::RoomUpgraded,
            SyncSignal::RoomEncryptedEvent { .. } => SignalKind::RoomEncryptedEvent,
            SyncSignal::RoomDecryptedEvent { .. } => SignalKind::RoomDecryptedEvent,
            SyncSignal::RoomFailedDecryption { .. } => SignalKind::RoomFailedDecryption,
            SyncSignal::RoomEvent { .. } => SignalKind::RoomEvent,
        }
    }

    /// Room the signal belongs to, if any
    pub fn room_id(&self) -> Option<&OwnedRoomId> {
        match self {
            SyncSignal::AccountData { .. } => None,
            SyncSignal::RoomAccountData { room_id, .. }
            | SyncSignal::RoomLeave { room_id, .. }
            | SyncSignal::RoomInvite { room_id, .. }
            | SyncSignal::RoomJoin { room_id }
            | SyncSignal::RoomMessage { room_id, .. }
            | SyncSignal::RoomArchived { room_id, .. }
            | SyncSignal::RoomUpgraded { room_id, .. }
            | SyncSignal::RoomEncryptedEvent { room_id, .. }
            | SyncSignal::RoomDecryptedEvent { room_id, .. }
            | SyncSignal::RoomFailedDecryption { room_id, .. }
            | SyncSignal::RoomEvent { room_id, .. } => Some(room_id),
        }
    }
}

/// Signal handler callback
pub type SignalHandler = Arc<dyn Fn(&SyncSignal) + Send + Sync>;

/// Per-client signal registry and stream fan-out
#[derive(Clone, Default)]
pub struct SignalBus {
    handlers: Arc<RwLock<HashMap<SignalKind, Vec<SignalHandler>>>>,
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<SyncSignal>>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one signal kind.
    pub async fn on<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(&SyncSignal) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Receive every signal, in emission order.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Deliver a signal. Handlers complete before this returns.
    pub async fn emit(&self, signal: SyncSignal) {
        trace!(signal = %signal.kind(), room_id = ?signal.room_id(), "emitting signal");

        let handlers = self.handlers.read().await.get(&signal.kind()).cloned();
        if let Some(handlers) = handlers {
            for handler in handlers {
                handler(&signal);
            }
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus").finish_non_exhaustive()
    }
}
