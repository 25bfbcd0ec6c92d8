// =============================================================================
// Matrixon Sync - Cursor Sync Loop
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Classic `GET /sync` long poll. Each batch is classified in a fixed
//   order: crypto hand-off, account data, left rooms, invites, joined rooms.
//   The cursor is persisted either before or after classification depending
//   on the configured delivery mode.
//
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use matrixon_sync_core::{
    CryptoSyncData, PresenceState, Result, StorageProvider, SyncRequest, SyncResponse,
    SyncTransport,
};
use ruma::OwnedUserId;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{classifier::EventClassifier, filter::FilterManager, SyncStrategy};

/// Server-side long-poll timeout
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// Tunables of the cursor loop
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSyncOptions {
    /// Filter to register and sync with
    pub filter: Option<Value>,
    /// Presence hint sent with every poll
    pub presence: Option<PresenceState>,
    /// Server-side long-poll timeout
    pub timeout_ms: u64,
    /// Persist the cursor only after the batch is classified (at-least-once).
    /// By default it is persisted first (at-most-once).
    pub persist_token_after_sync: bool,
}

impl Default for CursorSyncOptions {
    fn default() -> Self {
        Self {
            filter: None,
            presence: None,
            timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            persist_token_after_sync: false,
        }
    }
}

/// Cursor-based sync strategy
pub struct CursorSyncLoop {
    user_id: OwnedUserId,
    transport: Arc<dyn SyncTransport>,
    storage: Arc<dyn StorageProvider>,
    classifier: EventClassifier,
    options: CursorSyncOptions,
    /// Last cursor the loop advanced to
    cursor: Option<String>,
    filter_id: Option<String>,
}

impl CursorSyncLoop {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        storage: Arc<dyn StorageProvider>,
        classifier: EventClassifier,
        options: CursorSyncOptions,
    ) -> Self {
        Self {
            user_id: classifier.user_id().to_owned(),
            transport,
            storage,
            classifier,
            options,
            cursor: None,
            filter_id: None,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn filter_id(&self) -> Option<&str> {
        self.filter_id.as_deref()
    }

    pub fn classifier(&self) -> &EventClassifier {
        &self.classifier
    }

    async fn advance_cursor(&mut self, next_batch: &str) -> Result<()> {
        self.storage.set_cursor(Some(next_batch.to_owned())).await?;
        self.cursor = Some(next_batch.to_owned());
        Ok(())
    }

    /// Classify one batch in order.
    #[instrument(skip_all, fields(next_batch = %response.next_batch))]
    pub async fn classify(&self, response: SyncResponse) -> Result<()> {
        if let Some(crypto) = self.classifier.crypto() {
            let unused_fallback_key_types = response.unused_fallback_key_types();
            crypto
                .update_sync_data(CryptoSyncData {
                    to_device_events: response.to_device.events,
                    one_time_key_counts: response.device_one_time_keys_count,
                    unused_fallback_key_types,
                    changed_users: response.device_lists.changed,
                    left_users: response.device_lists.left,
                })
                .await?;
        }

        let rooms = response.rooms;

        // Account data goes out before any room is classified.
        for event in response.account_data.events {
            self.classifier.emit_account_data(event).await;
        }
        for (room_id, room) in &rooms.leave {
            for event in &room.account_data.events {
                self.classifier
                    .emit_room_account_data(room_id, event.clone())
                    .await;
            }
        }
        for (room_id, room) in &rooms.join {
            for event in &room.account_data.events {
                self.classifier
                    .emit_room_account_data(room_id, event.clone())
                    .await;
            }
        }

        for (room_id, room) in &rooms.leave {
            self.classifier.handle_leave(room_id, &room.timeline.events).await;
        }

        for (room_id, room) in &rooms.invite {
            self.classifier
                .handle_invite(room_id, &room.invite_state.events)
                .await;
        }

        for (room_id, room) in rooms.join {
            self.classifier.handle_join(&room_id).await;
            self.classifier
                .state_cache()
                .apply_state_events(&room_id, &room.state.events)
                .await;
            self.classifier
                .handle_timeline(&room_id, room.timeline.events)
                .await;
        }

        Ok(())
    }
}

#[async_trait]
impl SyncStrategy for CursorSyncLoop {
    type Batch = SyncResponse;

    fn name(&self) -> &'static str {
        "cursor"
    }

    async fn prepare(&mut self) -> Result<()> {
        let filters = FilterManager::new(Arc::clone(&self.transport), Arc::clone(&self.storage));
        self.filter_id = filters
            .resolve(&self.user_id, self.options.filter.as_ref())
            .await?;
        self.cursor = self.storage.get_cursor().await?;
        info!(
            user_id = %self.user_id,
            resumed = self.cursor.is_some(),
            filter_id = ?self.filter_id,
            "Cursor sync prepared"
        );
        Ok(())
    }

    async fn poll(&mut self) -> Result<SyncResponse> {
        let request = SyncRequest::new(
            self.cursor.clone(),
            self.filter_id.clone(),
            self.options.timeout_ms,
        )
        .with_presence(self.options.presence);
        debug!(since = ?request.since, "🔄 Polling /sync");
        self.transport.sync(&request).await
    }

    async fn process(&mut self, response: SyncResponse) -> Result<()> {
        if response.next_batch.is_empty() {
            warn!("Sync response without next_batch, cursor left unchanged");
            return self.classify(response).await;
        }
        let next_batch = response.next_batch.clone();

        if self.options.persist_token_after_sync {
            self.classify(response).await?;
            self.advance_cursor(&next_batch).await?;
        } else {
            self.advance_cursor(&next_batch).await?;
            self.classify(response).await?;
        }
        debug!(%next_batch, "✅ Batch processed");
        Ok(())
    }
}
