// =============================================================================
// Matrixon Sync - Sync Filter Registration
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Keeps the filter registered with the homeserver in step with the
//   configured one and resets the cursor whenever the filter changes.
//
// =============================================================================

use std::sync::Arc;

use matrixon_sync_core::{Result, StorageProvider, StoredFilter, SyncTransport};
use ruma::UserId;
use serde_json::Value;
use tracing::{debug, info};

/// Keeps the registered sync filter in step with the configured one
pub struct FilterManager {
    transport: Arc<dyn SyncTransport>,
    storage: Arc<dyn StorageProvider>,
}

impl FilterManager {
    pub fn new(transport: Arc<dyn SyncTransport>, storage: Arc<dyn StorageProvider>) -> Self {
        Self { transport, storage }
    }

    /// Resolve the filter id to sync with.
    ///
    /// A stored filter structurally equal to `desired` is reused. Otherwise a
    /// new one is registered, the cursor is reset (the old cursor was issued
    /// under a different filter) and the pair is stored. Without a desired
    /// filter no filter id is used, and a previously stored filter is
    /// forgotten together with its cursor.
    pub async fn resolve(&self, user_id: &UserId, desired: Option<&Value>) -> Result<Option<String>> {
        let stored = self.storage.get_filter().await?;

        let Some(desired) = desired else {
            if let Some(stored) = stored {
                info!(filter_id = %stored.id, "🧹 Sync filter removed, resetting cursor");
                self.storage.set_cursor(None).await?;
                self.storage.set_filter(None).await?;
            }
            return Ok(None);
        };

        if let Some(stored) = stored {
            if stored.filter == *desired {
                debug!(filter_id = %stored.id, "Reusing stored sync filter");
                return Ok(Some(stored.id));
            }
        }

        let id = self.transport.create_filter(user_id, desired).await?;
        info!(filter_id = %id, "📝 Registered new sync filter");
        self.storage.set_cursor(None).await?;
        self.storage
            .set_filter(Some(StoredFilter {
                id: id.clone(),
                filter: desired.clone(),
            }))
            .await?;
        Ok(Some(id))
    }
}
