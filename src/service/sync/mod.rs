// =============================================================================
// Matrixon Sync - Sync Service
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-side sync service. A client is built around exactly one strategy,
//   the classic cursor loop or the windowed engine, and drives it from a
//   single background task under the retry scheduler.
//
// =============================================================================

pub mod classifier;
pub mod cursor_sync;
pub mod filter;
pub mod list;
pub mod retry;
pub mod sliding_sync;
pub mod v3_room;

use std::sync::Arc;

use async_trait::async_trait;
use matrixon_sync_core::{Error, Result, RoomEvent};
use ruma::RoomId;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::service::{rooms::state_cache::RoomStateCache, signals::SignalBus};

pub use classifier::EventClassifier;
pub use cursor_sync::{CursorSyncLoop, CursorSyncOptions};
pub use filter::FilterManager;
pub use list::{ListBehaviour, SyncCollectionList, DEFAULT_PAGE_SIZE};
pub use retry::{Backoff, RetryScheduler, RunSummary, StopSignal};
pub use sliding_sync::{WindowedSyncEngine, WindowedSyncOptions};
pub use v3_room::V3Room;

/// One way of talking to the homeserver
///
/// `poll` fetches a batch, `process` classifies it and advances the cursor.
/// The cursor must only move once `process` succeeds.
#[async_trait]
pub trait SyncStrategy: Send {
    type Batch: Send;

    fn name(&self) -> &'static str;

    /// One-time setup before the first poll (cursor load, filter checks)
    async fn prepare(&mut self) -> Result<()>;

    async fn poll(&mut self) -> Result<Self::Batch>;

    async fn process(&mut self, batch: Self::Batch) -> Result<()>;
}

/// A sync client bound to one strategy
pub struct SyncClient<S: SyncStrategy + 'static> {
    strategy: Arc<Mutex<S>>,
    classifier: EventClassifier,
    backoff: Backoff,
    stop: Arc<StopSignal>,
    task: Option<JoinHandle<RunSummary>>,
}

impl<S: SyncStrategy + 'static> SyncClient<S> {
    pub fn new(strategy: S, classifier: EventClassifier, backoff: Backoff) -> Self {
        Self {
            strategy: Arc::new(Mutex::new(strategy)),
            classifier,
            backoff,
            stop: Arc::new(StopSignal::new()),
            task: None,
        }
    }

    /// Prepare the strategy and spawn the sync task.
    ///
    /// Setup failures (e.g. filter registration) are returned to the caller;
    /// once running, failures are retried forever.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_syncing() {
            return Err(Error::InvalidState("sync is already running".to_string()));
        }
        self.stop.reset();
        self.strategy.lock().await.prepare().await?;

        let strategy = Arc::clone(&self.strategy);
        let scheduler = RetryScheduler::new(self.backoff, Arc::clone(&self.stop));
        self.task = Some(tokio::spawn(async move {
            let mut strategy = strategy.lock().await;
            scheduler.run(&mut *strategy).await
        }));
        info!("🚀 Sync started");
        Ok(())
    }

    /// Request a stop. An in-flight poll is not aborted; its batch is dropped.
    pub fn stop(&self) {
        debug!("Stop requested");
        self.stop.request();
    }

    /// Stop and wait for the sync task to finish.
    pub async fn stop_and_wait(&mut self) -> Option<RunSummary> {
        self.stop();
        let task = self.task.take()?;
        match task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Sync task ended abnormally");
                None
            }
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn signals(&self) -> &SignalBus {
        self.classifier.signals()
    }

    pub fn state_cache(&self) -> &RoomStateCache {
        self.classifier.state_cache()
    }

    pub async fn room_state(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Option<RoomEvent> {
        self.state_cache().get_state(room_id, event_type, state_key).await
    }

    pub async fn all_room_state(&self, room_id: &RoomId) -> Vec<RoomEvent> {
        self.state_cache().get_all_state(room_id).await
    }

    /// Decrypt an event outside the sync loop, e.g. one fetched by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CryptoNotReady`] if the client has no crypto engine.
    pub async fn decrypt_event(&self, room_id: &RoomId, event: &RoomEvent) -> Result<RoomEvent> {
        self.classifier.require_crypto()?.decrypt(event, room_id).await
    }
}

impl<S: SyncStrategy + 'static> Drop for SyncClient<S> {
    fn drop(&mut self) {
        self.stop.request();
    }
}
