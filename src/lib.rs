// =============================================================================
// Matrixon Sync - Library Root
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-side Matrix sync engine. Turns classic `/sync` batches or windowed
//   list operations into one ordered stream of room lifecycle signals and
//   keeps retrying through network failures until stopped.
//
// =============================================================================

use std::{path::Path, sync::Arc};

pub mod config;
pub mod service;

pub use matrixon_sync_core as core;
pub use ruma;

pub use config::{SyncConfig, SyncMode};
pub use matrixon_sync_core::{
    CryptoEngine, Error, EventKind, EventPreprocessor, Membership, Result, RoomEvent,
    StorageProvider, SyncTransport,
};
pub use service::{
    rooms::state_cache::RoomStateCache,
    signals::{SignalBus, SignalKind, SyncSignal},
    storage::{FileStorageProvider, MemoryStorageProvider},
    sync::{
        Backoff, CursorSyncLoop, EventClassifier, RunSummary, SyncClient, SyncStrategy,
        WindowedSyncEngine,
    },
    transport::HttpTransport,
};

use ruma::{OwnedUserId, RoomId};
use tracing::info;

/// A sync client built from configuration, bound to whichever strategy the
/// configured mode selects
pub enum ConfiguredClient {
    Cursor(SyncClient<CursorSyncLoop>),
    Windowed(SyncClient<WindowedSyncEngine>),
}

impl ConfiguredClient {
    /// Wire transport, storage and strategy together from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable user id or homeserver URL,
    /// and storage errors if the state file cannot be opened.
    pub async fn from_config(
        config: &SyncConfig,
        crypto: Option<Arc<dyn CryptoEngine>>,
    ) -> Result<Self> {
        config.validate()?;
        let user_id = OwnedUserId::try_from(config.user_id.as_str())
            .map_err(|e| Error::Config(format!("invalid user_id {}: {e}", config.user_id)))?;
        let transport: Arc<dyn SyncTransport> =
            Arc::new(HttpTransport::new(&config.homeserver_url, config.access_token.clone())?);
        let storage: Arc<dyn StorageProvider> = match &config.storage_path {
            Some(path) => Arc::new(FileStorageProvider::open(Path::new(path)).await?),
            None => Arc::new(MemoryStorageProvider::new()),
        };

        let mut classifier = EventClassifier::new(user_id);
        if let Some(crypto) = crypto {
            classifier = classifier.with_crypto(crypto);
        }

        info!(mode = ?config.mode, homeserver = %config.homeserver_url, "🔧 Building sync client");
        Ok(match config.mode {
            SyncMode::Cursor => ConfiguredClient::Cursor(SyncClient::new(
                CursorSyncLoop::new(transport, storage, classifier.clone(), config.cursor_options()),
                classifier,
                config.backoff(),
            )),
            SyncMode::Windowed => ConfiguredClient::Windowed(SyncClient::new(
                WindowedSyncEngine::new(
                    transport,
                    storage,
                    classifier.clone(),
                    config.windowed_options(),
                ),
                classifier,
                config.backoff(),
            )),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        match self {
            ConfiguredClient::Cursor(client) => client.start().await,
            ConfiguredClient::Windowed(client) => client.start().await,
        }
    }

    pub fn stop(&self) {
        match self {
            ConfiguredClient::Cursor(client) => client.stop(),
            ConfiguredClient::Windowed(client) => client.stop(),
        }
    }

    pub async fn stop_and_wait(&mut self) -> Option<RunSummary> {
        match self {
            ConfiguredClient::Cursor(client) => client.stop_and_wait().await,
            ConfiguredClient::Windowed(client) => client.stop_and_wait().await,
        }
    }

    pub fn is_syncing(&self) -> bool {
        match self {
            ConfiguredClient::Cursor(client) => client.is_syncing(),
            ConfiguredClient::Windowed(client) => client.is_syncing(),
        }
    }

    pub fn signals(&self) -> &SignalBus {
        match self {
            ConfiguredClient::Cursor(client) => client.signals(),
            ConfiguredClient::Windowed(client) => client.signals(),
        }
    }

    pub fn state_cache(&self) -> &RoomStateCache {
        match self {
            ConfiguredClient::Cursor(client) => client.state_cache(),
            ConfiguredClient::Windowed(client) => client.state_cache(),
        }
    }

    pub async fn all_room_state(&self, room_id: &RoomId) -> Vec<RoomEvent> {
        self.state_cache().get_all_state(room_id).await
    }
}
