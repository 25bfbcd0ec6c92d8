// =============================================================================
// Matrixon Sync - Configuration
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Sync client configuration, loaded from an optional TOML file layered
//   under `MATRIXON_SYNC_*` environment variables.
//
// =============================================================================

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use matrixon_sync_core::{Error, PresenceState, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::sync::{
    cursor_sync::DEFAULT_SYNC_TIMEOUT_MS,
    retry::{DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MIN},
    sliding_sync::DEFAULT_TIMELINE_LIMIT,
    Backoff, CursorSyncOptions, ListBehaviour, WindowedSyncOptions, DEFAULT_PAGE_SIZE,
};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MATRIXON_SYNC_";

/// Which sync protocol the client speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Cursor,
    Windowed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Base URL of the homeserver
    pub homeserver_url: String,
    /// Access token of the syncing account
    pub access_token: String,
    /// Fully qualified user id of the syncing account
    pub user_id: String,

    #[serde(default)]
    pub mode: SyncMode,
    /// JSON document holding cursor, filter and list state; in-memory if unset
    #[serde(default)]
    pub storage_path: Option<String>,

    #[serde(default)]
    pub presence: Option<PresenceState>,
    /// Sync filter, registered with the homeserver on start
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub persist_token_after_sync: bool,

    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_timeline_limit")]
    pub timeline_limit: u32,
    /// Windowed lists to keep; all of them if unset
    #[serde(default)]
    pub lists: Option<Vec<ListBehaviour>>,

    /// tracing `EnvFilter` directive
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SYNC_TIMEOUT_MS
}

fn default_backoff_min_ms() -> u64 {
    DEFAULT_BACKOFF_MIN.as_millis() as u64
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX.as_millis() as u64
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

fn default_timeline_limit() -> u32 {
    DEFAULT_TIMELINE_LIMIT
}

fn default_log() -> String {
    "info".to_string()
}

impl SyncConfig {
    /// Layer the TOML file (if any) under the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load and validate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing or malformed keys and for values
    /// rejected by [`SyncConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.homeserver_url.trim().is_empty() {
            return Err(Error::Config("homeserver_url must not be empty".to_string()));
        }
        if !self.user_id.starts_with('@') {
            return Err(Error::Config(format!(
                "user_id must be a full Matrix user id, got {}",
                self.user_id
            )));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be at least 1".to_string()));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(Error::Config(format!(
                "backoff_min_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        if matches!(&self.lists, Some(lists) if lists.is_empty()) {
            return Err(Error::Config("lists must name at least one list".to_string()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn cursor_options(&self) -> CursorSyncOptions {
        CursorSyncOptions {
            filter: self.filter.clone(),
            presence: self.presence,
            timeout_ms: self.timeout_ms,
            persist_token_after_sync: self.persist_token_after_sync,
        }
    }

    pub fn windowed_options(&self) -> WindowedSyncOptions {
        WindowedSyncOptions {
            page_size: self.page_size,
            timeline_limit: self.timeline_limit,
            lists: self
                .lists
                .clone()
                .unwrap_or_else(|| ListBehaviour::DEFAULT.to_vec()),
        }
    }
}
