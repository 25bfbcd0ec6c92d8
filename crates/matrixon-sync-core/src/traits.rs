//! Collaborator traits for the Matrixon sync engine
//!
//! The engine talks to the homeserver, to persistence and to the end-to-end
//! encryption subsystem only through these seams, so each can be swapped or
//! mocked independently.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    types::RoomEvent,
    wire::{SlidingSyncRequest, SlidingSyncResponse, SyncRequest, SyncResponse},
    Result,
};

/// Crypto-relevant slice of one classic sync batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptoSyncData {
    pub to_device_events: Vec<Value>,
    pub one_time_key_counts: BTreeMap<String, u64>,
    pub unused_fallback_key_types: Vec<String>,
    pub changed_users: Vec<OwnedUserId>,
    pub left_users: Vec<OwnedUserId>,
}

/// Opaque end-to-end encryption engine
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Whether the room has encryption enabled
    async fn is_room_encrypted(&self, room_id: &RoomId) -> bool;

    /// Decrypt an `m.room.encrypted` event
    async fn decrypt(&self, event: &RoomEvent, room_id: &RoomId) -> Result<RoomEvent>;

    /// Feed device messages, key counts and device list changes
    async fn update_sync_data(&self, data: CryptoSyncData) -> Result<()>;
}

/// A filter registered with the homeserver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFilter {
    pub id: String,
    pub filter: Value,
}

/// Key-value persistence for cursors, filters and list pages
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get_cursor(&self) -> Result<Option<String>>;

    async fn set_cursor(&self, cursor: Option<String>) -> Result<()>;

    async fn get_filter(&self) -> Result<Option<StoredFilter>>;

    /// Store the registered filter, or forget it with `None`
    async fn set_filter(&self, filter: Option<StoredFilter>) -> Result<()>;

    async fn read_value(&self, key: &str) -> Result<Option<String>>;

    async fn store_value(&self, key: &str, value: String) -> Result<()>;
}

/// HTTP transport with authentication already applied
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Classic long poll
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse>;

    /// Register a filter and return its id
    async fn create_filter(&self, user_id: &UserId, filter: &Value) -> Result<String>;

    /// Windowed poll at position `pos`
    async fn sliding_sync(
        &self,
        pos: Option<String>,
        request: &SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse>;
}

/// Rewrites events of selected types before they are classified
#[async_trait]
pub trait EventPreprocessor: Send + Sync {
    /// Event types this preprocessor wants to see
    fn supported_event_types(&self) -> Vec<String>;

    async fn process(&self, room_id: &RoomId, event: RoomEvent) -> Result<RoomEvent>;
}
