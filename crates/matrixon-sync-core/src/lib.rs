//! Matrixon Sync Core Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-03-21
//!
//! Shared model for the Matrixon client-side sync engine: the error type, the
//! event model decoded once at the protocol boundary, the wire types of both
//! sync protocols and the traits the engine uses to reach its collaborators.
//!
//! # Examples
//! ```rust
//! use matrixon_sync_core::{EventKind, RoomEvent, Result};
//!
//! fn example() -> Result<()> {
//!     let event = RoomEvent::from_value(serde_json::json!({
//!         "type": "m.room.message",
//!         "sender": "@alice:example.org",
//!         "content": { "body": "hello" }
//!     }))?;
//!     assert_eq!(event.kind, EventKind::Message);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use traits::{
    CryptoEngine, CryptoSyncData, EventPreprocessor, StorageProvider, StoredFilter, SyncTransport,
};
pub use types::{event_type, EventKind, Membership, RoomEvent, Unsigned};
pub use wire::{
    EventBatch, InvitedRoom, JoinedRoom, LeftRoom, ListFilters, ListOperation, ListRequest,
    PresenceState, RoomPayload, Rooms, SlidingSyncRequest, SlidingSyncResponse, SyncRequest,
    SyncResponse, Timeline,
};
