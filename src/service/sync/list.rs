// =============================================================================
// Matrixon Sync - Windowed Room Lists
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Paged client-side mirror of one server-ordered room list. Pages are
//   fixed-size windows keyed by their start index; a page may be sparse.
//   Server indices are trusted literally and never renumbered locally. Any
//   operation that contradicts the local pages drops the affected page so
//   that the next SYNC rebuilds it.
//
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use matrixon_sync_core::{
    event_type, Error, ListFilters, ListOperation, ListRequest, Result, RoomPayload,
};
use ruma::{OwnedRoomId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::v3_room::{LossyRoom, V3Room};

/// Width of every page
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

/// Most page windows one list asks for in a single request
pub const MAX_REQUESTED_PAGES: u64 = 64;

/// Server-side ordering requested for every list
const LIST_SORT: [&str; 2] = ["by_notification_level", "by_recency"];

/// Filter predicate a list is defined by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListBehaviour {
    JoinedOnly,
    InvitedOnly,
    DirectMessagesOnly,
}

impl ListBehaviour {
    /// Lists registered when none are configured, in request order
    pub const DEFAULT: [ListBehaviour; 3] = [
        ListBehaviour::JoinedOnly,
        ListBehaviour::InvitedOnly,
        ListBehaviour::DirectMessagesOnly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ListBehaviour::JoinedOnly => "joined",
            ListBehaviour::InvitedOnly => "invited",
            ListBehaviour::DirectMessagesOnly => "direct",
        }
    }

    pub fn filters(&self) -> ListFilters {
        match self {
            ListBehaviour::JoinedOnly => ListFilters {
                is_invite: Some(false),
                ..Default::default()
            },
            ListBehaviour::InvitedOnly => ListFilters {
                is_invite: Some(true),
                ..Default::default()
            },
            ListBehaviour::DirectMessagesOnly => ListFilters {
                is_dm: Some(true),
                ..Default::default()
            },
        }
    }
}

/// A room materialized or updated by an operation, with the payload that did it
#[derive(Debug, Clone, PartialEq)]
pub struct TouchedRoom {
    pub room_id: OwnedRoomId,
    pub payload: RoomPayload,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Page {
    /// `None` is an unknown-room placeholder
    slots: Vec<Option<OwnedRoomId>>,
}

/// Persisted page: room ids and required state, no timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossyPage {
    pub range: [u64; 2],
    pub rooms: Vec<Option<LossyRoom>>,
}

/// Persisted list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossyList {
    pub behaviour: ListBehaviour,
    pub total_count: u64,
    pub pages: Vec<LossyPage>,
}

/// Ordered, possibly partial mirror of a server-side room list
#[derive(Debug, Clone)]
pub struct SyncCollectionList {
    behaviour: ListBehaviour,
    page_size: u64,
    /// Server-supplied, never derived from local pages
    total_count: u64,
    pages: BTreeMap<u64, Page>,
    rooms: HashMap<OwnedRoomId, V3Room>,
}

impl SyncCollectionList {
    pub fn new(behaviour: ListBehaviour, page_size: u64) -> Self {
        Self {
            behaviour,
            page_size: page_size.max(1),
            total_count: 0,
            pages: BTreeMap::new(),
            rooms: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.behaviour.name()
    }

    pub fn behaviour(&self) -> ListBehaviour {
        self.behaviour
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn set_total_count(&mut self, count: u64) {
        self.total_count = count;
    }

    /// `index -> (page start, offset within page)`
    pub fn locate(&self, index: u64) -> (u64, usize) {
        let start = index - index % self.page_size;
        (start, (index - start) as usize)
    }

    /// Known page windows as `[start, end)` over the occupied width.
    pub fn page_ranges(&self) -> Vec<[u64; 2]> {
        self.pages
            .iter()
            .map(|(start, page)| [*start, start.saturating_add(page.slots.len() as u64)])
            .collect()
    }

    pub fn room_id_at(&self, index: u64) -> Option<&RoomId> {
        let (start, offset) = self.locate(index);
        self.pages
            .get(&start)
            .and_then(|page| page.slots.get(offset))
            .and_then(|slot| slot.as_deref())
    }

    pub fn room_at(&self, index: u64) -> Option<&V3Room> {
        self.room_id_at(index).and_then(|id| self.rooms.get(id))
    }

    pub fn room(&self, room_id: &RoomId) -> Option<&V3Room> {
        self.rooms.get(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &V3Room> {
        self.rooms.values()
    }

    pub fn position_of(&self, room_id: &RoomId) -> Option<u64> {
        self.pages.iter().find_map(|(start, page)| {
            page.slots
                .iter()
                .position(|slot| slot.as_deref() == Some(room_id))
                .map(|offset| start + offset as u64)
        })
    }

    /// Windows to ask the server for: every page needed to cover the total,
    /// up to [`MAX_REQUESTED_PAGES`].
    pub fn request_ranges(&self) -> Vec<[u64; 2]> {
        let pages = self.total_count.div_ceil(self.page_size).max(1);
        if pages > MAX_REQUESTED_PAGES {
            warn!(list = self.name(), pages, "Capping requested pages");
        }
        (0..pages.min(MAX_REQUESTED_PAGES))
            .map_while(|i| {
                let start = i.checked_mul(self.page_size)?;
                Some([start, start.checked_add(self.page_size)?])
            })
            .collect()
    }

    pub fn request(&self, user_id: &UserId, timeline_limit: u32) -> ListRequest {
        ListRequest {
            rooms: self.request_ranges(),
            sort: LIST_SORT.iter().map(|s| s.to_string()).collect(),
            required_state: vec![
                [event_type::ROOM_NAME.to_string(), String::new()],
                [event_type::ROOM_TOPIC.to_string(), String::new()],
                [event_type::ROOM_ENCRYPTION.to_string(), String::new()],
                [event_type::ROOM_MEMBER.to_string(), user_id.to_string()],
            ],
            timeline_limit,
            filters: Some(self.behaviour.filters()),
        }
    }

    /// Apply one server operation, returning the rooms it materialized or
    /// updated. A consistency violation drops the affected page and returns
    /// [`Error::ListConsistency`].
    pub fn apply(&mut self, user_id: &UserId, op: ListOperation) -> Result<Vec<TouchedRoom>> {
        match op {
            ListOperation::Sync { range, rooms, .. } => self.apply_sync(user_id, range, rooms),
            ListOperation::Insert { index, room, .. } => self.apply_insert(user_id, index, room),
            ListOperation::Update { index, room, .. } => self.apply_update(user_id, index, room),
            ListOperation::Delete { index, .. } => self.apply_delete(index).map(|()| Vec::new()),
            ListOperation::Invalidate { range, .. } => {
                self.invalidate_range(range);
                Ok(Vec::new())
            }
        }
    }

    fn apply_sync(
        &mut self,
        user_id: &UserId,
        [start, end]: [u64; 2],
        rooms: Vec<Option<RoomPayload>>,
    ) -> Result<Vec<TouchedRoom>> {
        if end <= start
            || start % self.page_size != 0
            || end - start > self.page_size
            || start.checked_add(self.page_size).is_none()
        {
            self.invalidate_range([start, end]);
            return Err(self.inconsistent(format!(
                "SYNC range [{start}, {end}) does not fit a page of {}",
                self.page_size
            )));
        }
        let width = (end - start) as usize;
        if rooms.len() > width {
            warn!(list = self.name(), width, received = rooms.len(), "SYNC carried more rooms than its range");
        }

        // Rooms of the replaced page stay available for reuse until the
        // rebuilt page is in place.
        let mut detached: HashMap<OwnedRoomId, V3Room> = HashMap::new();
        if let Some(previous) = self.pages.remove(&start) {
            for id in previous.slots.into_iter().flatten() {
                if self.position_of(&id).is_none() {
                    if let Some(room) = self.rooms.remove(&id) {
                        detached.insert(id, room);
                    }
                }
            }
        }

        let mut slots: Vec<Option<OwnedRoomId>> = Vec::with_capacity(width);
        let mut touched = Vec::new();
        for payload in rooms.into_iter().take(width) {
            let entry = payload.and_then(|p| p.room_id.clone().map(|id| (id, p)));
            let Some((room_id, payload)) = entry else {
                slots.push(None);
                continue;
            };
            if slots.iter().any(|slot| slot.as_ref() == Some(&room_id)) {
                warn!(list = self.name(), %room_id, "Room listed twice in one SYNC");
                slots.push(None);
                continue;
            }
            self.clear_slot_of(&room_id);
            let room = detached
                .remove(&room_id)
                .or_else(|| self.rooms.remove(&room_id));
            self.materialize(user_id, room, &room_id, &payload);
            slots.push(Some(room_id.clone()));
            touched.push(TouchedRoom { room_id, payload });
        }
        slots.resize(width, None);

        self.pages.insert(start, Page { slots });
        self.collect_garbage();
        debug!(list = self.name(), start, end, rooms = touched.len(), "SYNC applied");
        Ok(touched)
    }

    fn apply_insert(
        &mut self,
        user_id: &UserId,
        index: u64,
        payload: RoomPayload,
    ) -> Result<Vec<TouchedRoom>> {
        let (start, offset) = self.checked_locate(index)?;
        let Some(room_id) = payload.room_id.clone() else {
            self.invalidate_page(start);
            return Err(self.inconsistent(format!("INSERT at {index} without a room id")));
        };

        self.clear_slot_of(&room_id);
        let page_size = self.page_size as usize;
        // Inserting into an unknown window creates it as a sparse page.
        let page = self.pages.entry(start).or_default();
        if page.slots.len() < offset {
            page.slots.resize(offset, None);
        }
        page.slots.insert(offset, Some(room_id.clone()));
        let evicted = if page.slots.len() > page_size {
            page.slots.pop().flatten()
        } else {
            None
        };
        if let Some(evicted) = evicted {
            debug!(list = self.name(), room_id = %evicted, "Room pushed past page boundary");
        }

        let room = self.rooms.remove(&room_id);
        self.materialize(user_id, room, &room_id, &payload);
        self.collect_garbage();
        Ok(vec![TouchedRoom { room_id, payload }])
    }

    fn apply_update(
        &mut self,
        user_id: &UserId,
        index: u64,
        payload: RoomPayload,
    ) -> Result<Vec<TouchedRoom>> {
        let (start, _) = self.checked_locate(index)?;
        let Some(room_id) = self.room_id_at(index).map(RoomId::to_owned) else {
            self.invalidate_page(start);
            return Err(self.inconsistent(format!("UPDATE at {index} with no known room")));
        };
        if let Some(claimed) = &payload.room_id {
            if *claimed != room_id {
                self.invalidate_page(start);
                return Err(self.inconsistent(format!(
                    "UPDATE at {index} names {claimed} but the slot holds {room_id}"
                )));
            }
        }

        let room = self.rooms.remove(&room_id);
        self.materialize(user_id, room, &room_id, &payload);
        Ok(vec![TouchedRoom { room_id, payload }])
    }

    fn apply_delete(&mut self, index: u64) -> Result<()> {
        let (start, offset) = self.checked_locate(index)?;
        let removed = match self
            .pages
            .get_mut(&start)
            .and_then(|page| page.slots.get_mut(offset))
        {
            Some(slot) => slot.take(),
            None => {
                self.invalidate_page(start);
                return Err(self.inconsistent(format!("DELETE at {index} outside known pages")));
            }
        };
        if let Some(room_id) = removed {
            debug!(list = self.name(), %room_id, index, "Room deleted from list");
            self.collect_garbage();
        }
        Ok(())
    }

    /// Drop every page overlapping `[start, end)`.
    pub fn invalidate_range(&mut self, [start, end]: [u64; 2]) {
        let page_size = self.page_size;
        let before = self.pages.len();
        self.pages
            .retain(|page_start, _| !(*page_start < end && start < page_start.saturating_add(page_size)));
        if self.pages.len() != before {
            debug!(list = self.name(), start, end, "Invalidated pages");
            self.collect_garbage();
        }
    }

    fn invalidate_page(&mut self, start: u64) {
        self.invalidate_range([start, start.saturating_add(self.page_size)]);
    }

    /// [`Self::locate`] for a server-sent index. An index whose page would
    /// end past `u64::MAX` invalidates everything from its page on.
    fn checked_locate(&mut self, index: u64) -> Result<(u64, usize)> {
        let (start, offset) = self.locate(index);
        if start.checked_add(self.page_size).is_none() {
            self.invalidate_range([start, u64::MAX]);
            return Err(self.inconsistent(format!("index {index} is outside any addressable page")));
        }
        Ok((start, offset))
    }

    fn clear_slot_of(&mut self, room_id: &RoomId) {
        for page in self.pages.values_mut() {
            for slot in page.slots.iter_mut() {
                if slot.as_deref() == Some(room_id) {
                    *slot = None;
                }
            }
        }
    }

    fn materialize(
        &mut self,
        user_id: &UserId,
        existing: Option<V3Room>,
        room_id: &RoomId,
        payload: &RoomPayload,
    ) {
        let mut room = existing.unwrap_or_else(|| V3Room::new(room_id.to_owned()));
        room.apply_payload(user_id, payload);
        self.rooms.insert(room_id.to_owned(), room);
    }

    /// Forget rooms no page refers to anymore.
    fn collect_garbage(&mut self) {
        let referenced: HashSet<&OwnedRoomId> = self
            .pages
            .values()
            .flat_map(|page| page.slots.iter().flatten())
            .collect();
        let stale: Vec<OwnedRoomId> = self
            .rooms
            .keys()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.rooms.remove(&id);
        }
    }

    fn inconsistent(&self, detail: String) -> Error {
        Error::list_consistency(self.name(), detail)
    }

    pub fn lossy_serialized(&self) -> LossyList {
        let pages = self
            .pages
            .iter()
            .map(|(start, page)| LossyPage {
                range: [*start, start.saturating_add(page.slots.len() as u64)],
                rooms: page
                    .slots
                    .iter()
                    .map(|slot| {
                        slot.as_ref()
                            .and_then(|id| self.rooms.get(id))
                            .map(V3Room::lossy_serialized)
                    })
                    .collect(),
            })
            .collect();
        LossyList {
            behaviour: self.behaviour,
            total_count: self.total_count,
            pages,
        }
    }

    /// Rebuild from the persisted form. Pages that no longer fit the
    /// configured page size are skipped and will be re-synced.
    pub fn from_lossy(lossy: LossyList, page_size: u64) -> Self {
        let mut list = Self::new(lossy.behaviour, page_size);
        list.total_count = lossy.total_count;
        for page in lossy.pages {
            let [start, end] = page.range;
            if start % list.page_size != 0
                || end < start
                || end - start > list.page_size
                || start.checked_add(list.page_size).is_none()
            {
                warn!(list = list.name(), start, end, "Skipping persisted page that no longer fits");
                continue;
            }
            let mut slots = Vec::with_capacity(page.rooms.len());
            for room in page.rooms {
                match room {
                    Some(lossy_room) => {
                        let room = V3Room::from_lossy(lossy_room);
                        slots.push(Some(room.room_id().to_owned()));
                        list.rooms.insert(room.room_id().to_owned(), room);
                    }
                    None => slots.push(None),
                }
            }
            list.pages.insert(start, Page { slots });
        }
        list
    }
}
