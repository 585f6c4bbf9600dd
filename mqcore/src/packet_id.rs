//! Numeric packet identifier tables.
//!
//! Ids live in `[1, 65535)`. Allocation always hands out the lowest free id, so ids released
//! out of order are reused first. A cursor below which every id is occupied keeps the scan
//! short while the low end of the space is saturated. `0` is returned when the whole space is
//! occupied; callers must treat it as an allocation failure and hold back new QoS>0 sends.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::PacketId;
use crate::{MqError, Result};

pub const INVALID_PACKET_ID: PacketId = 0;
pub const MIN_PACKET_ID: PacketId = 1;
/// Exclusive upper bound.
pub const MAX_PACKET_ID: PacketId = u16::MAX;
pub const PACKET_ID_CAPACITY: usize = (MAX_PACKET_ID - MIN_PACKET_ID) as usize;

/// Ids bound to the UUID of the ledger entry they carry.
pub type MessageIdStore = PacketIdStore<Uuid>;
/// Ids whose only payload is their occupancy.
pub type QueueIdStore = PacketIdStore<()>;

struct IdTable<V> {
    ids: BTreeMap<PacketId, V>,
    //every id below the cursor is occupied
    cursor: PacketId,
    last: PacketId,
}

impl<V> IdTable<V> {
    #[inline]
    fn lowest_free(&self) -> Option<PacketId> {
        if self.ids.len() >= PACKET_ID_CAPACITY {
            return None;
        }
        let mut expected = self.cursor;
        for id in self.ids.range(self.cursor..).map(|(id, _)| id) {
            if *id != expected {
                break;
            }
            expected += 1;
        }
        if expected < MAX_PACKET_ID {
            Some(expected)
        } else {
            None
        }
    }
}

pub struct PacketIdStore<V> {
    inner: Mutex<IdTable<V>>,
}

impl<V> Default for PacketIdStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PacketIdStore<V> {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdTable { ids: BTreeMap::new(), cursor: MIN_PACKET_ID, last: INVALID_PACKET_ID }),
        }
    }

    #[inline]
    pub fn is_valid(id: PacketId) -> bool {
        (MIN_PACKET_ID..MAX_PACKET_ID).contains(&id)
    }

    /// Binds the lowest free id to `value`, or returns [`INVALID_PACKET_ID`] when exhausted.
    pub fn get_new_id(&self, value: V) -> PacketId {
        let mut table = self.inner.lock();
        match table.lowest_free() {
            Some(id) => {
                table.ids.insert(id, value);
                table.cursor = id + 1;
                table.last = id;
                id
            }
            None => {
                log::warn!("packet id space exhausted, {} ids occupied", table.ids.len());
                INVALID_PACKET_ID
            }
        }
    }

    /// Same as [`PacketIdStore::get_new_id`] with exhaustion reported as
    /// [`MqError::PacketIdExhausted`].
    #[inline]
    pub fn try_new_id(&self, value: V) -> Result<PacketId> {
        match self.get_new_id(value) {
            INVALID_PACKET_ID => Err(MqError::PacketIdExhausted),
            id => Ok(id),
        }
    }

    /// Occupies an id chosen by the remote side.
    pub fn bind(&self, id: PacketId, value: V) -> bool {
        if !Self::is_valid(id) {
            return false;
        }
        let mut table = self.inner.lock();
        if table.ids.contains_key(&id) {
            false
        } else {
            table.ids.insert(id, value);
            true
        }
    }

    #[inline]
    pub fn is_occupied(&self, id: PacketId) -> bool {
        self.inner.lock().ids.contains_key(&id)
    }

    #[inline]
    pub fn free_id(&self, id: PacketId) -> bool {
        let mut table = self.inner.lock();
        if table.ids.remove(&id).is_some() {
            table.cursor = table.cursor.min(id);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn clear(&self) {
        let mut table = self.inner.lock();
        table.ids.clear();
        table.cursor = MIN_PACKET_ID;
        table.last = INVALID_PACKET_ID;
    }

    #[inline]
    pub fn last_allocated(&self) -> PacketId {
        self.inner.lock().last
    }
}

impl<V: Clone> PacketIdStore<V> {
    #[inline]
    pub fn get(&self, id: PacketId) -> Option<V> {
        self.inner.lock().ids.get(&id).cloned()
    }
}

impl<V: PartialEq> PacketIdStore<V> {
    /// Frees `id` only while it is still bound to `value`.
    pub fn free_id_if(&self, id: PacketId, value: &V) -> bool {
        let mut table = self.inner.lock();
        if table.ids.get(&id) != Some(value) {
            return false;
        }
        table.ids.remove(&id);
        table.cursor = table.cursor.min(id);
        true
    }
}

impl PacketIdStore<Uuid> {
    #[inline]
    pub fn get_uuid(&self, id: PacketId) -> Option<Uuid> {
        self.get(id)
    }
}

impl PacketIdStore<()> {
    #[inline]
    pub fn next_id(&self) -> PacketId {
        self.get_new_id(())
    }
}
