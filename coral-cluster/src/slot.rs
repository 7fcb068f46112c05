//! Key-to-slot hashing and the dense slot ownership map.

use coral_common::ids::{SlotId, SLOT_COUNT};
use crc::{Crc, CRC_16_XMODEM};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Returns the hash input for a key: the bytes between the first `{` and the next
/// `}` when that span is nonempty, otherwise the whole key.
#[must_use]
pub fn hashtag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|byte| *byte == b'{') else {
        return key;
    };
    let Some(close) = key[open + 1..].iter().position(|byte| *byte == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &key[open + 1..open + 1 + close]
}

/// Maps a key to its cluster slot.
#[must_use]
pub fn key_slot(key: &[u8]) -> SlotId {
    #[allow(clippy::cast_possible_truncation)]
    let slot = usize::from(CRC16.checksum(hashtag(key))) % SLOT_COUNT;
    slot as SlotId
}

/// Closed slot range `[start, end]` as advertised by `CLUSTER NODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// Range start.
    pub start: SlotId,
    /// Range end.
    pub end: SlotId,
}

impl SlotRange {
    /// Checks whether a slot is within this range.
    #[must_use]
    pub fn contains(self, slot: SlotId) -> bool {
        self.start <= slot && slot <= self.end
    }
}

/// Dense slot → replicaset-index table.
///
/// The stored index points into the topology's replicaset list; `None` means no
/// known owner and requests for that slot fail fast.
#[derive(Debug, Clone)]
pub struct SlotMap {
    owners: Vec<Option<usize>>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    /// Creates an all-unowned map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: vec![None; SLOT_COUNT],
        }
    }

    /// Records `replicaset` as the owner of `slot`.
    pub fn set(&mut self, slot: SlotId, replicaset: usize) {
        self.owners[usize::from(slot)] = Some(replicaset);
    }

    /// Returns the owning replicaset index, if any.
    #[must_use]
    pub fn get(&self, slot: SlotId) -> Option<usize> {
        self.owners[usize::from(slot)]
    }

    /// Clears every owner.
    pub fn reset(&mut self) {
        for owner in &mut self.owners {
            *owner = None;
        }
    }

    /// Number of owned slots.
    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.owners.iter().filter(|owner| owner.is_some()).count()
    }
}
