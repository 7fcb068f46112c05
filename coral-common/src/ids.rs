//! Canonical identifier types used across codec, cluster and proxy crates.

/// Redis cluster slot identifier.
pub type SlotId = u16;

/// Unique identifier of one parsed client request.
pub type MsgId = u64;

/// Unique identifier of one per-shard sub-request.
pub type FragId = u64;

/// Number of slots in the Redis-compatible hash slot space.
pub const SLOT_COUNT: usize = 16384;

/// Largest valid slot value.
pub const MAX_SLOT_ID: SlotId = (SLOT_COUNT - 1) as SlotId;

#[cfg(test)]
mod tests {
    use super::{MAX_SLOT_ID, SLOT_COUNT};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn slot_space_is_16k() {
        assert_that!(SLOT_COUNT, eq(16384));
        assert_that!(usize::from(MAX_SLOT_ID), eq(SLOT_COUNT - 1));
    }
}
