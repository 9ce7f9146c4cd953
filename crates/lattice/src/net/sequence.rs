//! Circular sequence-id arithmetic and ack bookkeeping.
//!
//! Sequence ids live in a compact wrapping space; all ordering queries go
//! through [`sequence_more_recent`] / [`sequence_relative_to`] so wraparound
//! never breaks comparisons. An [`Ack`] summarizes receipt as the most recent
//! id plus a trailing bitmask of the ids before it.

/// Wire width of a sequence id.
pub const SEQUENCE_BITS: u32 = 10;

/// Number of distinct sequence ids. Ids wrap at this value.
pub const SEQUENCE_COUNT: u16 = 1 << SEQUENCE_BITS;

/// Sentinel meaning "no sequence received yet". One past the valid range;
/// fields that can carry it are serialized with one extra bit of range.
pub const SEQUENCE_INVALID: SequenceId = SEQUENCE_COUNT;

/// How many ids before `Ack::sequence_id` the trailing bitmask covers.
pub const ACK_PREVIOUS_SEQUENCES: i32 = 64;

const SEQUENCE_HALF: u16 = SEQUENCE_COUNT / 2;

pub type SequenceId = u16;

/// True if `a` is more recent than `b` in the wrapping space.
///
/// Antisymmetric for `a != b`, including at the antipodal distance: exactly
/// one of `more_recent(a, b)` / `more_recent(b, a)` holds. `SEQUENCE_INVALID`
/// sorts before everything.
pub fn sequence_more_recent(a: SequenceId, b: SequenceId) -> bool {
    if b == SEQUENCE_INVALID {
        return a != SEQUENCE_INVALID;
    }
    if a == SEQUENCE_INVALID {
        return false;
    }
    (a > b && a - b <= SEQUENCE_HALF) || (a < b && b - a > SEQUENCE_HALF)
}

/// Signed offset of `a` relative to `b`, in `(-SEQUENCE_COUNT/2,
/// SEQUENCE_COUNT/2]`. Both ids must be valid.
pub fn sequence_relative_to(a: SequenceId, b: SequenceId) -> i32 {
    debug_assert!(a < SEQUENCE_COUNT && b < SEQUENCE_COUNT);
    let d = i32::from((a + SEQUENCE_COUNT - b) % SEQUENCE_COUNT);
    if d > i32::from(SEQUENCE_HALF) {
        d - i32::from(SEQUENCE_COUNT)
    } else {
        d
    }
}

/// Advance a valid id by a (possibly negative) delta, wrapping.
pub fn sequence_advance(a: SequenceId, delta: i32) -> SequenceId {
    debug_assert!(a < SEQUENCE_COUNT);
    (i32::from(a) + delta).rem_euclid(i32::from(SEQUENCE_COUNT)) as SequenceId
}

/// Receipt summary: the most recent id received from a peer, plus a bitmask
/// where bit `k` records that `sequence_id - (k + 1)` was also received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence_id: SequenceId,
    pub previous_sequences: u64,
}

impl Default for Ack {
    fn default() -> Self {
        Self {
            sequence_id: SEQUENCE_INVALID,
            previous_sequences: 0,
        }
    }
}

impl Ack {
    /// Whether `sequence_id` is covered by this ack. Ids newer than the ack
    /// head are never covered; an empty ack covers nothing.
    pub fn covers(&self, sequence_id: SequenceId) -> bool {
        if self.sequence_id == SEQUENCE_INVALID || sequence_id == SEQUENCE_INVALID {
            return false;
        }
        let relative = sequence_relative_to(sequence_id, self.sequence_id);
        if relative == 0 {
            true
        } else if relative > 0 || relative < -ACK_PREVIOUS_SEQUENCES {
            false
        } else {
            self.previous_sequences & (1u64 << (-relative - 1)) != 0
        }
    }
}
