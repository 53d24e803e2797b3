//! Per-region state encoding and the region state machine.
//!
//! A region's state is a small flag word; named states are fixed flag
//! combinations. State changes go through [`RegionInfo::set_state`],
//! which checks the transition against the adjacency table in debug
//! builds. Flags are only mutated with mutators stopped; the table
//! check is the correctness backstop, not locking.

use crate::util::Address;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Region index into the region table.
pub type RegionId = usize;

/// Flag bits composing a region state.
pub mod flags {
    /// The region has an open allocation edge and is not parsable.
    pub const ALLOCATING: u8 = 1 << 0;
    /// The region is fully parsable and can be walked cell by cell.
    pub const ITERABLE: u8 = 1 << 1;
    /// The region carries a list of reusable free chunks.
    pub const HAS_FREE_CHUNKS: u8 = 1 << 2;
    /// First region of a multi-region large object.
    pub const LARGE_HEAD: u8 = 1 << 3;
    /// Interior region of a multi-region large object.
    pub const LARGE_BODY: u8 = 1 << 4;
    /// Last region of a multi-region large object.
    pub const LARGE_TAIL: u8 = 1 << 5;
}

/// Named region states. Each maps to a unique flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// Unused, zero-filled, available for any purpose.
    Empty,
    /// Open for bump allocation.
    Allocating,
    /// Fully occupied, parsable, no reusable space.
    Full,
    /// Parsable with a list of reusable free chunks.
    FreeChunks,
    /// Head of a large object.
    LargeHead,
    /// Interior of a large object.
    LargeBody,
    /// Tail of a large object with no reusable room.
    LargeFullTail,
    /// Tail of a large object with reusable free space.
    LargeTail,
    /// Tail of a large object currently open for bump allocation.
    LargeAllocatingTail,
}

use flags::*;
use RegionState::*;

impl RegionState {
    /// The canonical flag word for this state.
    pub const fn flags(self) -> u8 {
        match self {
            Empty => 0,
            Allocating => ALLOCATING,
            Full => ITERABLE,
            FreeChunks => ITERABLE | HAS_FREE_CHUNKS,
            LargeHead => ITERABLE | LARGE_HEAD,
            LargeBody => LARGE_BODY,
            LargeFullTail => ITERABLE | LARGE_TAIL,
            LargeTail => ITERABLE | LARGE_TAIL | HAS_FREE_CHUNKS,
            LargeAllocatingTail => ALLOCATING | LARGE_TAIL,
        }
    }

    /// Decode a flag word back into its named state.
    pub fn from_flags(word: u8) -> RegionState {
        for s in Self::ALL {
            if s.flags() == word {
                return s;
            }
        }
        crate::fatal_error!("invalid region flag word {:#x}", word);
    }

    pub const ALL: [RegionState; 9] = [
        Empty,
        Allocating,
        Full,
        FreeChunks,
        LargeHead,
        LargeBody,
        LargeFullTail,
        LargeTail,
        LargeAllocatingTail,
    ];

    /// Is `(self, to)` an edge of the region state machine? Reflexive
    /// re-assertions are always legal.
    pub fn can_transition_to(self, to: RegionState) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            // Empty regions can be put to any first use.
            (Empty, Allocating)
                | (Empty, LargeHead)
                | (Empty, LargeBody)
                | (Empty, LargeFullTail)
                | (Empty, LargeTail)
                | (Empty, LargeAllocatingTail)
                // Retiring an allocating region.
                | (Allocating, Full)
                | (Allocating, FreeChunks)
                | (Allocating, Empty)
                // Sweep outcomes for ordinary regions.
                | (Full, FreeChunks)
                | (Full, Empty)
                | (FreeChunks, Full)
                | (FreeChunks, Empty)
                // Reuse of partially free regions.
                | (FreeChunks, Allocating)
                // Large-object reclamation.
                | (LargeHead, Empty)
                | (LargeBody, Empty)
                | (LargeFullTail, Empty)
                | (LargeFullTail, LargeTail)
                | (LargeTail, Empty)
                | (LargeTail, LargeFullTail)
                | (LargeTail, LargeAllocatingTail)
                | (LargeAllocatingTail, LargeTail)
                | (LargeAllocatingTail, LargeFullTail)
                | (LargeAllocatingTail, Empty)
        )
    }
}

/// Metadata record for one fixed-size heap region. Never deallocated;
/// recycled through [`RegionState::Empty`].
pub struct RegionInfo {
    flag_word: AtomicU8,
    /// Head of the region's in-place free chunk list, zero if none.
    free_chunk_head: AtomicUsize,
    /// Bytes on the free chunk list.
    free_bytes: AtomicUsize,
    /// Dead bytes below the reclaim threshold, left in place.
    dark_matter_bytes: AtomicUsize,
    /// Owner tag: which heap account the region belongs to.
    owner: AtomicU8,
}

/// Owner tag for regions not attached to any heap account.
pub const NO_OWNER: u8 = 0;

impl RegionInfo {
    pub fn new() -> Self {
        Self {
            flag_word: AtomicU8::new(Empty.flags()),
            free_chunk_head: AtomicUsize::new(0),
            free_bytes: AtomicUsize::new(0),
            dark_matter_bytes: AtomicUsize::new(0),
            owner: AtomicU8::new(NO_OWNER),
        }
    }

    pub fn state(&self) -> RegionState {
        RegionState::from_flags(self.flag_word.load(Ordering::Relaxed))
    }

    pub fn flag_word(&self) -> u8 {
        self.flag_word.load(Ordering::Relaxed)
    }

    pub fn is(&self, f: u8) -> bool {
        self.flag_word() & f == f
    }

    /// Transition to `new`. Illegal transitions are fatal in debug
    /// builds; the flag store itself is unconditional.
    pub fn set_state(&self, new: RegionState) {
        debug_assert!(
            self.state().can_transition_to(new),
            "illegal region transition {:?} -> {:?}",
            self.state(),
            new
        );
        self.flag_word.store(new.flags(), Ordering::Relaxed);
    }

    /// Fast path for the hottest retirement transition: computes the
    /// flag word directly. Must produce exactly
    /// `RegionState::Allocating.flags()` and obeys the same check.
    pub fn to_allocating_state(&self) {
        debug_assert!(self.state().can_transition_to(Allocating));
        self.flag_word.store(ALLOCATING, Ordering::Relaxed);
    }

    /// Fast path analogue of `set_state(Full)`.
    pub fn to_full_state(&self) {
        debug_assert!(self.state().can_transition_to(Full));
        self.flag_word.store(ITERABLE, Ordering::Relaxed);
    }

    pub fn owner(&self) -> u8 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn set_owner(&self, owner: u8) {
        self.owner.store(owner, Ordering::Relaxed);
    }

    pub fn free_chunk_head(&self) -> Address {
        unsafe { Address::from_usize(self.free_chunk_head.load(Ordering::Relaxed)) }
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    pub fn dark_matter_bytes(&self) -> usize {
        self.dark_matter_bytes.load(Ordering::Relaxed)
    }

    /// Attach a swept free chunk list and its accounting.
    pub fn set_free_chunks(&self, head: Address, free_bytes: usize) {
        self.free_chunk_head.store(head.as_usize(), Ordering::Relaxed);
        self.free_bytes.store(free_bytes, Ordering::Relaxed);
    }

    pub fn set_dark_matter(&self, bytes: usize) {
        self.dark_matter_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Detach the free chunk list, returning its head.
    pub fn take_free_chunks(&self) -> Address {
        let head = self.free_chunk_head.swap(0, Ordering::Relaxed);
        self.free_bytes.store(0, Ordering::Relaxed);
        unsafe { Address::from_usize(head) }
    }

    /// Reset all metadata for recycling through Empty.
    pub fn reset(&self) {
        self.set_state(Empty);
        self.free_chunk_head.store(0, Ordering::Relaxed);
        self.free_bytes.store(0, Ordering::Relaxed);
        self.dark_matter_bytes.store(0, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
    }
}

impl Default for RegionInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_states_have_unique_flag_words() {
        for a in RegionState::ALL {
            for b in RegionState::ALL {
                if a != b {
                    assert_ne!(a.flags(), b.flags(), "{a:?} vs {b:?}");
                }
            }
            assert_eq!(RegionState::from_flags(a.flags()), a);
        }
    }

    #[test]
    fn fast_paths_match_named_states() {
        let info = RegionInfo::new();
        info.set_state(Allocating);
        assert_eq!(info.flag_word(), Allocating.flags());
        info.to_full_state();
        assert_eq!(info.flag_word(), Full.flags());
        let info = RegionInfo::new();
        info.to_allocating_state();
        assert_eq!(info.flag_word(), Allocating.flags());
    }

    #[test]
    fn legal_transitions_succeed() {
        for from in RegionState::ALL {
            for to in RegionState::ALL {
                if from.can_transition_to(to) {
                    let info = RegionInfo::new();
                    info.flag_word.store(from.flags(), Ordering::Relaxed);
                    info.set_state(to);
                    assert_eq!(info.state(), to);
                }
            }
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    fn illegal_transitions_are_fatal() {
        for from in RegionState::ALL {
            for to in RegionState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let outcome = std::panic::catch_unwind(|| {
                    let info = RegionInfo::new();
                    info.flag_word.store(from.flags(), Ordering::Relaxed);
                    info.set_state(to);
                });
                assert!(outcome.is_err(), "{from:?} -> {to:?} must be fatal");
            }
        }
    }
}
