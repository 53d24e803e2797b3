//! In-place free-space formatting. Reclaimed ranges are stamped with a
//! two-word header (tagged size + forward link) directly in heap
//! memory, so the heap stays walkable without external bookkeeping.
//!
//! This is the crate's raw-memory boundary: every read or write of a
//! dead cell goes through the audited accessors below.

use crate::util::constants::{BYTES_IN_WORD, MIN_CELL_SIZE};
use crate::util::Address;

/// Low bit of a cell's first word distinguishing dead space from live
/// objects. Object sizes are word-aligned, so live headers have it
/// clear.
const DEAD_BIT: usize = 0b1;

/// Format `[start, start + size)` as a free chunk with no successor.
///
/// # Safety
/// The range must be writable heap memory of at least
/// [`MIN_CELL_SIZE`] bytes, word aligned.
pub unsafe fn format(start: Address, size: usize) {
    debug_assert!(size >= MIN_CELL_SIZE);
    debug_assert!(size % BYTES_IN_WORD == 0);
    debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
    start.store(size | DEAD_BIT);
    set_next(start, Address::ZERO);
}

/// Format `[start, start + size)` as unreclaimable dead filler (dark
/// matter). A one-word filler carries only the tagged size.
///
/// # Safety
/// The range must be writable heap memory, word aligned, nonempty.
pub unsafe fn format_dead(start: Address, size: usize) {
    debug_assert!(size >= BYTES_IN_WORD);
    debug_assert!(size % BYTES_IN_WORD == 0);
    start.store(size | DEAD_BIT);
    if size >= MIN_CELL_SIZE {
        set_next(start, Address::ZERO);
    }
}

/// Is the cell at `addr` dead space (free chunk or filler)?
///
/// # Safety
/// `addr` must be a parsable cell boundary.
pub unsafe fn is_dead_cell(addr: Address) -> bool {
    addr.load::<usize>() & DEAD_BIT != 0
}

/// Size in bytes of the dead cell at `chunk`.
///
/// # Safety
/// `chunk` must be a formatted dead cell.
pub unsafe fn size_of(chunk: Address) -> usize {
    let header = chunk.load::<usize>();
    debug_assert!(header & DEAD_BIT != 0, "not a dead cell: {chunk}");
    header & !DEAD_BIT
}

/// The chunk after `chunk` on its list, or zero.
///
/// # Safety
/// `chunk` must be a formatted free chunk (not a one-word filler).
pub unsafe fn next(chunk: Address) -> Address {
    (chunk + BYTES_IN_WORD).load()
}

/// Link `chunk` to `successor`.
///
/// # Safety
/// `chunk` must be a formatted free chunk.
pub unsafe fn set_next(chunk: Address, successor: Address) {
    (chunk + BYTES_IN_WORD).store(successor);
}

/// Total bytes across a chunk list.
///
/// # Safety
/// `head` must be zero or the head of a well-formed chunk list.
pub unsafe fn total_bytes(head: Address) -> usize {
    let mut total = 0;
    let mut chunk = head;
    while !chunk.is_zero() {
        total += size_of(chunk);
        chunk = next(chunk);
    }
    total
}

/// Number of chunks on a chunk list.
///
/// # Safety
/// `head` must be zero or the head of a well-formed chunk list.
pub unsafe fn count(head: Address) -> usize {
    let mut n = 0;
    let mut chunk = head;
    while !chunk.is_zero() {
        n += 1;
        chunk = next(chunk);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_list_roundtrip() {
        let mut backing = vec![0usize; 64];
        let base = Address::from_mut_ptr(backing.as_mut_ptr());
        unsafe {
            format(base, 64);
            format(base + 128usize, 256);
            set_next(base, base + 128usize);
            assert!(is_dead_cell(base));
            assert_eq!(size_of(base), 64);
            assert_eq!(next(base), base + 128usize);
            assert_eq!(total_bytes(base), 64 + 256);
            assert_eq!(count(base), 2);
        }
    }

    #[test]
    fn dead_filler_is_parsable() {
        let mut backing = vec![0usize; 4];
        let base = Address::from_mut_ptr(backing.as_mut_ptr());
        unsafe {
            format_dead(base, 8);
            assert!(is_dead_cell(base));
            assert_eq!(size_of(base), 8);
        }
    }
}
