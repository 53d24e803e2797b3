//! Card table: one byte per card recording whether the card may hold
//! references the collector has not yet seen. The write barrier dirties
//! with a blind zero store, so DIRTY must be the zero value.

use crate::heap::byte_table::ByteTable;
use crate::util::constants::LOG_BYTES_IN_CARD;
use crate::util::Address;
use std::sync::atomic::Ordering;

/// Card state byte values.
pub const CARD_CLEAN: u8 = 0xff;
pub const CARD_DIRTY: u8 = 0x00;

pub struct CardTable {
    table: ByteTable,
}

impl CardTable {
    pub fn new(covered_start: Address, covered_bytes: usize) -> Self {
        Self {
            table: ByteTable::new(covered_start, covered_bytes, LOG_BYTES_IN_CARD, CARD_CLEAN),
        }
    }

    pub fn num_cards(&self) -> usize {
        self.table.num_entries()
    }

    pub fn covers(&self, addr: Address) -> bool {
        self.table.covers(addr)
    }

    pub fn card_of(&self, addr: Address) -> usize {
        self.table.index_of(addr)
    }

    pub fn card_start(&self, card: usize) -> Address {
        self.table.range_start(card)
    }

    /// Dirty the card covering `addr`. This is the write-barrier entry
    /// point: a single byte store through the biased base.
    pub fn dirty(&self, addr: Address) {
        self.table.entry_for(addr).store(CARD_DIRTY, Ordering::Relaxed);
    }

    /// Dirty every card overlapping `[start, end)`.
    pub fn dirty_range(&self, start: Address, end: Address) {
        let from = self.card_of(start);
        let to = self.card_of(end - 1usize);
        self.table.fill(from, to + 1, CARD_DIRTY);
    }

    pub fn is_dirty(&self, card: usize) -> bool {
        self.table.get(card) == CARD_DIRTY
    }

    pub fn clean(&self, card: usize) {
        self.table.set(card, CARD_CLEAN);
    }

    /// Clean every card overlapping `[start, end)`.
    pub fn clean_range(&self, start: Address, end: Address) {
        let from = self.card_of(start);
        let to = self.card_of(end - 1usize);
        self.table.fill(from, to + 1, CARD_CLEAN);
    }

    pub fn clean_all(&self) {
        self.table.fill(0, self.num_cards(), CARD_CLEAN);
    }

    /// Index of the first dirty card in `[from, to)`, or None.
    pub fn first_dirty(&self, from: usize, to: usize) -> Option<usize> {
        self.table.first_matching(from, to, CARD_DIRTY)
    }

    /// Visit maximal dirty card runs overlapping `[start, end)` as
    /// `(range_start, range_end)` address pairs.
    pub fn visit_dirty_ranges(&self, start: Address, end: Address, f: &mut dyn FnMut(Address, Address)) {
        let last = self.card_of(end - 1usize);
        let mut card = self.card_of(start);
        while let Some(first_dirty) = self.first_dirty(card, last + 1) {
            let mut run_end = first_dirty;
            while run_end <= last && self.is_dirty(run_end) {
                run_end += 1;
            }
            let run_start_addr = self.card_start(first_dirty).max(start);
            let run_end_addr = self.card_start(run_end).min(end);
            f(run_start_addr, run_end_addr);
            card = run_end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn table() -> CardTable {
        let base = unsafe { Address::from_usize(0x40_0000) };
        CardTable::new(base, 64 * BYTES_IN_CARD)
    }

    #[test]
    fn dirty_then_first_dirty() {
        let t = table();
        let addr = t.card_start(7) + 16usize;
        t.dirty(addr);
        assert_eq!(t.first_dirty(7, 8), Some(7));
        assert_eq!(t.first_dirty(0, t.num_cards()), Some(7));
        t.clean_all();
        assert_eq!(t.first_dirty(0, t.num_cards()), None);
    }

    #[test]
    fn dirty_range_spans_cards() {
        let t = table();
        let start = t.card_start(2) + 8usize;
        let end = t.card_start(5) + 8usize;
        t.dirty_range(start, end);
        for card in 2..=5 {
            assert!(t.is_dirty(card));
        }
        assert!(!t.is_dirty(1));
        assert!(!t.is_dirty(6));
    }

    #[test]
    fn visit_dirty_ranges_coalesces() {
        let t = table();
        t.dirty(t.card_start(3));
        t.dirty(t.card_start(4));
        t.dirty(t.card_start(9));
        let mut seen = vec![];
        t.visit_dirty_ranges(
            t.card_start(0),
            t.card_start(16),
            &mut |s, e| seen.push((t.card_of(s), t.card_of(e - 1usize))),
        );
        assert_eq!(seen, vec![(3, 4), (9, 9)]);
    }
}
