//! First-object table: one byte per card recording where the cell
//! overlapping the card's first word starts, so a dirty-card scan can
//! find a cell boundary in O(1) instead of walking from the region
//! start.
//!
//! Encoding, per entry covering card `c`:
//! - `e >= 0`: the cell starts `e` words before the card's first word.
//! - `e < 0`: step `2^(-e - 1)` cards towards the cell head and read
//!   that entry. Chained power-of-two hops keep lookup logarithmic in
//!   the cell's card span.
//!
//! Allocators update the table for every allocated span before the
//! cell is published.

use crate::heap::byte_table::ByteTable;
use crate::util::constants::{LOG_BYTES_IN_CARD, LOG_BYTES_IN_WORD};
use crate::util::Address;

/// Largest word offset representable directly.
const MAX_DIRECT_OFFSET: usize = i8::MAX as usize;

pub struct FirstObjectTable {
    table: ByteTable,
}

impl FirstObjectTable {
    pub fn new(covered_start: Address, covered_bytes: usize) -> Self {
        Self {
            table: ByteTable::new(covered_start, covered_bytes, LOG_BYTES_IN_CARD, 0),
        }
    }

    pub fn covers(&self, addr: Address) -> bool {
        self.table.covers(addr)
    }

    fn card_of(&self, addr: Address) -> usize {
        self.table.index_of(addr)
    }

    fn card_start(&self, card: usize) -> Address {
        self.table.range_start(card)
    }

    /// Record the cell `[start, end)`. Updates the entry of every card
    /// whose first word lies inside the cell.
    pub fn set_cell(&self, start: Address, end: Address) {
        debug_assert!(start < end);
        let first_card = self.card_of(start);
        let head_card = if self.card_start(first_card) == start {
            first_card
        } else {
            // The card holding `start` begins inside an earlier cell;
            // its entry belongs to that cell.
            first_card + 1
        };
        let last_card = self.card_of(end - 1usize);
        for card in head_card..=last_card {
            let distance_words = (self.card_start(card) - start) >> LOG_BYTES_IN_WORD;
            let entry: i8 = if distance_words <= MAX_DIRECT_OFFSET {
                distance_words as i8
            } else {
                // Step back towards the head by the largest power of
                // two not overshooting it.
                let cards_back = card - self.card_of(start);
                let k = usize::BITS as usize - 1 - cards_back.leading_zeros() as usize;
                -((k + 1) as i8)
            };
            self.table.set(card, entry as u8);
        }
    }

    /// Drop recorded cells for every card fully inside `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        let from = self.card_of(start);
        let to = self.card_of(end - 1usize);
        self.table.fill(from, to + 1, 0);
    }

    /// Start address of the cell overlapping the first word of `card`.
    pub fn cell_overlapping(&self, card: usize) -> Address {
        let mut c = card;
        loop {
            let e = self.table.get(c) as i8;
            if e >= 0 {
                return self.card_start(c) - ((e as usize) << LOG_BYTES_IN_WORD);
            }
            let step = 1usize << ((-e - 1) as usize);
            debug_assert!(step <= c, "first-object chain walked past table start");
            c -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn table() -> FirstObjectTable {
        let base = unsafe { Address::from_usize(0x80_0000) };
        FirstObjectTable::new(base, 256 * BYTES_IN_CARD)
    }

    #[test]
    fn small_cells_within_two_cards() {
        let t = table();
        let base = t.card_start(0);
        // Cell crossing from card 0 into card 1.
        let start = base + (BYTES_IN_CARD - 24);
        let end = base + BYTES_IN_CARD + 64usize;
        t.set_cell(start, end);
        assert_eq!(t.cell_overlapping(1), start);
        // A card-aligned cell records offset zero for its own card.
        let start2 = t.card_start(2);
        t.set_cell(start2, start2 + 32usize);
        assert_eq!(t.cell_overlapping(2), start2);
    }

    #[test]
    fn multi_card_cell_chains_back_to_head() {
        let t = table();
        let start = t.card_start(8) + 16usize;
        let end = t.card_start(40); // cell spans 32 cards
        t.set_cell(start, end);
        for card in [9, 10, 15, 23, 39] {
            assert_eq!(t.cell_overlapping(card), start, "card {card}");
        }
    }

    #[test]
    fn later_cell_overrides_covered_cards() {
        let t = table();
        let a = t.card_start(4);
        t.set_cell(a, a + 3 * BYTES_IN_CARD);
        let b = a + 3 * BYTES_IN_CARD;
        t.set_cell(b, b + BYTES_IN_CARD);
        assert_eq!(t.cell_overlapping(5), a);
        assert_eq!(t.cell_overlapping(7), b);
    }
}
