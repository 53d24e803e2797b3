//! Post-collection heap verification. Any inconsistency is fatal:
//! a GC bug left undetected corrupts all subsequent execution
//! invisibly, so nothing here is ever swallowed.

use std::sync::Arc;

use crate::heap::card_table::CardTable;
use crate::heap::free_chunk;
use crate::heap::region::{flags, RegionState};
use crate::heap::region_table::RegionTable;
use crate::mark::color_map::ColorMap;
use crate::object::ObjectModel;
use crate::space::mark_sweep_space::{ACCOUNT_LARGE, ACCOUNT_SMALL};
use crate::util::Address;

/// Byte counters reported by a passing verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub dark_matter_bytes: usize,
}

pub struct HeapVerifier {
    table: Arc<RegionTable>,
    object_model: Arc<dyn ObjectModel>,
}

impl HeapVerifier {
    pub fn new(table: Arc<RegionTable>, object_model: Arc<dyn ObjectModel>) -> Self {
        Self {
            table,
            object_model,
        }
    }

    /// Re-walk the heap right after a collection: check black closure,
    /// free-list consistency and card cleanliness, and produce byte
    /// counters. Runs with mutators stopped and allocators retired.
    pub fn run(&self, color_map: &ColorMap, card_table: Option<&CardTable>) -> VerifyOutcome {
        let mut outcome = VerifyOutcome::default();
        for (id, info) in self.table.iter_infos() {
            match info.owner() {
                ACCOUNT_SMALL => {
                    if info.is(flags::ITERABLE) {
                        self.verify_small_region(id, color_map, &mut outcome);
                    }
                }
                ACCOUNT_LARGE => {
                    if info.state() == RegionState::LargeHead {
                        self.verify_large_head(id, color_map, &mut outcome);
                    }
                }
                _ => {}
            }
        }
        if let Some(cards) = card_table {
            self.verify_cards_clean(cards);
        }
        outcome
    }

    /// Walk every cell of a parsable small-space region, checking that
    /// live cells are black with black-closed references, and that the
    /// region's free-chunk accounting matches what is actually there.
    fn verify_small_region(&self, id: usize, color_map: &ColorMap, outcome: &mut VerifyOutcome) {
        let info = self.table.region_info(id);
        let start = self.table.region_start(id);
        let end = self.table.region_end(id);
        let listed_free = unsafe { free_chunk::total_bytes(info.free_chunk_head()) };
        if listed_free != info.free_bytes() {
            crate::fatal_error!(
                "region {id}: free list holds {listed_free}B but accounting says {}B",
                info.free_bytes()
            );
        }
        let mut walked_dead = 0;
        let mut cell = start;
        while cell < end {
            if unsafe { free_chunk::is_dead_cell(cell) } {
                let size = unsafe { free_chunk::size_of(cell) };
                walked_dead += size;
                cell += size;
                continue;
            }
            let size = self.object_model.size_of(cell);
            self.verify_live_cell(cell, color_map);
            outcome.live_bytes += size;
            cell += size;
        }
        if walked_dead < info.free_bytes() + info.dark_matter_bytes() {
            crate::fatal_error!(
                "region {id}: walked {walked_dead}B dead but accounting says {}B free + {}B dark",
                info.free_bytes(),
                info.dark_matter_bytes()
            );
        }
        outcome.free_bytes += info.free_bytes();
        outcome.dark_matter_bytes += walked_dead - info.free_bytes();
    }

    fn verify_large_head(&self, id: usize, color_map: &ColorMap, outcome: &mut VerifyOutcome) {
        let block = self.table.region_start(id);
        let cell = crate::space::large_object_space::LargeObjectSpace::cell_of_block(block);
        self.verify_live_cell(cell, color_map);
        outcome.live_bytes += self.object_model.size_of(cell);
    }

    /// A cell surviving a collection must be black, and no black cell
    /// may reference a white one (tricolor closure).
    fn verify_live_cell(&self, cell: Address, color_map: &ColorMap) {
        let bit = color_map.bit_index_of(cell);
        if color_map.is_white(bit) {
            crate::fatal_error!("white cell {cell} survived sweeping");
        }
        if color_map.is_grey(bit) {
            crate::fatal_error!("grey cell {cell} after marking completed");
        }
        self.object_model.for_each_reference(cell, &mut |r| {
            if color_map.is_covered(r) && color_map.is_white(color_map.bit_index_of(r)) {
                crate::fatal_error!("black cell {cell} references white cell {r}");
            }
        });
    }

    /// With mutators stopped and the collection finished, no card may
    /// be dirty.
    fn verify_cards_clean(&self, cards: &CardTable) {
        if let Some(card) = cards.first_dirty(0, cards.num_cards()) {
            crate::fatal_error!(
                "dirty card {card} (covering {}) after collection",
                cards.card_start(card)
            );
        }
    }
}
