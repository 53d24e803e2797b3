//! Post-mark sweeping: reclaim white space into in-place free-chunk
//! lists and reclassify region states.

use crate::heap::free_chunk;
use crate::heap::region::{RegionId, RegionState};
use crate::heap::region_table::RegionTable;
use crate::util::Address;
use std::sync::Arc;

/// Consumer of sweep notifications produced by the color map's sweep
/// drivers. Notifications for one region are bracketed by
/// `begin_sweep`/`end_sweep` and arrive in ascending address order.
pub trait Sweeper {
    /// Advance to the next region to sweep; false when done.
    fn next_sweeping_region(&mut self) -> bool;
    fn begin_sweep(&mut self);
    fn end_sweep(&mut self);
    /// Called when the sweep stopped early because the rightmost live
    /// mark was passed; remaining regions are wholly dead.
    fn reached_rightmost_live_region(&mut self) {}

    fn start_of_sweeping_region(&self) -> Address;
    fn end_of_sweeping_region(&self) -> Address;
    /// Gaps smaller than this are dark matter, not reclaimed.
    fn min_reclaimable_space(&self) -> usize;

    /// Precise sweeping only: a live cell and its size.
    fn process_live_object(&mut self, cell: Address, size: usize) {
        let _ = (cell, size);
    }
    /// A reclaimable gap between two live cells.
    fn process_large_gap(&mut self, start: Address, end: Address);
    /// A reclaimable dead range at a region boundary.
    fn process_dead_space(&mut self, start: Address, size: usize);
    /// A sub-threshold gap, left in place.
    fn process_dark_matter(&mut self, start: Address, size: usize) {
        let _ = (start, size);
    }
    /// The whole sweeping region is free.
    fn process_dead_region(&mut self);
}

/// Outcome of sweeping one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweptRegion {
    pub id: RegionId,
    pub state: RegionState,
    pub free_bytes: usize,
    pub dark_matter_bytes: usize,
}

/// Sweeps a sequence of regions of a region table, accumulating each
/// region's reclaimed ranges as an in-place free-chunk list in
/// discovery order and classifying the region's resulting state:
/// no free bytes -> Full, entirely free -> Empty, otherwise ->
/// FreeChunks with the chunk list attached.
pub struct RegionSweeper {
    table: Arc<RegionTable>,
    regions: Vec<RegionId>,
    cursor: usize,
    min_reclaimable: usize,
    // Per-region accumulators.
    chunk_head: Address,
    chunk_tail: Address,
    free_bytes: usize,
    dark_matter_bytes: usize,
    whole_region_free: bool,
    // Totals across the sweep.
    outcomes: Vec<SweptRegion>,
}

impl RegionSweeper {
    /// `regions` must be in ascending id order.
    pub fn new(table: Arc<RegionTable>, regions: Vec<RegionId>, min_reclaimable: usize) -> Self {
        debug_assert!(regions.windows(2).all(|w| w[0] < w[1]));
        Self {
            table,
            regions,
            cursor: 0,
            min_reclaimable,
            chunk_head: Address::ZERO,
            chunk_tail: Address::ZERO,
            free_bytes: 0,
            dark_matter_bytes: 0,
            whole_region_free: false,
            outcomes: Vec::new(),
        }
    }

    fn current(&self) -> RegionId {
        self.regions[self.cursor - 1]
    }

    /// Per-region outcomes, ascending region order.
    pub fn outcomes(&self) -> &[SweptRegion] {
        &self.outcomes
    }

    pub fn total_free_bytes(&self) -> usize {
        self.outcomes.iter().map(|o| o.free_bytes).sum()
    }

    pub fn total_dark_matter_bytes(&self) -> usize {
        self.outcomes.iter().map(|o| o.dark_matter_bytes).sum()
    }

    fn record_free_range(&mut self, start: Address, size: usize) {
        debug_assert!(size >= self.min_reclaimable);
        unsafe {
            free_chunk::format(start, size);
            if self.chunk_tail.is_zero() {
                self.chunk_head = start;
            } else {
                free_chunk::set_next(self.chunk_tail, start);
            }
        }
        self.chunk_tail = start;
        self.free_bytes += size;
    }
}

impl Sweeper for RegionSweeper {
    fn next_sweeping_region(&mut self) -> bool {
        if self.cursor >= self.regions.len() {
            return false;
        }
        self.cursor += 1;
        true
    }

    fn begin_sweep(&mut self) {
        self.chunk_head = Address::ZERO;
        self.chunk_tail = Address::ZERO;
        self.free_bytes = 0;
        self.dark_matter_bytes = 0;
        self.whole_region_free = false;
    }

    fn end_sweep(&mut self) {
        let id = self.current();
        let info = self.table.region_info(id);
        let region_bytes = self.table.region_bytes();
        let state = if self.whole_region_free || self.free_bytes == region_bytes {
            info.set_state(RegionState::Empty);
            info.set_free_chunks(Address::ZERO, region_bytes);
            info.set_dark_matter(0);
            self.free_bytes = region_bytes;
            self.dark_matter_bytes = 0;
            RegionState::Empty
        } else if self.free_bytes == 0 {
            info.set_state(RegionState::Full);
            info.set_free_chunks(Address::ZERO, 0);
            info.set_dark_matter(self.dark_matter_bytes);
            RegionState::Full
        } else {
            info.set_state(RegionState::FreeChunks);
            info.set_free_chunks(self.chunk_head, self.free_bytes);
            info.set_dark_matter(self.dark_matter_bytes);
            RegionState::FreeChunks
        };
        self.outcomes.push(SweptRegion {
            id,
            state,
            free_bytes: self.free_bytes,
            dark_matter_bytes: self.dark_matter_bytes,
        });
    }

    fn reached_rightmost_live_region(&mut self) {
        // Everything after the rightmost live mark is wholly dead.
        while self.next_sweeping_region() {
            self.begin_sweep();
            self.process_dead_region();
            self.end_sweep();
        }
    }

    fn start_of_sweeping_region(&self) -> Address {
        self.table.region_start(self.current())
    }

    fn end_of_sweeping_region(&self) -> Address {
        self.table.region_end(self.current())
    }

    fn min_reclaimable_space(&self) -> usize {
        self.min_reclaimable
    }

    fn process_large_gap(&mut self, start: Address, end: Address) {
        self.record_free_range(start, end - start);
    }

    fn process_dead_space(&mut self, start: Address, size: usize) {
        self.record_free_range(start, size);
    }

    fn process_dark_matter(&mut self, start: Address, size: usize) {
        // Re-format so the region stays parsable over the dead words.
        unsafe { free_chunk::format_dead(start, size) };
        self.dark_matter_bytes += size;
    }

    fn process_dead_region(&mut self) {
        self.whole_region_free = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::marker::{HeapMarker, OverflowStrategy};
    use crate::object::testing::TestObjectModel;
    use crate::util::constants::BYTES_IN_WORD;
    use crate::util::memory::VirtualMemory;

    const REGION: usize = 1 << 16;
    const CELL: usize = 16 * BYTES_IN_WORD; // 128 bytes

    struct Fixture {
        _vm: VirtualMemory,
        base: Address,
        table: Arc<RegionTable>,
        marker: HeapMarker,
    }

    fn fixture(num_regions: usize) -> Fixture {
        let bytes = REGION * num_regions;
        let vm = VirtualMemory::reserve(bytes, REGION).unwrap();
        let base = vm.start();
        let table = Arc::new(RegionTable::new(base, REGION, num_regions));
        let marker = HeapMarker::new(
            base,
            bytes,
            Arc::new(TestObjectModel),
            64,
            OverflowStrategy::LinearRescan,
        );
        Fixture {
            _vm: vm,
            base,
            table,
            marker,
        }
    }

    /// Fill region 0 with cells, chain-link them so index list `live`
    /// is reachable from the first root, and mark.
    fn populate_and_mark(f: &mut Fixture, live: &[usize]) {
        let cells = REGION / CELL;
        for i in 0..cells {
            unsafe { TestObjectModel::format(f.base + i * CELL, CELL, &[]) };
        }
        let roots: Vec<Address> = live.iter().map(|&i| f.base + i * CELL).collect();
        f.table.region_info(0).set_state(RegionState::Allocating);
        f.table.region_info(0).to_full_state();
        f.marker.mark_all(&roots);
    }

    #[test]
    fn sweep_partial_region_accounts_free_and_dark() {
        let mut f = fixture(1);
        // Live cells 0..4 and 8, 9: the gap 4..8 (4 cells = 512B) is
        // reclaimable, the gap behind 9 is huge, and a one-cell gap at
        // 10 would be dark matter if below threshold.
        let live = [0, 1, 2, 3, 8, 9, 11];
        populate_and_mark(&mut f, &live);
        let min_reclaimable = 2 * CELL;
        let mut sweeper = RegionSweeper::new(f.table.clone(), vec![0], min_reclaimable);
        f.marker.sweep_regions(&mut sweeper);

        let outcome = sweeper.outcomes()[0];
        assert_eq!(outcome.state, RegionState::FreeChunks);
        // Gaps: [4,8) = 4 cells reclaimed; [10,11) = 1 cell dark;
        // tail after 11 reclaimed.
        let expected_free = 4 * CELL + (REGION - 12 * CELL);
        assert_eq!(outcome.free_bytes, expected_free);
        assert_eq!(outcome.dark_matter_bytes, CELL);
        let info = f.table.region_info(0);
        assert_eq!(info.state(), RegionState::FreeChunks);
        assert_eq!(unsafe { free_chunk::total_bytes(info.free_chunk_head()) }, expected_free);
        assert_eq!(info.free_bytes(), expected_free);
    }

    #[test]
    fn sweep_dead_region_becomes_empty() {
        let mut f = fixture(1);
        populate_and_mark(&mut f, &[]);
        let mut sweeper = RegionSweeper::new(f.table.clone(), vec![0], 2 * CELL);
        f.marker.sweep_regions(&mut sweeper);
        assert_eq!(sweeper.outcomes()[0].state, RegionState::Empty);
        assert_eq!(sweeper.outcomes()[0].free_bytes, REGION);
        assert_eq!(f.table.region_info(0).state(), RegionState::Empty);
    }

    #[test]
    fn sweep_saturated_region_stays_full() {
        let mut f = fixture(1);
        let cells = REGION / CELL;
        let live: Vec<usize> = (0..cells).collect();
        populate_and_mark(&mut f, &live);
        let mut sweeper = RegionSweeper::new(f.table.clone(), vec![0], 2 * CELL);
        f.marker.sweep_regions(&mut sweeper);
        assert_eq!(sweeper.outcomes()[0].state, RegionState::Full);
        assert_eq!(sweeper.outcomes()[0].free_bytes, 0);
        assert_eq!(f.table.region_info(0).state(), RegionState::Full);
    }

    #[test]
    fn precise_sweep_reports_every_live_cell() {
        struct Recorder {
            region: (Address, Address),
            live: Vec<(Address, usize)>,
        }
        impl Sweeper for Recorder {
            fn next_sweeping_region(&mut self) -> bool {
                false
            }
            fn begin_sweep(&mut self) {}
            fn end_sweep(&mut self) {}
            fn start_of_sweeping_region(&self) -> Address {
                self.region.0
            }
            fn end_of_sweeping_region(&self) -> Address {
                self.region.1
            }
            fn min_reclaimable_space(&self) -> usize {
                0
            }
            fn process_live_object(&mut self, cell: Address, size: usize) {
                self.live.push((cell, size));
            }
            fn process_large_gap(&mut self, _start: Address, _end: Address) {}
            fn process_dead_space(&mut self, _start: Address, _size: usize) {}
            fn process_dead_region(&mut self) {}
        }

        let mut f = fixture(1);
        let live = [0, 3, 7];
        populate_and_mark(&mut f, &live);
        let mut recorder = Recorder {
            region: (f.base, f.base + REGION),
            live: vec![],
        };
        f.marker.precise_sweep(&mut recorder);
        assert_eq!(
            recorder.live,
            vec![
                (f.base, CELL),
                (f.base + 3 * CELL, CELL),
                (f.base + 7 * CELL, CELL)
            ]
        );
    }

    #[test]
    fn regions_after_rightmost_live_are_emptied() {
        let mut f = fixture(3);
        // Only region 0 holds live data.
        let live = [0, 1];
        let cells = REGION / CELL;
        for r in 0..3 {
            for i in 0..cells {
                unsafe {
                    TestObjectModel::format(f.base + r * REGION + i * CELL, CELL, &[]);
                }
            }
            f.table.region_info(r).set_state(RegionState::Allocating);
            f.table.region_info(r).to_full_state();
        }
        let roots: Vec<Address> = live.iter().map(|&i| f.base + i * CELL).collect();
        f.marker.mark_all(&roots);
        let mut sweeper = RegionSweeper::new(f.table.clone(), vec![0, 1, 2], 2 * CELL);
        f.marker.sweep_regions(&mut sweeper);
        assert_eq!(sweeper.outcomes().len(), 3);
        assert_eq!(sweeper.outcomes()[1].state, RegionState::Empty);
        assert_eq!(sweeper.outcomes()[2].state, RegionState::Empty);
    }
}
