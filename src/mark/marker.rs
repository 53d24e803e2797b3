//! The tracing engine: forward-scan finger marking over the tricolor
//! bitmap, with a bounded marking stack and two overflow-recovery
//! strategies.
//!
//! Marking discipline: a reference to a covered white cell *after* the
//! finger is greyed in the bitmap only — the forward scan will reach
//! it. A reference *at or before* the finger has already been passed,
//! so it is greyed and pushed for out-of-band revisiting. The stack is
//! bounded; when it fills, recovery either linearly rescans the bitmap
//! between the leftmost flushed mark and the finger, or drains the
//! intervals named by the rescan map. Either way no grey mark is ever
//! lost, and revisiting an already-black cell is a no-op.

use log::trace;

use crate::heap::free_chunk;
use crate::heap::region_table::{RegionRange, RegionTable};
use crate::mark::color_map::ColorMap;
use crate::mark::marking_stack::MarkingStack;
use crate::mark::rescan_map::RescanMap;
use crate::object::ObjectModel;
use crate::sweep::Sweeper;
use crate::util::constants::{LOG_BITS_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;
use std::sync::Arc;

/// How to recover when the marking stack overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Flush, then linearly rescan the color map from the leftmost
    /// flushed mark up to the finger until a fixed point.
    LinearRescan,
    /// Flush into a rescan map and revisit only the recorded
    /// bitmap-word intervals, in increasing address order.
    RescanMap,
}

/// Which references a root visitor treats as in-heap. The owner variant
/// restricts marking to regions of one heap account.
#[derive(Clone)]
pub enum Coverage {
    Always,
    Owner { table: Arc<RegionTable>, owner: u8 },
}

impl Coverage {
    fn admits(&self, cell: Address) -> bool {
        match self {
            Coverage::Always => true,
            Coverage::Owner { table, owner } => {
                table.contains(cell) && table.region_info(table.region_of(cell)).owner() == *owner
            }
        }
    }
}

pub struct HeapMarker {
    color_map: ColorMap,
    stack: MarkingStack,
    strategy: OverflowStrategy,
    rescan_map: RescanMap,
    object_model: Arc<dyn ObjectModel>,
    coverage: Coverage,
    /// Current scan position: the cell being visited.
    finger: Address,
    /// Rightmost grey mark ever made past the finger.
    rightmost: Address,
    recovering: bool,
    /// Upper bound of the running recovery scan (the finger at the
    /// moment of overflow).
    recovery_bound: Address,
    /// During linear-rescan recovery: left bound for the next recovery
    /// pass, tightened by nested flushes.
    next_recovery_start: Address,
    overflow_count: usize,
}

impl HeapMarker {
    pub fn new(
        covered_start: Address,
        covered_bytes: usize,
        object_model: Arc<dyn ObjectModel>,
        stack_capacity: usize,
        strategy: OverflowStrategy,
    ) -> Self {
        let color_map = ColorMap::new(covered_start, covered_bytes);
        let rescan_map = RescanMap::new(color_map.num_words());
        Self {
            color_map,
            stack: MarkingStack::new(stack_capacity),
            strategy,
            rescan_map,
            object_model,
            coverage: Coverage::Always,
            finger: Address::ZERO,
            rightmost: Address::ZERO,
            recovering: false,
            recovery_bound: Address::ZERO,
            next_recovery_start: Address::ZERO,
            overflow_count: 0,
        }
    }

    pub fn set_coverage(&mut self, coverage: Coverage) {
        self.coverage = coverage;
    }

    pub fn color_map(&self) -> &ColorMap {
        &self.color_map
    }

    /// Number of overflow recoveries during the last mark.
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Rightmost live cell found by the last mark, zero when nothing
    /// was marked.
    pub fn rightmost(&self) -> Address {
        self.rightmost
    }

    pub fn is_covered(&self, cell: Address) -> bool {
        self.color_map.is_covered(cell) && self.coverage.admits(cell)
    }

    /// Is the cell reachable according to the current mark state?
    pub fn is_live(&self, cell: Address) -> bool {
        !self.color_map.is_white(self.color_map.bit_index_of(cell))
    }

    /// Concurrent greying hook for mutator write barriers: atomically
    /// grey a covered white cell while marking is in progress. Races
    /// between mutators are resolved by the bitmap's compare-exchange;
    /// the collector picks the mark up on its next pass over the word.
    /// Returns whether this call turned the cell grey.
    pub fn mark_grey_concurrent(&self, cell: Address) -> bool {
        if !self.color_map.is_covered(cell) {
            return false;
        }
        self.color_map
            .mark_grey_if_white_atomic(self.color_map.bit_index_of(cell))
    }

    fn word_index_of_unclamped(&self, addr: Address) -> usize {
        ((addr - self.color_map.covered_start()) >> LOG_BYTES_IN_WORD) >> LOG_BITS_IN_WORD
    }

    /// Bitmap word holding the mark of the rightmost visited cell's
    /// last granule, the forward scan's stop line.
    fn rightmost_word_index(&self) -> usize {
        if self.rightmost.is_zero() {
            return 0;
        }
        let end = self.rightmost + self.object_model.size_of(self.rightmost);
        self.word_index_of_unclamped(end - 1usize)
    }

    // Grey marking.

    fn mark_object_grey(&mut self, cell: Address) {
        if !self.is_covered(cell) {
            return;
        }
        let bit = self.color_map.bit_index_of(cell);
        if cell > self.finger {
            if !self.color_map.mark_grey_if_white(bit) {
                return;
            }
            if *crate::args::TRACE_MARKING {
                trace!("#mark G {cell} (ahead of finger {})", self.finger);
            }
            if self.recovering && cell <= self.recovery_bound {
                // The outer scan already passed this mark and the
                // recovery scan may be past it too; remember it so the
                // recovery loop comes back for it.
                match self.strategy {
                    OverflowStrategy::RescanMap => self
                        .rescan_map
                        .record_cell(self.color_map.word_index_of(cell)),
                    OverflowStrategy::LinearRescan => {
                        if cell < self.next_recovery_start {
                            self.next_recovery_start = cell;
                        }
                    }
                }
            } else if cell > self.rightmost {
                self.rightmost = cell;
            }
        } else if self.color_map.mark_grey_if_white(bit) {
            if *crate::args::TRACE_MARKING {
                trace!("#mark G {cell} (behind finger {})", self.finger);
            }
            self.push_for_revisit(cell);
        }
    }

    fn push_for_revisit(&mut self, cell: Address) {
        if self.stack.try_push(cell) {
            return;
        }
        self.recover_from_overflow();
        let pushed = self.stack.try_push(cell);
        debug_assert!(pushed, "marking stack full right after overflow recovery");
    }

    // Cell visiting.

    /// Trace the cell's references, then blacken it. Does not move the
    /// finger. Returns the end of the cell.
    fn visit_cell_refs(&mut self, cell: Address) -> Address {
        debug_assert!(
            !unsafe { free_chunk::is_dead_cell(cell) },
            "must never mark dead space at {cell}"
        );
        let om = self.object_model.clone();
        let descriptor = om.descriptor_of(cell);
        if !descriptor.is_zero() {
            self.mark_object_grey(descriptor);
        }
        om.for_each_reference(cell, &mut |r| self.mark_object_grey(r));
        self.color_map
            .mark_black_from_grey(self.color_map.bit_index_of(cell));
        cell + om.size_of(cell)
    }

    /// Forward-scan visit: advance the finger to the cell, then trace.
    fn visit_grey_cell_at_finger(&mut self, cell: Address) -> Address {
        self.finger = cell;
        self.visit_cell_refs(cell)
    }

    /// Popped cells may have been visited already through the bitmap;
    /// revisiting a black cell must be a no-op, so filter them here.
    fn visit_popped_cell(&mut self, cell: Address) {
        let bit = self.color_map.bit_index_of(cell);
        if self.color_map.is_black_when_not_white(bit) {
            return;
        }
        self.visit_cell_refs(cell);
    }

    // Overflow recovery.

    fn recover_from_overflow(&mut self) {
        self.overflow_count += 1;
        match self.strategy {
            OverflowStrategy::LinearRescan => self.recover_linear(),
            OverflowStrategy::RescanMap => self.recover_with_rescan_map(),
        }
    }

    /// Flush the stack, remembering the leftmost flushed mark, then
    /// rescan [leftmost, finger) until no flush lands below the last
    /// recovery start. Flushed entries stay grey in the bitmap, which
    /// is what makes the blind flush safe.
    fn recover_linear(&mut self) {
        let mut leftmost = self.finger;
        self.stack.flush(&mut |cell| {
            if cell < leftmost {
                leftmost = cell;
            }
        });
        if self.recovering {
            // Nested overflow: only tighten the next pass's start.
            if leftmost < self.next_recovery_start {
                self.next_recovery_start = leftmost;
            }
            return;
        }
        self.recovering = true;
        let bound = self.finger;
        self.recovery_bound = bound;
        let mut start = leftmost;
        loop {
            while start < bound {
                self.next_recovery_start = bound;
                self.scan_range_for_grey(start, bound);
                start = self.next_recovery_start;
            }
            // Entries pushed while rescanning are grey marks behind
            // the recovery cursor; visiting them may uncover more.
            self.next_recovery_start = bound;
            while let Some(cell) = self.stack.pop() {
                self.visit_popped_cell(cell);
            }
            start = self.next_recovery_start;
            if start >= bound {
                break;
            }
        }
        self.finger = bound;
        self.recovering = false;
    }

    /// Flush the stack into the rescan map, then drain recorded
    /// bitmap-word intervals in increasing address order. Cheaper than
    /// a linear rescan when grey marks are sparse. Grey marks made
    /// between the recovery scan position and the overflow finger are
    /// re-recorded by [`HeapMarker::mark_object_grey`].
    fn recover_with_rescan_map(&mut self) {
        {
            let color_map = &self.color_map;
            let rescan_map = &mut self.rescan_map;
            self.stack.flush(&mut |cell| {
                rescan_map.record_cell(color_map.word_index_of(cell));
            });
        }
        if self.recovering {
            return;
        }
        self.recovering = true;
        let bound = self.finger;
        self.recovery_bound = bound;
        let bound_bit = self.color_map.bit_index_of(bound) + 1;
        loop {
            while let Some((from_word, to_word)) = self.rescan_map.take_next_range() {
                self.scan_words_for_grey(from_word, to_word - 1, bound_bit);
            }
            while let Some(cell) = self.stack.pop() {
                self.visit_popped_cell(cell);
            }
            if self.rescan_map.is_empty() && self.stack.is_empty() {
                break;
            }
        }
        self.finger = bound;
        self.recovering = false;
    }

    /// Visit every grey mark in `[start, end)`, address order.
    fn scan_range_for_grey(&mut self, start: Address, end: Address) {
        let end_bit = self.color_map.bit_index_of(end - 1usize) + 1;
        let from_word = self.color_map.word_index_of(start);
        let to_word = self.color_map.word_index(end_bit - 1);
        self.scan_words_for_grey(from_word, to_word, end_bit);
    }

    fn scan_words_for_grey(&mut self, from_word: usize, to_word: usize, limit_bit: usize) {
        let mut wi = from_word;
        while let Some(bit) = self.color_map.first_grey_in_words(wi, to_word, limit_bit) {
            let cell = self.color_map.address_of(bit);
            self.visit_grey_cell_at_finger(cell);
            // The visited cell is black now; rescanning its word finds
            // the next grey, including any planted by the visit.
            wi = self.color_map.word_index(bit);
        }
    }

    // Root marking.

    /// Mark external roots grey. Runs before bitmap scanning; there are
    /// no black marks yet, so greying is unconditional-if-white.
    pub fn mark_roots(&mut self, roots: &[Address]) {
        for &root in roots {
            if !self.is_covered(root) {
                continue;
            }
            let bit = self.color_map.bit_index_of(root);
            if self.color_map.mark_grey_if_white(bit) && root > self.rightmost {
                self.rightmost = root;
            }
        }
    }

    /// Mark grey everything referenced from boot-region cells living
    /// outside the covered area (boot objects are permanent roots).
    pub fn mark_boot_cells(&mut self, boot_cells: &[Address]) {
        let om = self.object_model.clone();
        for &cell in boot_cells {
            debug_assert!(!self.color_map.is_covered(cell));
            om.for_each_reference(cell, &mut |r| self.mark_object_grey(r));
        }
    }

    // Forward scan.

    /// Trace to fixpoint: forward-scan the color map from the finger,
    /// visiting every grey cell, then drain the marking stack; repeat
    /// until neither pass finds work.
    pub fn visit_grey_objects(&mut self) {
        loop {
            let bound_word = self.rightmost_word_index();
            self.scan_forward_to(self.scan_start_word(), bound_word);
            let mut visited_any = false;
            while let Some(cell) = self.stack.pop() {
                self.visit_popped_cell(cell);
                visited_any = true;
            }
            if !visited_any && self.rightmost_word_index() <= bound_word {
                break;
            }
        }
        debug_assert!(self.stack.is_empty());
    }

    /// Range-restricted variant: only visit grey objects inside the
    /// given region ranges (the heap is a set of region spans, not one
    /// contiguous run). Ranges must be in ascending address order.
    pub fn visit_grey_objects_in_ranges(&mut self, table: &RegionTable, ranges: &[RegionRange]) {
        let log2_region_to_word = table.log2_region_bytes() - LOG_BYTES_IN_WORD - LOG_BITS_IN_WORD;
        for range in ranges {
            let range_first_word = range.first << log2_region_to_word;
            let range_last_word = ((range.first + range.count) << log2_region_to_word) - 1;
            if self.scan_start_word() > range_last_word {
                // The finger already passed this range. This happens
                // when root marking left the leftmost mark beyond it.
                continue;
            }
            loop {
                let bound_word = self.rightmost_word_index().min(range_last_word);
                let from_word = self.scan_start_word().max(range_first_word);
                self.scan_forward_to(from_word, bound_word);
                let mut visited_any = false;
                while let Some(cell) = self.stack.pop() {
                    self.visit_popped_cell(cell);
                    visited_any = true;
                }
                if visited_any {
                    continue;
                }
                if self.rightmost_word_index().min(range_last_word) <= bound_word {
                    break;
                }
            }
        }
        debug_assert!(self.stack.is_empty());
    }

    fn scan_start_word(&self) -> usize {
        self.word_index_of_unclamped(self.finger.max(self.color_map.covered_start()))
    }

    fn scan_forward_to(&mut self, from_word: usize, bound_word: usize) {
        if self.rightmost.is_zero() {
            return;
        }
        let mut wi = from_word;
        while wi <= bound_word && wi < self.color_map.num_words() {
            match self.color_map.first_grey_in_words(wi, wi, usize::MAX) {
                Some(bit) => {
                    let cell = self.color_map.address_of(bit);
                    let end = self.visit_grey_cell_at_finger(cell);
                    let next_wi = self.word_index_of_unclamped(end - 1usize);
                    wi = next_wi.max(self.color_map.word_index(bit));
                }
                None => wi += 1,
            }
        }
    }

    // Whole-cycle driver.

    /// Run a complete mark: clear the map, mark roots, trace to
    /// fixpoint. On return every reachable cell is black and every
    /// unreachable cell is white.
    pub fn mark_all(&mut self, roots: &[Address]) {
        self.begin_mark();
        self.mark_roots(roots);
        self.visit_grey_objects();
        self.finish_mark();
    }

    /// Range-restricted whole-cycle driver.
    pub fn mark_all_in_ranges(
        &mut self,
        roots: &[Address],
        table: &RegionTable,
        ranges: &[RegionRange],
    ) {
        self.begin_mark();
        self.mark_roots(roots);
        self.visit_grey_objects_in_ranges(table, ranges);
        self.finish_mark();
    }

    fn begin_mark(&mut self) {
        if !self.stack.is_empty() {
            crate::fatal_error!("marking stack must be empty before marking");
        }
        self.color_map.clear();
        self.rescan_map.reset();
        self.finger = Address::ZERO;
        self.rightmost = Address::ZERO;
        self.overflow_count = 0;
        self.recovering = false;
    }

    fn finish_mark(&mut self) {
        if !self.stack.is_empty() {
            crate::fatal_error!("marking stack must be empty after marking");
        }
        if *crate::args::VERIFY_AFTER_MARKING && !self.rightmost.is_zero() {
            let end = self.rightmost + self.object_model.size_of(self.rightmost);
            self.color_map
                .verify_no_grey(self.color_map.covered_start(), end);
        }
    }

    // Sweeping drivers. The bitmap owns the mark geometry, so the
    // sweep loops live here and feed a Sweeper with notifications.

    /// Precise sweep: report every live cell in the sweeping region,
    /// with its size.
    pub fn precise_sweep(&mut self, sweeper: &mut dyn Sweeper) {
        let start = sweeper.start_of_sweeping_region();
        let end = sweeper.end_of_sweeping_region();
        let from_bit = self.color_map.bit_index_of(start);
        let to_bit = self.color_map.bit_index_of(end - 1usize) + 1;
        let mut bit = from_bit;
        while let Some(live) = self.color_map.first_black_mark(bit, to_bit) {
            let cell = self.color_map.address_of(live);
            let size = self.object_model.size_of(cell);
            sweeper.process_live_object(cell, size);
            if cell + size >= end {
                break;
            }
            bit = self.color_map.bit_index_of(cell + size - 1usize) + 1;
        }
    }

    /// Imprecise sweep of one region: report only dead gaps of at
    /// least `min_reclaimable_space` between live cells; smaller gaps
    /// are reported as dark matter and stay in place.
    pub fn imprecise_sweep(&mut self, sweeper: &mut dyn Sweeper) {
        let region_start = sweeper.start_of_sweeping_region();
        let region_end = sweeper.end_of_sweeping_region();
        let min_reclaimable = sweeper.min_reclaimable_space();

        let leftmost_bit = self.color_map.bit_index_of(region_start);
        let rightmost_bit = self.color_map.bit_index_of(region_end - 1usize) + 1;
        let Some(first_live) = self.color_map.first_black_mark(leftmost_bit, rightmost_bit) else {
            sweeper.process_dead_region();
            return;
        };
        let mut last_live = first_live;
        {
            let gap = (first_live - leftmost_bit) << LOG_BYTES_IN_WORD;
            if gap >= min_reclaimable {
                sweeper.process_dead_space(region_start, gap);
            } else if gap > 0 {
                sweeper.process_dark_matter(region_start, gap);
            }
        }
        loop {
            let left_cell = self.color_map.address_of(last_live);
            let left_end = left_cell + self.object_model.size_of(left_cell);
            if left_end >= region_end {
                return;
            }
            let left_end_bit = self.color_map.bit_index_of(left_end - 1usize) + 1;
            match self.color_map.first_black_mark(left_end_bit, rightmost_bit) {
                Some(next_live) => {
                    let right_cell = self.color_map.address_of(next_live);
                    let gap = right_cell - left_end;
                    if gap >= min_reclaimable {
                        sweeper.process_large_gap(left_end, right_cell);
                    } else if gap > 0 {
                        sweeper.process_dark_matter(left_end, gap);
                    }
                    last_live = next_live;
                }
                None => break,
            }
        }
        // Tail space after the last live cell of the region.
        let tail_cell = self.color_map.address_of(last_live);
        let tail = tail_cell + self.object_model.size_of(tail_cell);
        if region_end > tail {
            let tail_space = region_end - tail;
            if tail_space >= min_reclaimable {
                sweeper.process_dead_space(tail, tail_space);
            } else {
                sweeper.process_dark_matter(tail, tail_space);
            }
        }
    }

    /// Sweep the sweeper's sequence of regions, stopping after the
    /// region holding the rightmost live mark.
    pub fn sweep_regions(&mut self, sweeper: &mut dyn Sweeper) {
        let rightmost = self.rightmost;
        while sweeper.next_sweeping_region() {
            sweeper.begin_sweep();
            self.imprecise_sweep(sweeper);
            sweeper.end_sweep();
            if !rightmost.is_zero() && sweeper.end_of_sweeping_region() > rightmost {
                sweeper.reached_rightmost_live_region();
                return;
            }
        }
    }
}
