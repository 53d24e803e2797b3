//! Evacuation: copy live objects out of a source span into a
//! destination space through a private promotion buffer, rewriting
//! references via forwarding pointers.

use log::{debug, trace};
use std::sync::Arc;

use crate::alloc::refill::Span;
use crate::heap::free_chunk;
use crate::heap::card_table::CardTable;
use crate::heap::first_object_table::FirstObjectTable;
use crate::object::ObjectModel;
use crate::util::Address;

/// Supplies the evacuator's private promotion buffer.
pub trait EvacuationBufferProvider {
    /// A fresh buffer of at least `min` bytes, empty on exhaustion.
    fn refill_evacuation_buffer(&self, min: usize) -> Span;
    /// Take back the unused tail of the current buffer.
    fn retire_evacuation_buffer(&self, unused: Span);
}

pub struct Evacuator<'e> {
    object_model: Arc<dyn ObjectModel>,
    provider: &'e dyn EvacuationBufferProvider,
    card_table: Arc<CardTable>,
    fot: Arc<FirstObjectTable>,
    /// The span being emptied.
    source_start: Address,
    source_end: Address,
    /// Promotion buffer: allocated edge and limit.
    buffer_top: Address,
    buffer_limit: Address,
    /// Promoted cells whose references still need rewriting.
    scan_queue: Vec<Address>,
    promoted_bytes: usize,
}

impl<'e> Evacuator<'e> {
    pub fn new(
        object_model: Arc<dyn ObjectModel>,
        provider: &'e dyn EvacuationBufferProvider,
        card_table: Arc<CardTable>,
        fot: Arc<FirstObjectTable>,
        source_start: Address,
        source_end: Address,
    ) -> Self {
        Self {
            object_model,
            provider,
            card_table,
            fot,
            source_start,
            source_end,
            buffer_top: Address::ZERO,
            buffer_limit: Address::ZERO,
            scan_queue: Vec::new(),
            promoted_bytes: 0,
        }
    }

    pub fn promoted_bytes(&self) -> usize {
        self.promoted_bytes
    }

    fn in_source(&self, addr: Address) -> bool {
        addr >= self.source_start && addr < self.source_end
    }

    /// Evacuate everything live: `roots` are rewritten in place,
    /// `remembered_ranges` are the destination-space address ranges
    /// whose dirty cards may hold references into the source.
    pub fn evacuate(&mut self, roots: &mut [Address], remembered_ranges: &[(Address, Address)]) {
        for root in roots.iter_mut() {
            *root = self.evacuate_ref(*root);
        }
        for &(start, end) in remembered_ranges {
            self.scan_dirty_cards(start, end);
        }
        self.drain_scan_queue();
        self.finish();
        // With the source emptied and every reference rewritten, no
        // card derived from the source may stay dirty.
        self.card_table.clean_range(self.source_start, self.source_end);
        debug!(
            "evacuation done: {} bytes promoted out of [{}, {})",
            self.promoted_bytes, self.source_start, self.source_end
        );
    }

    /// Resolve one reference: copy the referent out of the source if
    /// this is its first visit, else follow its forwarding pointer.
    fn evacuate_ref(&mut self, cell: Address) -> Address {
        if !self.in_source(cell) {
            return cell;
        }
        if let Some(target) = self.object_model.forwarding_of(cell) {
            return target;
        }
        let size = self.object_model.size_of(cell);
        let target = self.allocate_in_buffer(size);
        if target.is_zero() {
            crate::fatal_error!("evacuation buffer exhausted promoting {size}B from {cell}");
        }
        unsafe {
            std::ptr::copy_nonoverlapping(cell.to_ptr::<u8>(), target.to_mut_ptr::<u8>(), size);
        }
        // Keep the destination parsable for dirty-card scans before
        // the promoted cell is ever reachable.
        self.fot.set_cell(target, target + size);
        self.object_model.forward_to(cell, target);
        self.promoted_bytes += size;
        self.scan_queue.push(target);
        trace!("promoted {cell} -> {target} ({size}B)");
        target
    }

    fn allocate_in_buffer(&mut self, size: usize) -> Address {
        if self.buffer_top.is_zero() || self.buffer_limit - self.buffer_top < size {
            self.retire_buffer();
            let span = self.provider.refill_evacuation_buffer(size);
            if span.is_empty() {
                return Address::ZERO;
            }
            self.buffer_top = span.start;
            self.buffer_limit = span.end();
        }
        let cell = self.buffer_top;
        self.buffer_top = cell + size;
        cell
    }

    fn retire_buffer(&mut self) {
        if !self.buffer_top.is_zero() && self.buffer_limit > self.buffer_top {
            let unused = Span::new(self.buffer_top, self.buffer_limit - self.buffer_top);
            // Parsability over the dead edge.
            if unused.size >= crate::util::constants::MIN_CELL_SIZE {
                unsafe { free_chunk::format(unused.start, unused.size) };
                self.fot.set_cell(unused.start, unused.end());
            } else {
                unsafe { free_chunk::format_dead(unused.start, unused.size) };
            }
            self.provider.retire_evacuation_buffer(unused);
        }
        self.buffer_top = Address::ZERO;
        self.buffer_limit = Address::ZERO;
    }

    fn drain_scan_queue(&mut self) {
        let om = self.object_model.clone();
        while let Some(cell) = self.scan_queue.pop() {
            om.update_references(cell, &mut |r| self.evacuate_ref(r));
        }
    }

    /// Walk the cells under every dirty card of `[start, end)` and
    /// rewrite their references. Cards overlapping the in-progress
    /// promotion buffer are special-cased: the open allocation edge is
    /// skipped rather than treated as a cell boundary, since it is not
    /// in a parsable state.
    fn scan_dirty_cards(&mut self, start: Address, end: Address) {
        let om = self.object_model.clone();
        let mut dirty_ranges: Vec<(Address, Address)> = Vec::new();
        self.card_table
            .visit_dirty_ranges(start, end, &mut |s, e| dirty_ranges.push((s, e)));
        for (range_start, range_end) in dirty_ranges {
            let mut cell = self.fot.cell_overlapping(self.card_table.card_of(range_start));
            while cell < range_end {
                if cell >= self.buffer_top && cell < self.buffer_limit {
                    // The evacuator's own allocation edge.
                    if self.buffer_limit >= range_end {
                        break;
                    }
                    cell = self.buffer_limit;
                    continue;
                }
                if unsafe { free_chunk::is_dead_cell(cell) } {
                    cell += unsafe { free_chunk::size_of(cell) };
                    continue;
                }
                let size = om.size_of(cell);
                om.update_references(cell, &mut |r| self.evacuate_ref(r));
                cell += size;
            }
            self.drain_scan_queue();
            self.card_table.clean_range(range_start, range_end);
        }
    }

    fn finish(&mut self) {
        self.retire_buffer();
        debug_assert!(self.scan_queue.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testing::TestObjectModel;
    use crate::util::constants::BYTES_IN_WORD;
    use crate::util::memory::VirtualMemory;
    use spin::Mutex;

    const REGION: usize = 1 << 16;
    const CELL: usize = 8 * BYTES_IN_WORD;

    /// Hands out one fixed destination span, recording retirement.
    struct OneSpan {
        span: Mutex<Option<Span>>,
        retired: Mutex<Vec<Span>>,
    }

    impl EvacuationBufferProvider for OneSpan {
        fn refill_evacuation_buffer(&self, _min: usize) -> Span {
            self.span.lock().take().unwrap_or(Span::EMPTY)
        }
        fn retire_evacuation_buffer(&self, unused: Span) {
            self.retired.lock().push(unused);
        }
    }

    #[test]
    fn evacuation_rewrites_roots_and_remembered_sets() {
        let vm = VirtualMemory::reserve(3 * REGION, REGION).unwrap();
        let base = vm.start();
        let om = Arc::new(TestObjectModel);
        let cards = Arc::new(CardTable::new(base, vm.size()));
        let fot = Arc::new(FirstObjectTable::new(base, vm.size()));

        // Source span: region 0 with a -> b and garbage g.
        let a = base;
        let b = base + CELL;
        let g = base + 2 * CELL;
        unsafe {
            TestObjectModel::format(a, CELL, &[b]);
            TestObjectModel::format(b, CELL, &[]);
            TestObjectModel::format(g, CELL, &[]);
            free_chunk::format(base + 3 * CELL, REGION - 3 * CELL);
        }

        // Old space: region 1 holds o -> b, with its card dirtied by
        // the write barrier.
        let old_start = base + REGION;
        let old_end = old_start + REGION;
        unsafe {
            TestObjectModel::format(old_start, CELL, &[b]);
            free_chunk::format(old_start + CELL, REGION - CELL);
        }
        fot.set_cell(old_start, old_start + CELL);
        fot.set_cell(old_start + CELL, old_end);
        cards.dirty(old_start);

        // Destination: region 2.
        let dest = base + 2 * REGION;
        let buffers = OneSpan {
            span: Mutex::new(Some(Span::new(dest, REGION))),
            retired: Mutex::new(vec![]),
        };
        let mut evacuator = Evacuator::new(
            om.clone(),
            &buffers,
            cards.clone(),
            fot.clone(),
            base,
            base + REGION,
        );
        let mut roots = [a];
        evacuator.evacuate(&mut roots, &[(old_start, old_end)]);

        // Both live objects moved, the garbage did not.
        assert_eq!(evacuator.promoted_bytes(), 2 * CELL);
        let new_a = roots[0];
        assert!(new_a >= dest && new_a < dest + REGION);
        let new_b = om.forwarding_of(b).expect("b must be forwarded");
        assert!(om.forwarding_of(g).is_none(), "garbage must not move");
        // a's reference slot now points at the new b.
        let slot: Address = unsafe { (new_a + 2 * BYTES_IN_WORD).load() };
        assert_eq!(slot, new_b);
        // The remembered old-space reference was rewritten too.
        let old_slot: Address = unsafe { (old_start + 2 * BYTES_IN_WORD).load() };
        assert_eq!(old_slot, new_b);
        // Promoted cells are recorded in the first-object table.
        assert_eq!(fot.cell_overlapping(cards.card_of(new_a)), new_a);
        // Cards of the scanned range and the source are clean again.
        assert_eq!(cards.first_dirty(0, cards.num_cards()), None);
        // The unused buffer tail came back to the provider, formatted.
        let retired = buffers.retired.lock();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].start, dest + 2 * CELL);
        assert!(unsafe { free_chunk::is_dead_cell(retired[0].start) });
    }

    #[test]
    fn dirty_card_scan_skips_the_open_allocation_edge() {
        let vm = VirtualMemory::reserve(2 * REGION, REGION).unwrap();
        let base = vm.start();
        let om = Arc::new(TestObjectModel);
        let cards = Arc::new(CardTable::new(base, vm.size()));
        let fot = Arc::new(FirstObjectTable::new(base, vm.size()));

        // Source object in region 0.
        let src = base;
        unsafe {
            TestObjectModel::format(src, CELL, &[]);
            free_chunk::format(base + CELL, REGION - CELL);
        }

        // Destination region 1 doubles as remembered space: its dirty
        // cards overlap the promotion buffer itself.
        let dest = base + REGION;
        let dest_end = dest + REGION;
        unsafe {
            TestObjectModel::format(dest, CELL, &[src]);
        }
        fot.set_cell(dest, dest + CELL);
        cards.dirty(dest);
        let buffers = OneSpan {
            span: Mutex::new(Some(Span::new(dest + CELL, REGION - CELL))),
            retired: Mutex::new(vec![]),
        };
        let mut evacuator = Evacuator::new(
            om.clone(),
            &buffers,
            cards.clone(),
            fot.clone(),
            base,
            base + REGION,
        );
        // No roots: the only path to `src` is the remembered set, and
        // the promoted copy lands right behind the scanned cell.
        evacuator.evacuate(&mut [], &[(dest, dest_end)]);
        let new_src = om.forwarding_of(src).expect("src promoted");
        assert_eq!(new_src, dest + CELL);
        let slot: Address = unsafe { (dest + 2 * BYTES_IN_WORD).load() };
        assert_eq!(slot, new_src);
    }
}
