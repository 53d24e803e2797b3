//! Card-space allocation: bump allocation that maintains the
//! first-object table for every allocated span, so dirty-card scans
//! can find cell boundaries before the cell is ever used.

use std::sync::Arc;

use crate::alloc::bump::BumpAllocator;
use crate::alloc::refill::{Refiller, Span};
use crate::heap::first_object_table::FirstObjectTable;
use crate::util::Address;

pub struct CardSpaceAllocator<R: Refiller> {
    bump: BumpAllocator<R>,
    fot: Arc<FirstObjectTable>,
}

impl<R: Refiller> CardSpaceAllocator<R> {
    pub fn new(refiller: R, fot: Arc<FirstObjectTable>) -> Self {
        Self {
            bump: BumpAllocator::new(refiller),
            fot,
        }
    }

    pub fn bump(&self) -> &BumpAllocator<R> {
        &self.bump
    }

    /// Allocate and record the cell in the first-object table before
    /// returning it.
    pub fn allocate(&self, size: usize) -> Address {
        let cell = self.bump.allocate(size);
        if !cell.is_zero() {
            self.fot.set_cell(cell, cell + size);
        }
        cell
    }

    pub fn reset(&self, span: Span) {
        self.bump.reset(span);
    }

    pub fn retire(&self) -> Span {
        self.bump.retire()
    }

    /// The open allocation edge, for evacuators that must not treat
    /// the in-progress buffer as parsable.
    pub fn allocation_edge(&self) -> Address {
        self.bump.top()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;
    use crate::util::memory::VirtualMemory;

    struct NoRefill;
    impl Refiller for NoRefill {
        fn should_refill(&self, _r: usize, _l: usize) -> bool {
            true
        }
        fn refill(&self, _requested: usize, _a: Address, _s: usize) -> Span {
            Span::EMPTY
        }
        fn allocate_overflow(&self, _size: usize) -> Address {
            Address::ZERO
        }
        fn allocate_large(&self, _size: usize) -> Address {
            Address::ZERO
        }
    }

    #[test]
    fn allocation_updates_first_object_table() {
        let vm = VirtualMemory::reserve(16 * BYTES_IN_CARD, BYTES_IN_CARD).unwrap();
        let fot = Arc::new(FirstObjectTable::new(vm.start(), vm.size()));
        let a = CardSpaceAllocator::new(NoRefill, fot.clone());
        a.reset(Span::new(vm.start(), vm.size()));
        // Allocate a cell crossing cards 0..3.
        let big = a.allocate(3 * BYTES_IN_CARD);
        assert_eq!(big, vm.start());
        let small = a.allocate(64);
        assert_eq!(fot.cell_overlapping(1), big);
        assert_eq!(fot.cell_overlapping(2), big);
        // Card 3's first word belongs to `small`.
        assert_eq!(fot.cell_overlapping(3), small);
    }
}
