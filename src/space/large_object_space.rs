//! Large-object space: objects spanning whole regions, managed as
//! boundary-tagged blocks so a freed block coalesces with free
//! neighbours in O(1), without scanning any list.
//!
//! Block layout over a run of contiguous regions:
//!
//! ```text
//! +--------+--------+----------------------------------+--------+
//! | tag    | link   | object cell ... (tail free room) | tag    |
//! +--------+--------+----------------------------------+--------+
//!  word 0   word 1                                       last word
//! ```
//!
//! The tag word encodes the block size plus FREE and LISTED bits; it is
//! duplicated in the block's last word (the suffix tag) so the block
//! after it can find its neighbour's head without any lookup. Free
//! blocks additionally keep a back link for O(1) unlinking.

use crossbeam_queue::SegQueue;
use log::debug;
use spin::Mutex;
use std::ops::Add;
use std::sync::Arc;

use crate::alloc::refill::Span;
use crate::heap::free_chunk;
use crate::heap::region::{RegionId, RegionState};
use crate::heap::region_table::RegionTable;
use crate::mark::color_map::ColorMap;
use crate::object::ObjectModel;
use crate::space::mark_sweep_space::{RegionProvider, ACCOUNT_LARGE};
use crate::util::constants::{BYTES_IN_WORD, MIN_CELL_SIZE};
use crate::util::Address;

const FREE: usize = 0b01;
const LISTED: usize = 0b10;
const TAG_MASK: usize = 0b111;

/// Words consumed by header (tag + link) before the object cell.
const HEADER_BYTES: usize = 2 * BYTES_IN_WORD;
/// The suffix tag word at the block's end.
const FOOTER_BYTES: usize = BYTES_IN_WORD;

// The audited raw accessors for block tags.

unsafe fn write_tags(block: Address, size: usize, bits: usize) {
    debug_assert!(size % BYTES_IN_WORD == 0);
    block.store(size | bits);
    (block + size - FOOTER_BYTES).store(size | bits);
}

unsafe fn tag_at(addr: Address) -> usize {
    addr.load::<usize>()
}

unsafe fn block_size(block: Address) -> usize {
    tag_at(block) & !TAG_MASK
}

unsafe fn is_free_tag(tag: usize) -> bool {
    tag & FREE != 0
}

unsafe fn next_of(block: Address) -> Address {
    (block + BYTES_IN_WORD).load()
}

unsafe fn set_next(block: Address, next: Address) {
    (block + BYTES_IN_WORD).store(next);
}

unsafe fn prev_of(free_block: Address) -> Address {
    (free_block + 2 * BYTES_IN_WORD).load()
}

unsafe fn set_prev(free_block: Address, prev: Address) {
    (free_block + 2 * BYTES_IN_WORD).store(prev);
}

struct LosInner {
    free_head: Address,
    allocated_head: Address,
}

pub struct LargeObjectSpace {
    provider: Arc<RegionProvider>,
    object_model: Arc<dyn ObjectModel>,
    inner: Mutex<LosInner>,
    /// Blocks found dead by the sweep, freed after the walk.
    dead: SegQueue<Address>,
}

impl LargeObjectSpace {
    pub fn new(provider: Arc<RegionProvider>, object_model: Arc<dyn ObjectModel>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            object_model,
            inner: Mutex::new(LosInner {
                free_head: Address::ZERO,
                allocated_head: Address::ZERO,
            }),
            dead: SegQueue::new(),
        })
    }

    fn table(&self) -> &Arc<RegionTable> {
        self.provider.table()
    }

    fn region_bytes(&self) -> usize {
        self.table().region_bytes()
    }

    /// Is `addr` inside a region this space owns?
    fn owns(&self, addr: Address) -> bool {
        self.table().contains(addr)
            && self.table().region_info(self.table().region_of(addr)).owner() == ACCOUNT_LARGE
    }

    /// The object cell stored in a block.
    pub fn cell_of_block(block: Address) -> Address {
        block + HEADER_BYTES
    }

    pub fn block_of_cell(cell: Address) -> Address {
        cell - HEADER_BYTES
    }

    /// Allocate storage for a `size`-byte object. The object cell sits
    /// behind the block's tag words. Zero when no span is available.
    pub fn allocate(&self, size: usize) -> Address {
        debug_assert!(size % BYTES_IN_WORD == 0);
        let needed = size + HEADER_BYTES + FOOTER_BYTES;
        let block_bytes = Address::ZERO.add(needed).align_up(self.region_bytes()).as_usize();
        let mut inner = self.inner.lock();
        let block = match self.take_free_block(&mut inner, block_bytes) {
            Some(block) => block,
            None => {
                let count = block_bytes >> self.table().log2_region_bytes();
                let Some(run) = self.provider.take_contiguous_empty_run(count) else {
                    return Address::ZERO;
                };
                self.table().region_start(run.first)
            }
        };
        unsafe {
            write_tags(block, block_bytes, LISTED);
            set_next(block, inner.allocated_head);
        }
        inner.allocated_head = block;
        self.format_regions_for_block(block, block_bytes, size);
        debug!("large allocation: {size}B in {block_bytes}B block at {block}");
        Self::cell_of_block(block)
    }

    /// First-fit over the free block list; splits whole-region
    /// remainders back onto the list.
    fn take_free_block(&self, inner: &mut LosInner, block_bytes: usize) -> Option<Address> {
        let mut block = inner.free_head;
        while !block.is_zero() {
            let size = unsafe { block_size(block) };
            if size >= block_bytes {
                self.unlink_free(inner, block);
                let remainder = size - block_bytes;
                if remainder > 0 {
                    debug_assert!(remainder % self.region_bytes() == 0);
                    self.insert_free(inner, block + block_bytes, remainder);
                }
                return Some(block);
            }
            block = unsafe { next_of(block) };
        }
        None
    }

    fn unlink_free(&self, inner: &mut LosInner, block: Address) {
        unsafe {
            let prev = prev_of(block);
            let next = next_of(block);
            if prev.is_zero() {
                inner.free_head = next;
            } else {
                set_next(prev, next);
            }
            if !next.is_zero() {
                set_prev(next, prev);
            }
        }
    }

    fn insert_free(&self, inner: &mut LosInner, block: Address, size: usize) {
        unsafe {
            write_tags(block, size, FREE | LISTED);
            set_next(block, inner.free_head);
            set_prev(block, Address::ZERO);
            if !inner.free_head.is_zero() {
                set_prev(inner.free_head, block);
            }
        }
        inner.free_head = block;
    }

    /// Set the region states for a freshly allocated block and format
    /// any tail room so the tail region stays parsable.
    fn format_regions_for_block(&self, block: Address, block_bytes: usize, object_size: usize) {
        let table = self.table();
        let first = table.region_of(block);
        let count = block_bytes >> table.log2_region_bytes();
        let cell_end = Self::cell_of_block(block) + object_size;
        let tail_room = block_bytes - HEADER_BYTES - object_size - FOOTER_BYTES;
        let tail_id = first + count - 1;
        for id in first..first + count {
            let info = table.region_info(id);
            debug_assert_eq!(info.owner(), ACCOUNT_LARGE);
            if id == first {
                info.set_state(RegionState::LargeHead);
            } else if id < tail_id {
                info.set_state(RegionState::LargeBody);
            }
        }
        if count > 1 {
            let tail_info = table.region_info(tail_id);
            if tail_room >= MIN_CELL_SIZE {
                unsafe { free_chunk::format(cell_end, tail_room) };
                tail_info.set_state(RegionState::LargeTail);
                tail_info.set_free_chunks(cell_end, tail_room);
            } else {
                if tail_room > 0 {
                    unsafe { free_chunk::format_dead(cell_end, tail_room) };
                }
                tail_info.set_state(RegionState::LargeFullTail);
            }
        } else if tail_room > 0 {
            // Single-region block: the head region holds the tail room.
            unsafe { free_chunk::format_dead(cell_end, tail_room) };
        }
    }

    /// Free the block holding `cell`, coalescing with free neighbour
    /// blocks through their boundary tags.
    pub fn free(&self, cell: Address) {
        let mut inner = self.inner.lock();
        self.free_locked(&mut inner, cell);
    }

    fn free_locked(&self, inner: &mut LosInner, cell: Address) {
        let block = Self::block_of_cell(cell);
        debug_assert!(self.owns(block));
        debug_assert!(!unsafe { is_free_tag(tag_at(block)) });
        self.unlink_allocated(inner, block);
        let mut start = block;
        let mut size = unsafe { block_size(block) };
        // Coalesce with the following block.
        let after = block + size;
        if self.owns(after) && unsafe { is_free_tag(tag_at(after)) } {
            self.unlink_free(inner, after);
            size += unsafe { block_size(after) };
        }
        // Coalesce with the preceding block via its suffix tag.
        if start > self.table().covered_start() && self.owns(start - FOOTER_BYTES) {
            let prev_tag = unsafe { tag_at(start - FOOTER_BYTES) };
            if unsafe { is_free_tag(prev_tag) } {
                let prev_size = prev_tag & !TAG_MASK;
                let prev_start = start - prev_size;
                self.unlink_free(inner, prev_start);
                start = prev_start;
                size += prev_size;
            }
        }
        // The merged span's regions all go back to empty; the space
        // keeps owning them through its free-block list.
        let table = self.table();
        let first = table.region_of(start);
        for id in first..first + (size >> table.log2_region_bytes()) {
            let info = table.region_info(id);
            if info.state() != RegionState::Empty {
                info.set_state(RegionState::Empty);
                info.set_free_chunks(Address::ZERO, 0);
            }
        }
        self.insert_free(inner, start, size);
        debug!("large free: merged span of {size}B at {start}");
    }

    fn unlink_allocated(&self, inner: &mut LosInner, block: Address) {
        unsafe {
            let mut prev = Address::ZERO;
            let mut cur = inner.allocated_head;
            while !cur.is_zero() {
                if cur == block {
                    if prev.is_zero() {
                        inner.allocated_head = next_of(cur);
                    } else {
                        set_next(prev, next_of(cur));
                    }
                    return;
                }
                prev = cur;
                cur = next_of(cur);
            }
            crate::fatal_error!("freed large block {block} not on the allocated list");
        }
    }

    /// Sweep after a mark: unlink every unmarked object's block and
    /// return the merged spans to the free pool. Returns freed bytes.
    pub fn sweep(&self, color_map: &ColorMap) -> usize {
        {
            let inner = self.inner.lock();
            let mut block = inner.allocated_head;
            while !block.is_zero() {
                let cell = Self::cell_of_block(block);
                if color_map.is_white(color_map.bit_index_of(cell)) {
                    self.dead.push(cell);
                }
                block = unsafe { next_of(block) };
            }
        }
        let mut freed = 0;
        let mut inner = self.inner.lock();
        while let Some(cell) = self.dead.pop() {
            freed += unsafe { block_size(Self::block_of_cell(cell)) };
            self.free_locked(&mut inner, cell);
        }
        freed
    }

    /// Reusable room in the tail region of an allocated block, claimed
    /// for bump allocation. Returns the chunk span.
    pub fn take_tail_chunk(&self, min_size: usize) -> Option<(RegionId, Span)> {
        let _inner = self.inner.lock();
        let table = self.table();
        for (id, info) in table.iter_infos() {
            if info.owner() == ACCOUNT_LARGE
                && info.state() == RegionState::LargeTail
                && info.free_bytes() >= min_size
            {
                let chunk = info.free_chunk_head();
                let size = unsafe { free_chunk::size_of(chunk) };
                info.set_state(RegionState::LargeAllocatingTail);
                info.set_free_chunks(Address::ZERO, 0);
                return Some((id, Span::new(chunk, size)));
            }
        }
        None
    }

    /// Retire a tail previously claimed by
    /// [`LargeObjectSpace::take_tail_chunk`].
    pub fn retire_tail(&self, id: RegionId, leftover: Span) {
        let _inner = self.inner.lock();
        let info = self.table().region_info(id);
        debug_assert_eq!(info.state(), RegionState::LargeAllocatingTail);
        if leftover.size >= MIN_CELL_SIZE {
            unsafe { free_chunk::format(leftover.start, leftover.size) };
            info.set_state(RegionState::LargeTail);
            info.set_free_chunks(leftover.start, leftover.size);
        } else {
            if leftover.size > 0 {
                unsafe { free_chunk::format_dead(leftover.start, leftover.size) };
            }
            info.set_state(RegionState::LargeFullTail);
        }
    }

    /// The free span whose block starts at `start`, if `start` heads a
    /// free block (boundary-tag lookup from the left edge).
    pub fn free_span_at(&self, start: Address) -> Option<Span> {
        if !self.owns(start) {
            return None;
        }
        let tag = unsafe { tag_at(start) };
        unsafe { is_free_tag(tag) }.then(|| Span::new(start, tag & !TAG_MASK))
    }

    /// The free span whose block ends at `end` (boundary-tag lookup
    /// from the right edge).
    pub fn free_span_ending_at(&self, end: Address) -> Option<Span> {
        if !self.owns(end - FOOTER_BYTES) {
            return None;
        }
        let tag = unsafe { tag_at(end - FOOTER_BYTES) };
        if !unsafe { is_free_tag(tag) } {
            return None;
        }
        let size = tag & !TAG_MASK;
        Some(Span::new(end - size, size))
    }

    /// Bytes on the free-block list.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;
        let mut block = inner.free_head;
        while !block.is_zero() {
            total += unsafe { block_size(block) };
            block = unsafe { next_of(block) };
        }
        total
    }

    /// Visit every live large object as `(cell, size)`.
    pub fn visit_cells(&self, visitor: &mut dyn FnMut(Address, usize)) {
        let inner = self.inner.lock();
        let mut block = inner.allocated_head;
        while !block.is_zero() {
            let cell = Self::cell_of_block(block);
            visitor(cell, self.object_model.size_of(cell));
            block = unsafe { next_of(block) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testing::TestObjectModel;
    use crate::util::memory::VirtualMemory;

    const REGION: usize = 1 << 16;

    struct Fixture {
        _vm: VirtualMemory,
        provider: Arc<RegionProvider>,
        los: Arc<LargeObjectSpace>,
    }

    fn fixture(num_regions: usize) -> Fixture {
        let vm = VirtualMemory::reserve(REGION * num_regions, REGION).unwrap();
        let table = Arc::new(RegionTable::new(vm.start(), REGION, num_regions));
        let provider = RegionProvider::new(table.clone(), num_regions);
        let los = LargeObjectSpace::new(provider.clone(), Arc::new(TestObjectModel));
        Fixture {
            _vm: vm,
            provider,
            los,
        }
    }

    /// An object size that makes its block exactly one region.
    const ONE_REGION_OBJECT: usize = REGION - HEADER_BYTES - FOOTER_BYTES;

    #[test]
    fn allocate_sets_region_states() {
        let f = fixture(8);
        let size = 3 * REGION - HEADER_BYTES - FOOTER_BYTES;
        let cell = f.los.allocate(size);
        assert!(!cell.is_zero());
        unsafe { TestObjectModel::format(cell, size, &[]) };
        let table = f.provider.table();
        let first = table.region_of(LargeObjectSpace::block_of_cell(cell));
        assert_eq!(table.region_info(first).state(), RegionState::LargeHead);
        assert_eq!(table.region_info(first + 1).state(), RegionState::LargeBody);
        assert_eq!(
            table.region_info(first + 2).state(),
            RegionState::LargeFullTail
        );
    }

    #[test]
    fn tail_room_becomes_reusable_chunk() {
        let f = fixture(8);
        // Leave half a region of tail room.
        let size = 2 * REGION - HEADER_BYTES - FOOTER_BYTES - REGION / 2;
        let cell = f.los.allocate(size);
        unsafe { TestObjectModel::format(cell, size, &[]) };
        let table = f.provider.table();
        let tail = table.region_of(cell + size);
        assert_eq!(table.region_info(tail).state(), RegionState::LargeTail);
        assert_eq!(table.region_info(tail).free_bytes(), REGION / 2);
        // Claim the tail chunk for bump allocation and give it back.
        let (id, span) = f.los.take_tail_chunk(1024).unwrap();
        assert_eq!(id, tail);
        assert_eq!(span.size, REGION / 2);
        assert_eq!(
            table.region_info(id).state(),
            RegionState::LargeAllocatingTail
        );
        f.los
            .retire_tail(id, Span::new(span.start + 1024usize, span.size - 1024));
        assert_eq!(table.region_info(id).state(), RegionState::LargeTail);
        assert_eq!(table.region_info(id).free_bytes(), REGION / 2 - 1024);
    }

    #[test]
    fn freed_neighbours_coalesce_into_one_span() {
        let f = fixture(8);
        let a = f.los.allocate(ONE_REGION_OBJECT);
        let b = f.los.allocate(ONE_REGION_OBJECT);
        let c = f.los.allocate(ONE_REGION_OBJECT);
        for cell in [a, b, c] {
            unsafe { TestObjectModel::format(cell, ONE_REGION_OBJECT, &[]) };
        }
        let block_a = LargeObjectSpace::block_of_cell(a);
        let block_b = LargeObjectSpace::block_of_cell(b);
        let block_c = LargeObjectSpace::block_of_cell(c);
        assert_eq!(block_b, block_a + REGION);
        assert_eq!(block_c, block_b + REGION);
        // Free the middle block, then its left neighbour: the two
        // spans must merge into one block of the combined size,
        // discoverable from either original boundary.
        f.los.free(b);
        f.los.free(a);
        let merged = f.los.free_span_at(block_a).expect("span from left edge");
        assert_eq!(merged.size, 2 * REGION);
        let from_right = f
            .los
            .free_span_ending_at(block_b + REGION)
            .expect("span from right edge");
        assert_eq!(from_right.start, block_a);
        assert_eq!(from_right.size, 2 * REGION);
        assert_eq!(f.los.free_bytes(), 2 * REGION);
        // Freeing the last block swallows the whole run.
        f.los.free(c);
        let all = f.los.free_span_at(block_a).unwrap();
        assert_eq!(all.size, 3 * REGION);
    }

    #[test]
    fn free_blocks_are_reused() {
        let f = fixture(4);
        let a = f.los.allocate(ONE_REGION_OBJECT);
        unsafe { TestObjectModel::format(a, ONE_REGION_OBJECT, &[]) };
        f.los.free(a);
        let b = f.los.allocate(ONE_REGION_OBJECT);
        assert_eq!(a, b);
    }

    #[test]
    fn sweep_frees_unmarked_blocks() {
        let f = fixture(8);
        let live = f.los.allocate(ONE_REGION_OBJECT);
        let dead = f.los.allocate(ONE_REGION_OBJECT);
        for cell in [live, dead] {
            unsafe { TestObjectModel::format(cell, ONE_REGION_OBJECT, &[]) };
        }
        let map = ColorMap::new(
            f.provider.table().covered_start(),
            f.provider.table().covered_end() - f.provider.table().covered_start(),
        );
        let bit = map.bit_index_of(live);
        assert!(map.mark_grey_if_white(bit));
        map.mark_black_from_grey(bit);
        let freed = f.los.sweep(&map);
        assert_eq!(freed, REGION);
        assert!(f.los.free_span_at(LargeObjectSpace::block_of_cell(dead)).is_some());
        assert!(f.los.free_span_at(LargeObjectSpace::block_of_cell(live)).is_none());
    }
}
