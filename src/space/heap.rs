//! The heap context: one reservation, its region table, the spaces
//! carved out of it, and the collection cycle that ties marking and
//! sweeping together. Created once at startup and passed by reference
//! to everything that needs it.

use log::info;
use spin::Mutex;
use std::ops::Add;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::alloc::refill::Span;
use crate::evac::{EvacuationBufferProvider, Evacuator};
use crate::heap::card_table::CardTable;
use crate::heap::first_object_table::FirstObjectTable;
use crate::heap::region_table::RegionTable;
use crate::mark::marker::{HeapMarker, OverflowStrategy};
use crate::object::ObjectModel;
use crate::space::heap_space::HeapSpace;
use crate::space::large_object_space::LargeObjectSpace;
use crate::space::mark_sweep_space::{MarkSweepSpace, RegionProvider, SpaceOptions};
use crate::sweep::RegionSweeper;
use crate::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD};
use crate::util::memory::VirtualMemory;
use crate::util::Address;
use crate::verify::{HeapVerifier, VerifyOutcome};

/// Fallible resizing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    SizingDenied,
}

pub struct HeapOptions {
    /// Initially committed heap size.
    pub initial_bytes: usize,
    /// Reservation bound `committed` can grow to.
    pub capacity_bytes: usize,
    /// Region size: a power of two, multiple of the page size.
    pub region_bytes: usize,
    pub mark_stack_capacity: usize,
    pub overflow_strategy: OverflowStrategy,
    pub space: SpaceOptions,
    pub grow_percent: usize,
    pub shrink_percent: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            initial_bytes: 32 << 20,
            capacity_bytes: 128 << 20,
            region_bytes: 1 << 20,
            mark_stack_capacity: *crate::args::MARK_STACK_CAPACITY,
            overflow_strategy: if *crate::args::USE_RESCAN_MAP {
                OverflowStrategy::RescanMap
            } else {
                OverflowStrategy::LinearRescan
            },
            space: SpaceOptions::default(),
            grow_percent: *crate::args::HEAP_GROW_PERCENT,
            shrink_percent: *crate::args::HEAP_SHRINK_PERCENT,
        }
    }
}

pub struct Heap {
    vm: VirtualMemory,
    table: Arc<RegionTable>,
    provider: Arc<RegionProvider>,
    card_table: Arc<CardTable>,
    fot: Arc<FirstObjectTable>,
    space: MarkSweepSpace,
    los: Arc<LargeObjectSpace>,
    marker: Mutex<HeapMarker>,
    verifier: HeapVerifier,
    object_model: Arc<dyn ObjectModel>,
    large_threshold: usize,
    grow_percent: usize,
    shrink_percent: usize,
    collection_count: AtomicUsize,
}

impl Heap {
    pub fn new(options: HeapOptions, object_model: Arc<dyn ObjectModel>) -> Heap {
        if !options.region_bytes.is_power_of_two() || options.region_bytes % BYTES_IN_PAGE != 0 {
            crate::fatal_error!(
                "region size {:#x} must be a power of two multiple of the page size",
                options.region_bytes
            );
        }
        let capacity = Address::ZERO
            .add(options.capacity_bytes)
            .align_up(options.region_bytes)
            .as_usize();
        let vm = VirtualMemory::reserve(capacity, options.region_bytes)
            .unwrap_or_else(|| crate::fatal_error!("cannot reserve {capacity} heap bytes"));
        let num_regions = capacity / options.region_bytes;
        let initial_regions = (options.initial_bytes / options.region_bytes).clamp(1, num_regions);
        let table = Arc::new(RegionTable::new(vm.start(), options.region_bytes, num_regions));
        let provider = RegionProvider::new(table.clone(), initial_regions);
        let los = LargeObjectSpace::new(provider.clone(), object_model.clone());
        provider.set_large_space(los.clone());
        let card_table = Arc::new(CardTable::new(vm.start(), capacity));
        let fot = Arc::new(FirstObjectTable::new(vm.start(), capacity));
        let space = MarkSweepSpace::new(provider.clone(), object_model.clone(), options.space);
        let marker = HeapMarker::new(
            vm.start(),
            capacity,
            object_model.clone(),
            options.mark_stack_capacity,
            options.overflow_strategy,
        );
        let verifier = HeapVerifier::new(table.clone(), object_model.clone());
        info!(
            "heap initialized: {num_regions} regions of {:#x} bytes, {initial_regions} committed",
            options.region_bytes
        );
        Heap {
            vm,
            large_threshold: options.region_bytes / 2,
            table,
            provider,
            card_table,
            fot,
            space,
            los,
            marker: Mutex::new(marker),
            verifier,
            object_model,
            grow_percent: options.grow_percent,
            shrink_percent: options.shrink_percent,
            collection_count: AtomicUsize::new(0),
        }
    }

    pub fn table(&self) -> &Arc<RegionTable> {
        &self.table
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    pub fn first_object_table(&self) -> &Arc<FirstObjectTable> {
        &self.fot
    }

    pub fn space(&self) -> &MarkSweepSpace {
        &self.space
    }

    pub fn large_object_space(&self) -> &Arc<LargeObjectSpace> {
        &self.los
    }

    pub fn covered_start(&self) -> Address {
        self.vm.start()
    }

    pub fn collection_count(&self) -> usize {
        self.collection_count.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes, routing oversized requests to the
    /// large-object space and falling back to large-object tail room
    /// before giving up. Zero means a collection is needed.
    pub fn allocate(&self, size: usize) -> Address {
        let size = align_request(size);
        if size >= self.large_threshold {
            return self.los.allocate(size);
        }
        let cell = self.space.allocate(size);
        if !cell.is_zero() {
            return cell;
        }
        if let Some((id, chunk)) = self.los.take_tail_chunk(size) {
            let leftover = Span::new(chunk.start + size, chunk.size - size);
            self.los.retire_tail(id, leftover);
            return chunk.start;
        }
        Address::ZERO
    }

    /// The collection-retry allocation loop: attempt, collect, retry,
    /// with a fatal out-of-memory once collections stop helping.
    pub fn allocate_or_collect(&self, size: usize, roots: &[Address]) -> Address {
        let mut last_free = usize::MAX;
        loop {
            let cell = self.allocate(size);
            if !cell.is_zero() {
                return cell;
            }
            self.collect(roots);
            let free = self.free_space();
            if free >= last_free {
                crate::fatal_error!(
                    "out of memory allocating {size}B: no progress after collection ({free}B free)"
                );
            }
            last_free = free;
        }
    }

    pub fn allocate_tlab(&self, size: usize) -> Address {
        self.space.allocate_tlab(align_request(size))
    }

    pub fn retire_tlab(&self, chunk_list: Address) {
        self.space.retire_tlab(chunk_list);
    }

    pub fn free_space(&self) -> usize {
        self.space.free_space() + self.los.free_bytes()
    }

    pub fn used_space(&self) -> usize {
        self.space.committed_space().saturating_sub(self.free_space())
    }

    pub fn committed_space(&self) -> usize {
        self.space.committed_space()
    }

    pub fn capacity(&self) -> usize {
        self.vm.size()
    }

    /// Visit every live cell of both spaces.
    pub fn visit(&self, visitor: &mut dyn FnMut(Address, usize)) {
        self.space.visit_cells(visitor);
        self.los.visit_cells(visitor);
    }

    /// One stop-the-world collection cycle over the given roots.
    pub fn collect(&self, roots: &[Address]) {
        self.collect_with_boot(roots, &[]);
    }

    /// Collection with additional boot-region cells treated as
    /// permanent roots.
    pub fn collect_with_boot(&self, roots: &[Address], boot_cells: &[Address]) {
        let n = self.collection_count.fetch_add(1, Ordering::Relaxed);
        crate::gc_log!("collection {n} starting: {}B free", self.free_space());
        self.space.prepare_for_collection();
        let mut marker = self.marker.lock();
        // Cells only start in iterable regions (small-space regions
        // and large-object heads), so restrict the scan to those runs.
        let ranges: Vec<_> = self
            .table
            .matching_ranges(|info| info.is(crate::heap::region::flags::ITERABLE))
            .collect();
        marker.mark_all_in_ranges(roots, &self.table, &ranges);
        if !boot_cells.is_empty() {
            marker.mark_boot_cells(boot_cells);
            marker.visit_grey_objects();
        }
        let large_freed = self.los.sweep(marker.color_map());
        let mut sweeper = RegionSweeper::new(
            self.table.clone(),
            self.provider.sweepable_regions(),
            self.space.min_reclaimable(),
        );
        marker.sweep_regions(&mut sweeper);
        self.provider.rebuild_after_sweep(sweeper.outcomes());
        drop(marker);
        // Mutators are stopped and every survivor has been visited:
        // nothing is remembered across this point.
        self.card_table.clean_all();
        self.resize_after_gc();
        crate::gc_log!(
            "collection {n} done: reclaimed {}B small, {large_freed}B large, {}B free",
            sweeper.total_free_bytes(),
            self.free_space()
        );
    }

    /// Post-collection sizing policy: grow when occupancy is high,
    /// shrink when it is low. Thresholds are tunables, not invariants.
    fn resize_after_gc(&self) {
        let committed = self.space.committed_space();
        if committed == 0 {
            return;
        }
        let occupancy = self.used_space() * 100 / committed;
        let region = self.table.region_bytes();
        if occupancy > self.grow_percent {
            let _ = self.grow_after_gc((committed / 4).max(region));
        } else if occupancy < self.shrink_percent {
            let target = (self.used_space() * 2).max(region);
            if committed > target {
                let _ = self.shrink_after_gc(committed - target);
            }
        }
    }

    /// Commit up to `bytes` more heap, bounded by the reservation.
    /// Returns the bytes actually added.
    pub fn grow_after_gc(&self, bytes: usize) -> Result<usize, HeapError> {
        let region = self.table.region_bytes();
        let regions = (bytes + region - 1) / region;
        let done = self.provider.commit_regions(regions);
        if done == 0 {
            return Err(HeapError::SizingDenied);
        }
        crate::gc_log!("heap grown by {} bytes", done * region);
        Ok(done * region)
    }

    /// Decommit up to `bytes` of empty regions. Returns the bytes
    /// actually released.
    pub fn shrink_after_gc(&self, bytes: usize) -> Result<usize, HeapError> {
        let region = self.table.region_bytes();
        let done = self.provider.decommit_regions(bytes / region);
        if done == 0 {
            return Err(HeapError::SizingDenied);
        }
        crate::gc_log!("heap shrunk by {} bytes", done * region);
        Ok(done * region)
    }

    /// Re-walk the heap checking collector invariants; fatal on any
    /// violation. Call right after a collection.
    pub fn verify(&self) -> VerifyOutcome {
        let marker = self.marker.lock();
        self.verifier.run(marker.color_map(), Some(self.card_table.as_ref()))
    }

    /// Evacuate the live objects of `[source_start, source_end)` into
    /// fresh regions, rewriting `roots` and every reference reachable
    /// from the remembered (dirty-card) ranges.
    pub fn evacuate_span(
        &self,
        roots: &mut [Address],
        source: (Address, Address),
        remembered_ranges: &[(Address, Address)],
    ) -> usize {
        let buffers = HeapEvacuationBuffers {
            provider: &self.provider,
        };
        let mut evacuator = Evacuator::new(
            self.object_model.clone(),
            &buffers,
            self.card_table.clone(),
            self.fot.clone(),
            source.0,
            source.1,
        );
        evacuator.evacuate(roots, remembered_ranges);
        evacuator.promoted_bytes()
    }
}

fn align_request(size: usize) -> usize {
    size.max(crate::util::constants::MIN_CELL_SIZE)
        .next_multiple_of(BYTES_IN_WORD)
}

/// Promotion buffers carved from fresh allocating regions.
struct HeapEvacuationBuffers<'h> {
    provider: &'h Arc<RegionProvider>,
}

impl<'h> EvacuationBufferProvider for HeapEvacuationBuffers<'h> {
    fn refill_evacuation_buffer(&self, min: usize) -> Span {
        let table = self.provider.table();
        if min > table.region_bytes() {
            return Span::EMPTY;
        }
        match self.provider.get_empty_allocating_region() {
            Some(id) => Span::new(table.region_start(id), table.region_bytes()),
            None => Span::EMPTY,
        }
    }

    fn retire_evacuation_buffer(&self, unused: Span) {
        let table = self.provider.table();
        let id = table.region_of(unused.start);
        let info = table.region_info(id);
        if unused.size >= crate::util::constants::MIN_CELL_SIZE {
            info.set_free_chunks(unused.start, unused.size);
            self.provider.retire_allocating_region(id, false);
        } else {
            self.provider.retire_allocating_region(id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::free_chunk;
    use crate::object::testing::TestObjectModel;
    use crate::util::constants::BYTES_IN_WORD;

    const REGION: usize = 1 << 16;
    const CELL: usize = 8 * BYTES_IN_WORD;

    fn small_heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(
            HeapOptions {
                initial_bytes: 4 * REGION,
                capacity_bytes: 8 * REGION,
                region_bytes: REGION,
                mark_stack_capacity: 64,
                overflow_strategy: OverflowStrategy::LinearRescan,
                space: SpaceOptions {
                    min_tlab_size: 1024,
                    min_chunk_size: 64,
                    min_reclaimable: 64,
                },
                // Disable automatic resizing so the tests control it.
                grow_percent: 101,
                shrink_percent: 0,
            },
            Arc::new(TestObjectModel),
        )
    }

    fn alloc_object(heap: &Heap, size: usize, refs: &[Address]) -> Address {
        let cell = heap.allocate(size);
        assert!(!cell.is_zero());
        unsafe { TestObjectModel::format(cell, size, refs) };
        cell
    }

    #[test]
    fn collection_keeps_reachable_frees_garbage() {
        let heap = small_heap();
        let c = alloc_object(&heap, CELL, &[]);
        let b = alloc_object(&heap, CELL, &[c]);
        let a = alloc_object(&heap, CELL, &[b]);
        let _garbage1 = alloc_object(&heap, 4 * CELL, &[]);
        let _garbage2 = alloc_object(&heap, 4 * CELL, &[a]);
        let roots = [a];
        heap.collect(&roots);

        let mut live: Vec<Address> = vec![];
        heap.visit(&mut |cell, _| live.push(cell));
        live.sort();
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(live, expected);
        let outcome = heap.verify();
        assert_eq!(outcome.live_bytes, 3 * CELL);
        assert!(outcome.free_bytes > 0);
    }

    #[test]
    fn allocation_retry_loop_collects_and_succeeds() {
        let heap = small_heap();
        // Churn garbage well past the committed size; the retry loop
        // must collect its way through.
        let committed = heap.committed_space();
        let mut allocated = 0;
        while allocated < 3 * committed {
            let cell = heap.allocate_or_collect(16 * CELL, &[]);
            unsafe { TestObjectModel::format(cell, 16 * CELL, &[]) };
            allocated += 16 * CELL;
        }
        assert!(heap.collection_count() > 0);
    }

    #[test]
    fn surviving_objects_stay_put_across_collections() {
        let heap = small_heap();
        let b = alloc_object(&heap, CELL, &[]);
        let a = alloc_object(&heap, CELL, &[b]);
        let roots = [a];
        heap.collect(&roots);
        heap.collect(&roots);
        // Mark-sweep never moves: the same cells stay live.
        let value: usize = unsafe { a.load() };
        assert_eq!(value, CELL);
        let slot: Address = unsafe { (a + 2 * BYTES_IN_WORD).load() };
        assert_eq!(slot, b);
        heap.verify();
    }

    #[test]
    fn reclaimed_space_is_reused() {
        let heap = small_heap();
        let keep = alloc_object(&heap, CELL, &[]);
        let garbage = alloc_object(&heap, 32 * CELL, &[]);
        let roots = [keep];
        heap.collect(&roots);
        let free_after = heap.free_space();
        // Partially free regions are preferred for refills, so the new
        // allocation lands in the garbage's reclaimed chunk.
        let fresh = alloc_object(&heap, CELL, &[]);
        assert!(heap.free_space() < free_after);
        assert_eq!(heap.table().region_of(fresh), heap.table().region_of(garbage));
    }

    #[test]
    fn large_objects_round_trip_through_the_los() {
        let heap = small_heap();
        let size = REGION / 2; // at the large threshold
        let cell = heap.allocate(size);
        assert!(!cell.is_zero());
        unsafe { TestObjectModel::format(cell, size, &[]) };
        let roots = [cell];
        heap.collect(&roots);
        let mut live = vec![];
        heap.visit(&mut |c, s| live.push((c, s)));
        assert!(live.contains(&(cell, size)));
        // Unrooted, the block is reclaimed and coalesces into the
        // free pool.
        heap.collect(&[]);
        assert!(heap.large_object_space().free_bytes() >= REGION);
    }

    #[test]
    fn tlab_cycle_through_the_heap() {
        let heap = small_heap();
        let tlab = heap.allocate_tlab(2048);
        assert!(!tlab.is_zero());
        assert!(unsafe { free_chunk::total_bytes(tlab) } >= 2048);
        heap.retire_tlab(tlab);
        heap.collect(&[]);
        heap.verify();
    }

    #[test]
    fn explicit_resizing_is_bounded_by_capacity() {
        let heap = small_heap();
        assert_eq!(heap.committed_space(), 4 * REGION);
        assert_eq!(heap.grow_after_gc(2 * REGION), Ok(2 * REGION));
        assert_eq!(heap.committed_space(), 6 * REGION);
        // Growing past the reservation stops at the boundary.
        assert_eq!(heap.grow_after_gc(16 * REGION), Ok(2 * REGION));
        assert_eq!(heap.grow_after_gc(REGION), Err(HeapError::SizingDenied));
        assert_eq!(heap.shrink_after_gc(4 * REGION), Ok(4 * REGION));
        assert_eq!(heap.committed_space(), 4 * REGION);
    }

    #[test]
    fn evacuation_moves_survivors_between_regions() {
        let heap = small_heap();
        let b = alloc_object(&heap, CELL, &[]);
        let a = alloc_object(&heap, CELL, &[b]);
        // Retire the allocator so the source region is stable.
        heap.space().prepare_for_collection();
        let source_region = heap.table().region_of(a);
        let source = (
            heap.table().region_start(source_region),
            heap.table().region_end(source_region),
        );
        let mut roots = [a];
        let promoted = heap.evacuate_span(&mut roots, source, &[]);
        assert_eq!(promoted, 2 * CELL);
        let new_a = roots[0];
        assert_ne!(heap.table().region_of(new_a), source_region);
        let slot: Address = unsafe { (new_a + 2 * BYTES_IN_WORD).load() };
        assert_ne!(slot, b);
        assert_eq!(slot, TestObjectModel.forwarding_of(b).unwrap());
    }
}
