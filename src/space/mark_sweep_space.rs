//! The first-fit mark-sweep space: region provisioning, the small and
//! TLAB allocators with their refill policy, and post-sweep list
//! rebuilding.

use log::{debug, trace};
use spin::Mutex;
use std::sync::Arc;

use crate::alloc::bump::BumpAllocator;
use crate::alloc::refill::{retire_chunk, Refiller, Span};
use crate::alloc::tlab::TlabAllocator;
use crate::heap::free_chunk;
use crate::heap::region::{RegionId, RegionState};
use crate::heap::region_list::{RegionLinks, RegionList};
use crate::heap::region_table::{RegionRange, RegionTable};
use crate::object::ObjectModel;
use crate::space::heap_space::HeapSpace;
use crate::sweep::SweptRegion;
use crate::util::constants::MIN_CELL_SIZE;
use crate::util::Address;

/// Owner tags of the two built-in heap accounts.
pub const ACCOUNT_SMALL: u8 = 1;
pub const ACCOUNT_LARGE: u8 = 2;

struct ProviderLists {
    empty: RegionList,
    free_chunks: RegionList,
    full: RegionList,
    allocating: RegionList,
    /// Regions reserved but outside the current heap size.
    uncommitted: RegionList,
    committed: Box<[bool]>,
    /// Chunk cursor into the region currently being consumed by
    /// refills, zero when none.
    refill_chunk: Address,
    /// Leftover from the last overflow allocation, consumed first.
    overflow_leftover: Span,
}

/// Serves regions and free chunks to allocators and the large-object
/// space. All list state sits behind one lock; the allocators' fast
/// paths never take it.
pub struct RegionProvider {
    table: Arc<RegionTable>,
    links: Arc<RegionLinks>,
    lists: Mutex<ProviderLists>,
    /// Set once at heap initialization; oversized refill requests are
    /// routed here.
    large_space: spin::Once<Arc<crate::space::large_object_space::LargeObjectSpace>>,
}

impl RegionProvider {
    pub fn new(table: Arc<RegionTable>, initial_regions: usize) -> Arc<Self> {
        let links = RegionLinks::new(table.num_regions());
        let mut empty = RegionList::new(links.clone());
        let mut uncommitted = RegionList::new(links.clone());
        let mut committed = vec![false; table.num_regions()].into_boxed_slice();
        for id in 0..table.num_regions() {
            if id < initial_regions {
                empty.append(id);
                committed[id] = true;
            } else {
                uncommitted.append(id);
            }
        }
        Arc::new(Self {
            links: links.clone(),
            lists: Mutex::new(ProviderLists {
                empty,
                free_chunks: RegionList::new(links.clone()),
                full: RegionList::new(links.clone()),
                allocating: RegionList::new(links.clone()),
                uncommitted,
                committed,
                refill_chunk: Address::ZERO,
                overflow_leftover: Span::EMPTY,
            }),
            table,
            large_space: spin::Once::new(),
        })
    }

    pub fn set_large_space(&self, los: Arc<crate::space::large_object_space::LargeObjectSpace>) {
        self.large_space.call_once(|| los);
    }

    /// Route an oversized allocation to the large-object space.
    pub fn allocate_large(&self, size: usize) -> Address {
        match self.large_space.get() {
            Some(los) => los.allocate(size),
            None => Address::ZERO,
        }
    }

    pub fn table(&self) -> &Arc<RegionTable> {
        &self.table
    }

    pub fn links(&self) -> &Arc<RegionLinks> {
        &self.links
    }

    /// Pick a region to allocate into, preferring partially free
    /// regions over empty ones.
    pub fn get_allocating_region(&self) -> Option<RegionId> {
        let mut lists = self.lists.lock();
        let id = lists
            .free_chunks
            .remove_head()
            .or_else(|| lists.empty.remove_head())?;
        let info = self.table.region_info(id);
        info.set_owner(ACCOUNT_SMALL);
        info.set_state(RegionState::Allocating);
        lists.allocating.append(id);
        trace!("allocating region {id}");
        Some(id)
    }

    /// Pick an empty region to allocate into. Unlike
    /// [`RegionProvider::get_allocating_region`], the whole region span
    /// is guaranteed free, so bulk writers (evacuation buffers) can use
    /// it without consulting any chunk list.
    pub fn get_empty_allocating_region(&self) -> Option<RegionId> {
        let mut lists = self.lists.lock();
        let id = lists.empty.remove_head()?;
        let info = self.table.region_info(id);
        info.set_owner(ACCOUNT_SMALL);
        info.set_state(RegionState::Allocating);
        lists.allocating.append(id);
        Some(id)
    }

    /// Retire an allocating region as full or as partially free.
    pub fn retire_allocating_region(&self, id: RegionId, fully_occupied: bool) {
        let mut lists = self.lists.lock();
        let removed = lists.allocating.remove(id);
        debug_assert!(removed, "region {id} was not allocating");
        let info = self.table.region_info(id);
        if fully_occupied {
            info.to_full_state();
            lists.full.append(id);
        } else {
            info.set_state(RegionState::FreeChunks);
            lists.free_chunks.append(id);
        }
    }

    /// Produce a refill span of at least `requested` bytes: the next
    /// free chunk of the region currently being consumed, else a chunk
    /// from the next partially free region, else a whole empty region.
    fn take_refill_span(&self, requested: usize) -> Span {
        let mut lists = self.lists.lock();
        loop {
            // Consume the current region's chunk list first.
            while !lists.refill_chunk.is_zero() {
                let chunk = lists.refill_chunk;
                let size = unsafe { free_chunk::size_of(chunk) };
                lists.refill_chunk = unsafe { free_chunk::next(chunk) };
                if size >= requested {
                    return Span::new(chunk, size);
                }
                // Too small for this request; keep it parsable and let
                // the next sweep take it back.
                unsafe { free_chunk::format_dead(chunk, size) };
            }
            if let Some(id) = lists.free_chunks.remove_head() {
                let info = self.table.region_info(id);
                info.set_state(RegionState::Allocating);
                lists.allocating.append(id);
                lists.refill_chunk = info.take_free_chunks();
                continue;
            }
            let Some(id) = lists.empty.remove_head() else {
                return Span::EMPTY;
            };
            let info = self.table.region_info(id);
            info.set_owner(ACCOUNT_SMALL);
            info.set_state(RegionState::Allocating);
            lists.allocating.append(id);
            let span = Span::new(self.table.region_start(id), self.table.region_bytes());
            if span.size >= requested {
                return span;
            }
            // A request larger than a region should have been routed
            // to the large-object space.
            crate::fatal_error!("refill request of {requested} bytes exceeds a region");
        }
    }

    /// Slow-path allocation bypassing the bump pointer: carve from a
    /// provider-held leftover, refilling it like a tiny bump span.
    fn allocate_overflow(&self, size: usize) -> Address {
        {
            let mut lists = self.lists.lock();
            let leftover = lists.overflow_leftover;
            if !leftover.is_empty() && leftover.size >= size {
                lists.overflow_leftover = if leftover.size - size >= MIN_CELL_SIZE {
                    Span::new(leftover.start + size, leftover.size - size)
                } else {
                    Span::EMPTY
                };
                if leftover.size - size > 0 && lists.overflow_leftover.is_empty() {
                    retire_chunk(leftover.start + size, leftover.size - size, usize::MAX);
                }
                return leftover.start;
            }
        }
        let span = self.take_refill_span(size);
        if span.is_empty() {
            return Address::ZERO;
        }
        let mut lists = self.lists.lock();
        // Retire the previous leftover before replacing it.
        let old = lists.overflow_leftover;
        if !old.is_empty() {
            retire_chunk(old.start, old.size, MIN_CELL_SIZE);
        }
        lists.overflow_leftover = if span.size - size >= MIN_CELL_SIZE {
            Span::new(span.start + size, span.size - size)
        } else {
            if span.size - size > 0 {
                retire_chunk(span.start + size, span.size - size, usize::MAX);
            }
            Span::EMPTY
        };
        span.start
    }

    /// Take `count` physically contiguous committed empty regions for
    /// the large-object space.
    pub fn take_contiguous_empty_run(&self, count: usize) -> Option<RegionRange> {
        let mut lists = self.lists.lock();
        let candidate = self
            .table
            .ranges_in_state(RegionState::Empty)
            .flat_map(|range| {
                (range.first..range.first + range.count.saturating_sub(count - 1))
                    .map(move |first| RegionRange { first, count })
            })
            .find(|range| {
                (range.first..range.first + range.count)
                    .all(|id| lists.committed[id] && lists.empty.contains(id))
            })?;
        for id in candidate.first..candidate.first + candidate.count {
            let removed = lists.empty.remove(id);
            debug_assert!(removed);
            self.table.region_info(id).set_owner(ACCOUNT_LARGE);
        }
        Some(candidate)
    }

    /// Give back a TLAB's unused chunks. Each chunk is already
    /// formatted; plant them as dead space and let the next sweep
    /// reclaim them precisely.
    pub fn retire_chunk_list(&self, chunk_list: Address) {
        let mut chunk = chunk_list;
        while !chunk.is_zero() {
            let next = unsafe { free_chunk::next(chunk) };
            let size = unsafe { free_chunk::size_of(chunk) };
            unsafe { free_chunk::format_dead(chunk, size) };
            chunk = next;
        }
    }

    /// Move every allocating region to the full list with its state
    /// asserted, in preparation for marking.
    pub fn quiesce_for_collection(&self) {
        let mut lists = self.lists.lock();
        lists.refill_chunk = Address::ZERO;
        let old = lists.overflow_leftover;
        if !old.is_empty() {
            retire_chunk(old.start, old.size, usize::MAX);
            lists.overflow_leftover = Span::EMPTY;
        }
        while let Some(id) = lists.allocating.remove_head() {
            self.table.region_info(id).to_full_state();
            lists.full.append(id);
        }
    }

    /// Regions to sweep (all iterable small-account regions),
    /// ascending.
    pub fn sweepable_regions(&self) -> Vec<RegionId> {
        let lists = self.lists.lock();
        let mut out: Vec<RegionId> = self
            .table
            .iter_infos()
            .filter(|(id, info)| {
                lists.committed[*id]
                    && info.owner() == ACCOUNT_SMALL
                    && matches!(info.state(), RegionState::Full | RegionState::FreeChunks)
            })
            .map(|(id, _)| id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Rebuild the region lists from sweep outcomes.
    pub fn rebuild_after_sweep(&self, outcomes: &[SweptRegion]) {
        let mut lists = self.lists.lock();
        for outcome in outcomes {
            lists.full.remove(outcome.id);
            lists.free_chunks.remove(outcome.id);
            lists.empty.remove(outcome.id);
            match outcome.state {
                RegionState::Empty => {
                    self.table
                        .region_info(outcome.id)
                        .set_owner(crate::heap::region::NO_OWNER);
                    lists.empty.append(outcome.id);
                }
                RegionState::Full => lists.full.append(outcome.id),
                RegionState::FreeChunks => lists.free_chunks.append(outcome.id),
                other => crate::fatal_error!("unexpected sweep outcome {other:?}"),
            }
        }
        debug!(
            "post-sweep lists: {} empty, {} reusable, {} full",
            lists.empty.len(),
            lists.free_chunks.len(),
            lists.full.len()
        );
    }

    /// Commit `count` more regions, bounded by the reservation.
    /// Returns the number actually committed.
    pub fn commit_regions(&self, count: usize) -> usize {
        let mut lists = self.lists.lock();
        let mut done = 0;
        while done < count {
            let Some(id) = lists.uncommitted.remove_head() else {
                break;
            };
            lists.committed[id] = true;
            lists.empty.append(id);
            done += 1;
        }
        done
    }

    /// Decommit up to `count` empty regions. Returns the number
    /// actually decommitted.
    pub fn decommit_regions(&self, count: usize) -> usize {
        let mut lists = self.lists.lock();
        let mut done = 0;
        while done < count {
            let Some(id) = lists.empty.remove_tail() else {
                break;
            };
            lists.committed[id] = false;
            lists.uncommitted.append(id);
            unsafe {
                crate::util::memory::decommit(self.table.region_start(id), self.table.region_bytes());
            }
            done += 1;
        }
        done
    }

    pub fn committed_regions(&self) -> usize {
        let lists = self.lists.lock();
        lists.committed.iter().filter(|c| **c).count()
    }

    /// Reusable bytes across empty regions, chunk lists, and the
    /// provider-held refill state.
    pub fn free_bytes(&self) -> usize {
        let lists = self.lists.lock();
        let mut free = lists.empty.len() * self.table.region_bytes();
        for (id, info) in self.table.iter_infos() {
            if lists.committed[id] && info.state() == RegionState::FreeChunks {
                free += info.free_bytes();
            }
        }
        let mut chunk = lists.refill_chunk;
        while !chunk.is_zero() {
            free += unsafe { free_chunk::size_of(chunk) };
            chunk = unsafe { free_chunk::next(chunk) };
        }
        free + lists.overflow_leftover.size
    }
}

/// Refill policy for the small and TLAB allocators: refill with fresh
/// spans for ordinary requests, route oversized requests around the
/// bump pointer.
pub struct SpaceRefiller {
    provider: Arc<RegionProvider>,
    /// Requests at or above this bypass the bump pointer.
    overflow_threshold: usize,
    /// Requests at or above this belong to the large-object space.
    large_threshold: usize,
}

impl SpaceRefiller {
    pub fn new(provider: Arc<RegionProvider>, overflow_threshold: usize, large_threshold: usize) -> Self {
        Self {
            provider,
            overflow_threshold,
            large_threshold,
        }
    }
}

impl Refiller for SpaceRefiller {
    fn should_refill(&self, requested: usize, _space_left: usize) -> bool {
        requested < self.overflow_threshold
    }

    fn refill(&self, requested: usize, retired: Address, retired_size: usize) -> Span {
        // Keep the heap parsable over the dead tail; sweeping reclaims
        // it precisely later.
        retire_chunk(retired, retired_size, usize::MAX);
        self.provider.take_refill_span(requested)
    }

    fn allocate_overflow(&self, size: usize) -> Address {
        self.provider.allocate_overflow(size)
    }

    fn allocate_large(&self, size: usize) -> Address {
        self.provider.allocate_large(size)
    }

    fn large_object_threshold(&self) -> usize {
        self.large_threshold
    }
}

/// Per-space tunables, defaulted from the environment.
pub struct SpaceOptions {
    pub min_tlab_size: usize,
    pub min_chunk_size: usize,
    pub min_reclaimable: usize,
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            min_tlab_size: *crate::args::MIN_TLAB_SIZE,
            min_chunk_size: *crate::args::MIN_FREE_CHUNK_SIZE,
            min_reclaimable: *crate::args::MIN_RECLAIMABLE_SPACE,
        }
    }
}

pub struct MarkSweepSpace {
    provider: Arc<RegionProvider>,
    object_model: Arc<dyn ObjectModel>,
    small: BumpAllocator<SpaceRefiller>,
    tlab: TlabAllocator<SpaceRefiller>,
    min_reclaimable: usize,
}

impl MarkSweepSpace {
    pub fn new(
        provider: Arc<RegionProvider>,
        object_model: Arc<dyn ObjectModel>,
        options: SpaceOptions,
    ) -> Self {
        let region_bytes = provider.table().region_bytes();
        let overflow_threshold = region_bytes / 8;
        let large_threshold = region_bytes / 2;
        let small = BumpAllocator::new(SpaceRefiller::new(
            provider.clone(),
            overflow_threshold,
            large_threshold,
        ));
        let tlab = TlabAllocator::new(
            SpaceRefiller::new(provider.clone(), overflow_threshold, large_threshold),
            options.min_tlab_size,
            options.min_chunk_size,
        );
        Self {
            provider,
            object_model,
            small,
            tlab,
            min_reclaimable: options.min_reclaimable,
        }
    }

    pub fn provider(&self) -> &Arc<RegionProvider> {
        &self.provider
    }

    pub fn min_reclaimable(&self) -> usize {
        self.min_reclaimable
    }

    /// Retire both allocators and quiesce region bookkeeping so every
    /// small-account region is parsable for marking and sweeping.
    pub fn prepare_for_collection(&self) {
        for span in [self.small.retire(), self.tlab.retire()] {
            if !span.is_empty() {
                retire_chunk(span.start, span.size, usize::MAX);
            }
        }
        self.provider.quiesce_for_collection();
    }
}

impl HeapSpace for MarkSweepSpace {
    fn allocate(&self, size: usize) -> Address {
        self.small.allocate(size)
    }

    fn allocate_tlab(&self, size: usize) -> Address {
        self.tlab.allocate_tlab(size)
    }

    fn retire_tlab(&self, chunk_list: Address) {
        if !chunk_list.is_zero() {
            self.provider.retire_chunk_list(chunk_list);
        }
    }

    fn free_space(&self) -> usize {
        self.provider.free_bytes() + self.small.space_left()
    }

    fn used_space(&self) -> usize {
        self.committed_space().saturating_sub(self.free_space())
    }

    fn committed_space(&self) -> usize {
        self.provider.committed_regions() * self.provider.table().region_bytes()
    }

    fn capacity(&self) -> usize {
        self.provider.table().num_regions() * self.provider.table().region_bytes()
    }

    fn visit_cells(&self, visitor: &mut dyn FnMut(Address, usize)) {
        let table = self.provider.table();
        for (id, info) in table.iter_infos() {
            if info.owner() != ACCOUNT_SMALL
                || !info.is(crate::heap::region::flags::ITERABLE)
            {
                continue;
            }
            let mut cell = table.region_start(id);
            let end = table.region_end(id);
            while cell < end {
                let size = if unsafe { free_chunk::is_dead_cell(cell) } {
                    unsafe { free_chunk::size_of(cell) }
                } else {
                    let size = self.object_model.size_of(cell);
                    visitor(cell, size);
                    size
                };
                debug_assert!(size > 0);
                cell += size;
            }
        }
    }
}
