//! TLAB refill: carve thread-local allocation buffers out of a bump
//! span, handing them to mutators as zero-initialized chunk lists.

use atomic::{Atomic, Ordering};
use log::trace;
use spin::Mutex;

use crate::alloc::refill::{retire_chunk, Refiller, Span};
use crate::heap::free_chunk;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

pub struct TlabAllocator<R: Refiller> {
    top: Atomic<Address>,
    limit: Atomic<Address>,
    refill_lock: Mutex<()>,
    /// Don't hand out a TLAB smaller than this.
    min_tlab_size: usize,
    /// Leftovers below this become dead filler instead of a chunk.
    min_chunk_size: usize,
    refiller: R,
}

impl<R: Refiller> TlabAllocator<R> {
    pub fn new(refiller: R, min_tlab_size: usize, min_chunk_size: usize) -> Self {
        Self {
            top: Atomic::new(Address::ZERO),
            limit: Atomic::new(Address::ZERO),
            refill_lock: Mutex::new(()),
            min_tlab_size,
            min_chunk_size,
            refiller,
        }
    }

    pub fn refiller(&self) -> &R {
        &self.refiller
    }

    /// Carve `[cell, cell + size)` out of the current span by CAS.
    fn try_carve(&self, size: usize) -> Option<Address> {
        loop {
            let top = self.top.load(Ordering::Acquire);
            let limit = self.limit.load(Ordering::Acquire);
            if top.is_zero() || limit < top || limit - top < size {
                return None;
            }
            if self
                .top
                .compare_exchange(top, top + size, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(top);
            }
        }
    }

    /// Format a carved span as a single zero-filled TLAB chunk.
    fn format_tlab_chunk(&self, start: Address, size: usize) -> Address {
        unsafe {
            crate::util::memory::zero(start, size);
            free_chunk::format(start, size);
        }
        start
    }

    /// Allocate a TLAB of roughly `requested` bytes. Returns the head
    /// of a free-chunk list (usually a single chunk), or zero when
    /// memory is exhausted. Every returned chunk is zero-filled behind
    /// its header: TLAB space is handed to the mutator as
    /// zero-initialized object storage.
    pub fn allocate_tlab(&self, requested: usize) -> Address {
        debug_assert!(requested % BYTES_IN_WORD == 0);
        let requested = requested.max(self.min_tlab_size);
        if let Some(cell) = self.try_carve(requested) {
            return self.format_tlab_chunk(cell, requested);
        }
        self.refill_and_allocate(requested)
    }

    fn refill_and_allocate(&self, requested: usize) -> Address {
        let _guard = self.refill_lock.lock();
        // The race may already be resolved.
        if let Some(cell) = self.try_carve(requested) {
            return self.format_tlab_chunk(cell, requested);
        }
        // Claim the leftover; if it is still a useful TLAB, hand it
        // out as-is rather than splitting a fresh span.
        let limit = self.limit.load(Ordering::Acquire);
        let leftover_start = self.top.swap(limit, Ordering::SeqCst);
        let leftover = if leftover_start.is_zero() || limit < leftover_start {
            0
        } else {
            limit - leftover_start
        };
        if leftover >= self.min_tlab_size {
            return self.format_tlab_chunk(leftover_start, leftover);
        }
        // Too small for a TLAB of its own: make it the first chunk of
        // the list (or dead filler) and refill.
        let first_chunk = retire_chunk(leftover_start, leftover, self.min_chunk_size);
        let still_needed = if first_chunk.is_zero() {
            requested
        } else {
            unsafe { crate::util::memory::zero(first_chunk + 2 * BYTES_IN_WORD, leftover - 2 * BYTES_IN_WORD) };
            requested.saturating_sub(leftover)
        };
        let span = self.refiller.refill(still_needed, Address::ZERO, 0);
        if span.is_empty() {
            trace!("TLAB refill failed, leftover chunk only");
            return first_chunk;
        }
        self.limit.store(Address::ZERO, Ordering::SeqCst);
        let carved = still_needed.min(span.size);
        self.top.store(span.start + carved, Ordering::SeqCst);
        self.limit.store(span.end(), Ordering::SeqCst);
        let chunk = self.format_tlab_chunk(span.start, carved);
        if first_chunk.is_zero() {
            chunk
        } else {
            unsafe { free_chunk::set_next(first_chunk, chunk) };
            first_chunk
        }
    }

    /// Claim and return the unused tail, leaving the allocator empty.
    pub fn retire(&self) -> Span {
        let _guard = self.refill_lock.lock();
        let limit = self.limit.load(Ordering::Acquire);
        let top = self.top.swap(limit, Ordering::SeqCst);
        self.limit.store(Address::ZERO, Ordering::SeqCst);
        self.top.store(Address::ZERO, Ordering::SeqCst);
        if top.is_zero() || limit <= top {
            Span::EMPTY
        } else {
            Span::new(top, limit - top)
        }
    }
}
