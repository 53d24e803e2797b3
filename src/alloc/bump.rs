//! Lock-free bump-pointer allocation with a mutual-exclusion refill
//! path.
//!
//! Fast path: read `top`, compute `top + size`, compare-exchange `top`
//! forward, retry on contention. Threads never observe overlapping
//! cells: only a successful compare-exchange hands out a range, and
//! each success moves `top` strictly forward.
//!
//! Slow path: the refill lock serializes span replacement. The winner
//! re-checks the race (another thread may have refilled first), claims
//! whatever is left of the span with an atomic top-to-limit swap,
//! retires it through the refiller and installs a fresh span. While a
//! new span is being installed, `limit` is parked at zero so every
//! racing fast path fails into the lock instead of allocating from a
//! half-installed span.

use atomic::{Atomic, Ordering};
use log::trace;
use spin::Mutex;

use crate::alloc::refill::{Refiller, Span};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

pub struct BumpAllocator<R: Refiller> {
    start: Atomic<Address>,
    top: Atomic<Address>,
    limit: Atomic<Address>,
    refill_lock: Mutex<()>,
    refiller: R,
}

impl<R: Refiller> BumpAllocator<R> {
    pub fn new(refiller: R) -> Self {
        Self {
            start: Atomic::new(Address::ZERO),
            top: Atomic::new(Address::ZERO),
            limit: Atomic::new(Address::ZERO),
            refill_lock: Mutex::new(()),
            refiller,
        }
    }

    pub fn refiller(&self) -> &R {
        &self.refiller
    }

    pub fn span_start(&self) -> Address {
        self.start.load(Ordering::Relaxed)
    }

    pub fn top(&self) -> Address {
        self.top.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Address {
        self.limit.load(Ordering::Relaxed)
    }

    /// Unused space of the current span.
    pub fn space_left(&self) -> usize {
        let top = self.top.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        if top.is_zero() || limit < top {
            0
        } else {
            limit - top
        }
    }

    /// Allocate `size` bytes. Returns zero only when the refiller is
    /// out of memory; the caller owns the collect-and-retry policy.
    pub fn allocate(&self, size: usize) -> Address {
        debug_assert!(size % BYTES_IN_WORD == 0);
        debug_assert!(size > 0);
        loop {
            let top = self.top.load(Ordering::Acquire);
            let limit = self.limit.load(Ordering::Acquire);
            if top.is_zero() || limit < top || limit - top < size {
                match self.refill_or_allocate(size) {
                    Some(result) => return result,
                    // Someone else refilled; take the fast path again.
                    None => continue,
                }
            }
            let new_top = top + size;
            if self
                .top
                .compare_exchange(top, new_top, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return top;
            }
        }
    }

    /// Allocate zero-filled storage.
    pub fn allocate_cleared(&self, size: usize) -> Address {
        let cell = self.allocate(size);
        if !cell.is_zero() {
            unsafe { crate::util::memory::zero(cell, size) };
        }
        cell
    }

    fn refill_or_allocate(&self, size: usize) -> Option<Address> {
        let _guard = self.refill_lock.lock();
        // Re-check under the lock: a competing thread may have refilled
        // while we waited.
        let top = self.top.load(Ordering::Acquire);
        let limit = self.limit.load(Ordering::Acquire);
        if !top.is_zero() && limit >= top && limit - top >= size {
            return None;
        }
        let space_left = if top.is_zero() || limit < top {
            0
        } else {
            limit - top
        };
        if !self.refiller.should_refill(size, space_left) {
            trace!("bump allocator: routing {size}B around the bump pointer");
            return Some(if size >= self.refiller.large_object_threshold() {
                self.refiller.allocate_large(size)
            } else {
                self.refiller.allocate_overflow(size)
            });
        }
        // Claim everything left in one atomic swap; racing fast paths
        // now always fail into the lock.
        let leftover_start = self.top.swap(limit, Ordering::SeqCst);
        let leftover = if leftover_start.is_zero() || limit < leftover_start {
            0
        } else {
            limit - leftover_start
        };
        let span = self.refiller.refill(size, leftover_start, leftover);
        if span.is_empty() {
            return Some(Address::ZERO);
        }
        debug_assert!(span.size >= size, "refill span smaller than the request");
        // Park the limit before touching top so no racer can use a
        // half-installed span, then publish the new limit last.
        self.limit.store(Address::ZERO, Ordering::SeqCst);
        let result = span.start;
        self.start.store(span.start, Ordering::SeqCst);
        self.top.store(span.start + size, Ordering::SeqCst);
        self.limit.store(span.end(), Ordering::SeqCst);
        trace!(
            "bump allocator refilled: [{}, {}), serviced {size}B",
            span.start,
            span.end()
        );
        Some(result)
    }

    /// Install a span directly (initialization and tests).
    pub fn reset(&self, span: Span) {
        let _guard = self.refill_lock.lock();
        self.limit.store(Address::ZERO, Ordering::SeqCst);
        self.start.store(span.start, Ordering::SeqCst);
        self.top.store(span.start, Ordering::SeqCst);
        self.limit.store(span.end(), Ordering::SeqCst);
    }

    /// Claim and return the unused tail of the current span, leaving
    /// the allocator empty. Used when retiring the allocator at GC.
    pub fn retire(&self) -> Span {
        let _guard = self.refill_lock.lock();
        let limit = self.limit.load(Ordering::Acquire);
        let top = self.top.swap(limit, Ordering::SeqCst);
        self.limit.store(Address::ZERO, Ordering::SeqCst);
        self.start.store(Address::ZERO, Ordering::SeqCst);
        self.top.store(Address::ZERO, Ordering::SeqCst);
        if top.is_zero() || limit <= top {
            Span::EMPTY
        } else {
            Span::new(top, limit - top)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::VirtualMemory;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Hands out fixed-size spans from a reserved area until it runs
    /// dry.
    struct ArenaRefiller {
        base: Address,
        arena_size: usize,
        span_size: usize,
        cursor: AtomicUsize,
        retired: Mutex<Vec<Span>>,
    }

    impl ArenaRefiller {
        fn new(vm: &VirtualMemory, span_size: usize) -> Self {
            Self {
                base: vm.start(),
                arena_size: vm.size(),
                span_size,
                cursor: AtomicUsize::new(0),
                retired: Mutex::new(vec![]),
            }
        }
    }

    impl Refiller for ArenaRefiller {
        fn should_refill(&self, _requested: usize, _left: usize) -> bool {
            true
        }

        fn refill(&self, _requested: usize, retired: Address, retired_size: usize) -> Span {
            if retired_size > 0 {
                self.retired.lock().push(Span::new(retired, retired_size));
            }
            let offset = self.cursor.fetch_add(self.span_size, atomic::Ordering::SeqCst);
            if offset + self.span_size > self.arena_size {
                return Span::EMPTY;
            }
            Span::new(self.base + offset, self.span_size)
        }

        fn allocate_overflow(&self, _size: usize) -> Address {
            unreachable!()
        }

        fn allocate_large(&self, _size: usize) -> Address {
            unreachable!()
        }
    }

    #[test]
    fn sequential_allocations_are_adjacent() {
        let vm = VirtualMemory::reserve(1 << 16, 4096).unwrap();
        let a = BumpAllocator::new(ArenaRefiller::new(&vm, 1 << 16));
        let first = a.allocate(64);
        let second = a.allocate(32);
        assert_eq!(second, first + 64usize);
        assert_eq!(a.space_left(), (1 << 16) - 96);
    }

    #[test]
    fn exhaustion_returns_zero() {
        let vm = VirtualMemory::reserve(8192, 4096).unwrap();
        let a = BumpAllocator::new(ArenaRefiller::new(&vm, 4096));
        let mut total = 0;
        loop {
            let cell = a.allocate(1024);
            if cell.is_zero() {
                break;
            }
            total += 1024;
        }
        assert_eq!(total, 8192);
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let vm = VirtualMemory::reserve(1 << 20, 4096).unwrap();
        let base = vm.start();
        let a = Arc::new(BumpAllocator::new(ArenaRefiller::new(&vm, 1 << 14)));
        let mut handles = vec![];
        for t in 0..8 {
            let a = a.clone();
            handles.push(std::thread::spawn(move || {
                let mut cells = vec![];
                let size = 16 + (t % 4) * 16;
                for _ in 0..400 {
                    let cell = a.allocate(size);
                    assert!(!cell.is_zero());
                    cells.push((cell, size));
                }
                cells
            }));
        }
        let mut all: Vec<(Address, usize)> = vec![];
        for h in handles {
            all.extend(h.join().unwrap());
        }
        // Pairwise disjoint and in-arena.
        all.sort();
        for w in all.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "overlap: {w:?}");
        }
        for &(cell, size) in &all {
            assert!(cell >= base && cell + size <= base + (1usize << 20));
        }
    }
}
