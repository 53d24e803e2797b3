//! Environment-tunable knobs. Every tunable has a reasonable default;
//! the env var only overrides it. Per-heap settings live in
//! [`HeapOptions`](crate::HeapOptions); these statics provide defaults.

use spin::Lazy;
use std::env;

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|x| x.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|x| x != "0")
        .unwrap_or(default)
}

/// Use the rescan map when recovering from mark-stack overflow, instead
/// of a linear rescan of the color map.
pub static USE_RESCAN_MAP: Lazy<bool> = Lazy::new(|| env_bool("REGC_USE_RESCAN_MAP", false));

/// Capacity of the bounded marking stack, in entries.
pub static MARK_STACK_CAPACITY: Lazy<usize> =
    Lazy::new(|| env_usize("REGC_MARK_STACK_CAPACITY", 16 * 1024));

/// Dead gaps smaller than this many bytes are left in place as dark
/// matter instead of being reclaimed. Tunable, not load-bearing.
pub static MIN_RECLAIMABLE_SPACE: Lazy<usize> =
    Lazy::new(|| env_usize("REGC_MIN_RECLAIMABLE_SPACE", 256));

/// Smallest leftover worth formatting as a reusable free chunk when an
/// allocator retires its current span.
pub static MIN_FREE_CHUNK_SIZE: Lazy<usize> =
    Lazy::new(|| env_usize("REGC_MIN_FREE_CHUNK_SIZE", 256));

/// Smallest TLAB refill worth handing to a mutator, in bytes.
pub static MIN_TLAB_SIZE: Lazy<usize> = Lazy::new(|| env_usize("REGC_MIN_TLAB_SIZE", 2 * 1024));

/// Grow the heap after GC when live occupancy exceeds this percentage.
pub static HEAP_GROW_PERCENT: Lazy<usize> = Lazy::new(|| env_usize("REGC_HEAP_GROW_PERCENT", 70));

/// Shrink the heap after GC when live occupancy drops below this
/// percentage.
pub static HEAP_SHRINK_PERCENT: Lazy<usize> =
    Lazy::new(|| env_usize("REGC_HEAP_SHRINK_PERCENT", 40));

/// Verify black closure and grey absence after every mark phase.
pub static VERIFY_AFTER_MARKING: Lazy<bool> =
    Lazy::new(|| env_bool("REGC_VERIFY_AFTER_MARKING", cfg!(debug_assertions)));

/// Trace every mark update. Extremely verbose.
pub static TRACE_MARKING: Lazy<bool> = Lazy::new(|| env_bool("REGC_TRACE_MARKING", false));
