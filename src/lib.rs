//! A region-based, incremental, concurrent-tolerant garbage-collection
//! substrate: a tracing mark-sweep-evacuate heap manager over
//! fixed-size regions.
//!
//! The crate is organised around a few cooperating subsystems:
//! * [Region bookkeeping](heap/index.html): the region table and state
//!   machine, intrusive region lists with range coalescing, and the
//!   byte-mapped card and first-object tables.
//! * [Allocators](alloc/index.html): lock-free bump-pointer allocation
//!   with pluggable refill policies, TLAB and card-space variants.
//! * [Marking](mark/index.html): the tricolor mark bitmap with a
//!   forward-scan finger, a bounded marking stack and two overflow
//!   recovery strategies.
//! * [Sweeping](sweep/index.html): imprecise region sweeping into
//!   in-place free-chunk lists with dark-matter accounting.
//! * [Spaces](space/index.html): the first-fit mark-sweep space, the
//!   boundary-tagged large-object space, and the [`Heap`] context that
//!   drives whole collection cycles.
//! * [Evacuation](evac/index.html): promotion-buffer copying with
//!   dirty-card remembered-set scanning.
//!
//! Object layout, root enumeration and the mutator's write barrier are
//! collaborator contracts (see [`object::ObjectModel`]); the substrate
//! never decodes objects itself.

#[macro_use]
pub mod gc_log;

pub mod alloc;
pub mod args;
pub mod evac;
pub mod heap;
pub mod mark;
pub mod object;
pub mod space;
pub mod sweep;
pub mod util;
pub mod verify;

pub use crate::mark::marker::{Coverage, HeapMarker, OverflowStrategy};
pub use crate::object::ObjectModel;
pub use crate::space::heap::{Heap, HeapError, HeapOptions};
pub use crate::space::heap_space::HeapSpace;
pub use crate::util::Address;
pub use crate::verify::VerifyOutcome;

static BOOT_TIME: spin::Lazy<std::time::SystemTime> = spin::Lazy::new(std::time::SystemTime::now);

/// Seconds since the process first touched this crate, for log stamps.
pub fn boot_time_secs() -> f64 {
    BOOT_TIME.elapsed().map(|d| d.as_secs_f64()).unwrap_or(0.0)
}
