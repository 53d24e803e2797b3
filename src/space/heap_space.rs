//! The contract a heap space exposes to the runtime.

use crate::util::Address;

/// Allocation and accounting surface of one logical sub-heap.
pub trait HeapSpace: Send + Sync {
    /// Allocate `size` bytes, zero on exhaustion (the caller runs the
    /// collection-retry loop).
    fn allocate(&self, size: usize) -> Address;

    /// Allocate a thread-local allocation buffer of roughly `size`
    /// bytes as a zero-filled free-chunk list, zero on exhaustion.
    fn allocate_tlab(&self, size: usize) -> Address;

    /// Hand back the unused chunks of a retired TLAB.
    fn retire_tlab(&self, chunk_list: Address);

    /// Reusable bytes currently available without collecting.
    fn free_space(&self) -> usize;

    /// Bytes occupied by live data plus dark matter.
    fn used_space(&self) -> usize;

    /// Committed bytes of this space.
    fn committed_space(&self) -> usize;

    /// Upper bound `committed_space` can grow to.
    fn capacity(&self) -> usize;

    /// Visit every live cell as `(cell, size)`. Only valid when the
    /// space is parsable (mutators stopped, allocators retired).
    fn visit_cells(&self, visitor: &mut dyn FnMut(Address, usize));
}
