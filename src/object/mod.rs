//! Object-layout introspection contract. The substrate never decodes
//! object layouts itself; everything it needs from the managed
//! language's object model goes through this trait.

use crate::util::Address;

/// Uniform view of managed objects. A "cell" is the first word of an
/// object's storage; all addresses handed to this trait are cells of
/// live objects inside the covered heap.
///
/// Implementations must tolerate concurrent read-only calls from
/// multiple collector threads.
pub trait ObjectModel: Sync + Send {
    /// The type-descriptor reference stored in the object's header, or
    /// [`Address::ZERO`] when the descriptor lives outside the managed
    /// heap. The marker traces this like any other reference.
    fn descriptor_of(&self, cell: Address) -> Address;

    /// Total size in bytes of the object starting at `cell`, including
    /// headers and alignment padding. Always a multiple of the word
    /// size and at least [`MIN_CELL_SIZE`](crate::util::constants::MIN_CELL_SIZE).
    fn size_of(&self, cell: Address) -> usize;

    /// Enumerate the object's reference slots, passing each non-null
    /// referent cell address to `visitor`. Covers tuple, hybrid and
    /// reference-array layouts uniformly.
    fn for_each_reference(&self, cell: Address, visitor: &mut dyn FnMut(Address));

    /// Read a previously installed forwarding pointer, if any.
    fn forwarding_of(&self, cell: Address) -> Option<Address>;

    /// Destroy the object's header by installing a forwarding pointer
    /// to `target`. Only called during evacuation, on objects whose
    /// contents have already been copied out.
    fn forward_to(&self, cell: Address, target: Address);

    /// Rewrite every reference slot in place through `f`. Used by the
    /// evacuator to redirect references to moved objects.
    fn update_references(&self, cell: Address, f: &mut dyn FnMut(Address) -> Address);
}

pub mod testing {
    //! A minimal object model used by the crate's own tests: cells are
    //! `[size, nrefs, ref0, ref1, ..]` with word-sized fields.

    use super::ObjectModel;
    use crate::util::constants::{BYTES_IN_WORD, MIN_CELL_SIZE};
    use crate::util::Address;

    /// Header bit marking a forwarded cell. Cell sizes and addresses
    /// are word-aligned, so the low bits of the first word are free.
    const FORWARDED: usize = 0b10;

    pub struct TestObjectModel;

    impl TestObjectModel {
        /// Format an object of `size` bytes with the given references
        /// at `cell`. The caller owns the backing storage.
        ///
        /// # Safety
        /// `[cell, cell + size)` must be writable and word-aligned.
        pub unsafe fn format(cell: Address, size: usize, refs: &[Address]) {
            assert!(size >= MIN_CELL_SIZE + refs.len() * BYTES_IN_WORD);
            assert!(size % BYTES_IN_WORD == 0);
            cell.store(size);
            (cell + BYTES_IN_WORD).store(refs.len());
            for (i, r) in refs.iter().enumerate() {
                (cell + (2 + i) * BYTES_IN_WORD).store(*r);
            }
        }

        /// Overwrite reference slot `slot` of the object at `cell`.
        ///
        /// # Safety
        /// `cell` must be a formatted test object with at least
        /// `slot + 1` reference slots.
        pub unsafe fn set_ref(cell: Address, slot: usize, r: Address) {
            debug_assert!(slot < (cell + BYTES_IN_WORD).load::<usize>());
            (cell + (2 + slot) * BYTES_IN_WORD).store(r);
        }
    }

    impl ObjectModel for TestObjectModel {
        fn descriptor_of(&self, _cell: Address) -> Address {
            Address::ZERO
        }

        fn size_of(&self, cell: Address) -> usize {
            let header: usize = unsafe { cell.load() };
            debug_assert!(header & FORWARDED == 0, "size_of on forwarded cell {cell}");
            header
        }

        fn for_each_reference(&self, cell: Address, visitor: &mut dyn FnMut(Address)) {
            let nrefs: usize = unsafe { (cell + BYTES_IN_WORD).load() };
            for i in 0..nrefs {
                let r: Address = unsafe { (cell + (2 + i) * BYTES_IN_WORD).load() };
                if !r.is_zero() {
                    visitor(r);
                }
            }
        }

        fn forwarding_of(&self, cell: Address) -> Option<Address> {
            let header: usize = unsafe { cell.load() };
            if header & FORWARDED != 0 {
                Some(unsafe { Address::from_usize(header & !(BYTES_IN_WORD - 1)) })
            } else {
                None
            }
        }

        fn forward_to(&self, cell: Address, target: Address) {
            debug_assert!(target.is_aligned_to(BYTES_IN_WORD));
            unsafe { cell.store(target.as_usize() | FORWARDED) };
        }

        fn update_references(&self, cell: Address, f: &mut dyn FnMut(Address) -> Address) {
            let nrefs: usize = unsafe { (cell + BYTES_IN_WORD).load() };
            for i in 0..nrefs {
                let slot = cell + (2 + i) * BYTES_IN_WORD;
                let r: Address = unsafe { slot.load() };
                if !r.is_zero() {
                    unsafe { slot.store(f(r)) };
                }
            }
        }
    }
}
