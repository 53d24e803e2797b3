use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// Address represents an arbitrary heap address. This is designed to
/// represent addresses and do address arithmetic mostly in a safe way,
/// and to mark some operations as unsafe. The type is zero overhead,
/// memory wise and time wise.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Address = Address(0);
    /// The highest possible address.
    pub const MAX: Address = Address(usize::MAX);

    /// Construct an address from a usize. It is unsafe because it can be
    /// used to forge arbitrary heap pointers.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Construct an address from a shared reference.
    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// Construct an address from a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// Construct an address from a raw mutable pointer.
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// The numerical value of the address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Is this the zero address?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Align the address up to the given power of two.
    pub const fn align_up(self, align: ByteSize) -> Address {
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given power of two.
    pub const fn align_down(self, align: ByteSize) -> Address {
        Address(self.0 & !(align - 1))
    }

    /// Is the address aligned to the given power of two?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Convert to a const pointer.
    pub const fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mutable pointer.
    pub const fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Load a value of type T at this address.
    ///
    /// # Safety
    /// The address must hold a valid, aligned T.
    pub unsafe fn load<T: Copy>(self) -> T {
        debug_assert!(!self.is_zero());
        debug_assert!(self.is_aligned_to(std::mem::align_of::<T>()));
        *(self.0 as *const T)
    }

    /// Store a value of type T at this address.
    ///
    /// # Safety
    /// The address must be valid, writable storage for an aligned T.
    pub unsafe fn store<T>(self, value: T) {
        debug_assert!(!self.is_zero());
        debug_assert!(self.is_aligned_to(std::mem::align_of::<T>()));
        *(self.0 as *mut T) = value;
    }

    /// View the word at this address as an atomic cell.
    ///
    /// # Safety
    /// The address must be valid, word-aligned shared storage.
    pub unsafe fn as_atomic_word(self) -> &'static AtomicUsize {
        debug_assert!(self.is_aligned_to(std::mem::align_of::<usize>()));
        &*(self.0 as *const AtomicUsize)
    }

    /// View the byte at this address as an atomic cell.
    ///
    /// # Safety
    /// The address must be valid shared storage.
    pub unsafe fn as_atomic_byte(self) -> &'static AtomicU8 {
        &*(self.0 as *const AtomicU8)
    }

    /// Atomically load the word at this address.
    ///
    /// # Safety
    /// See [`Address::as_atomic_word`].
    pub unsafe fn atomic_load_word(self, order: Ordering) -> usize {
        self.as_atomic_word().load(order)
    }

    /// Atomically store a word at this address.
    ///
    /// # Safety
    /// See [`Address::as_atomic_word`].
    pub unsafe fn atomic_store_word(self, value: usize, order: Ordering) {
        self.as_atomic_word().store(value, order)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_down() {
        let a = unsafe { Address::from_usize(0x1001) };
        assert_eq!(a.align_down(0x1000).as_usize(), 0x1000);
        assert_eq!(a.align_up(0x1000).as_usize(), 0x2000);
        assert!(a.align_down(8).is_aligned_to(8));
    }

    #[test]
    fn arithmetic() {
        let a = unsafe { Address::from_usize(0x4000) };
        assert_eq!((a + 16usize) - a, 16);
        assert_eq!(a + (-8isize), a - 8usize);
        assert_eq!(a >> 12, 4);
    }

    #[test]
    fn load_store_roundtrip() {
        let mut slot: usize = 0;
        let a = Address::from_mut_ptr(&mut slot);
        unsafe { a.store(42usize) };
        assert_eq!(unsafe { a.load::<usize>() }, 42);
    }
}
