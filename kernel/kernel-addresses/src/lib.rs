//! # Physical and Virtual Memory Addresses
//!
//! Tiny `u32` newtypes so physical and virtual addresses cannot be mixed by
//! accident, plus page-granular wrappers ([`PhysicalPage`], [`VirtualPage`])
//! and the index helpers for the two-level x86 table walk.
//!
//! ## 32-bit Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! The CPU uses the two index fields to walk two levels of tables, each
//! holding 1024 four-byte entries:
//!
//! ```text
//!  Page Directory  →  Page Table  →  Physical Frame
//!   (dir index)        (table index)    (offset)
//! ```
//!
//! The directory is referenced by CR3; one directory per address space.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::ops::{Add, AddAssign, Sub};

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// [`PAGE_SIZE`] as a `usize`, for slice lengths and indexing.
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Entries per page directory or page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Bytes of virtual address space covered by one directory slot.
pub const DIRECTORY_SPAN: u32 = PAGE_SIZE * TABLE_ENTRIES as u32;

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u32` to prevent mixing with virtual addresses.
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u32);

/// A **virtual** memory address (process or kernel address space).
///
/// Newtype over `u32` to prevent mixing with physical addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u32);

impl PhysicalAddress {
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The physical page containing this address.
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage(self.0 / PAGE_SIZE)
    }

    /// Byte offset of this address inside its page.
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 % PAGE_SIZE
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl VirtualAddress {
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The virtual page containing this address.
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage(self.0 / PAGE_SIZE)
    }

    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 % PAGE_SIZE
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Page-directory index (bits 31-22 of the virtual address).
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Page-table index (bits 21-12 of the virtual address).
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3ff) as usize
    }
}

/// A 4 KiB-aligned physical frame, identified by its frame number.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

/// A 4 KiB-aligned virtual page, identified by its page number.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u32);

impl PhysicalPage {
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Frame number of this page.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Base address of this page.
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0 * PAGE_SIZE)
    }
}

impl VirtualPage {
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0 * PAGE_SIZE)
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two; for other values the result is
/// meaningless. If `x` is already aligned it is returned unchanged.
///
/// ### Examples
/// ```rust
/// # use kernel_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two, and `x + (a - 1)` must not
/// overflow `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

impl Add<u32> for VirtualAddress {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("VirtualAddress add"))
    }
}

impl Add<u32> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("PhysicalAddress add"))
    }
}

impl AddAssign<u32> for VirtualAddress {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl AddAssign<u32> for PhysicalAddress {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<Self> for VirtualAddress {
    type Output = u32;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("VirtualAddress sub")
    }
}

impl Sub<Self> for PhysicalAddress {
    type Output = u32;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("PhysicalAddress sub")
    }
}

impl core::fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "P{:#010x}", self.0)
    }
}

impl core::fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl core::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "V{:#010x}", self.0)
    }
}

impl core::fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl core::fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "frame #{} ({})", self.0, self.base())
    }
}

impl core::fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "page #{} ({})", self.0, self.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_indices_split_the_address() {
        let va = VirtualAddress::new(0xC070_3123);
        assert_eq!(va.directory_index(), 0xC070_3123 >> 22);
        assert_eq!(va.table_index(), (0xC070_3123 >> 12) & 0x3ff);
        assert_eq!(va.page_offset(), 0x123);

        // index fields reassemble to the page base
        let base = (va.directory_index() as u32) * DIRECTORY_SPAN
            + (va.table_index() as u32) * PAGE_SIZE;
        assert_eq!(base, va.page().base().as_u32());
    }

    #[test]
    fn pages_round_trip_through_addresses() {
        let page = PhysicalPage::from_index(7);
        assert_eq!(page.base().as_u32(), 7 * PAGE_SIZE);
        assert_eq!(page.base().page(), page);
        assert!(page.base().is_page_aligned());
        assert!(!(page.base() + 1).is_page_aligned());
    }

    #[test]
    fn address_arithmetic() {
        let a = VirtualAddress::new(0x1000);
        assert_eq!((a + 0x234).as_u32(), 0x1234);
        assert_eq!((a + 0x234) - a, 0x234);
    }

    #[test]
    #[should_panic(expected = "VirtualAddress add")]
    fn address_overflow_panics() {
        let _ = VirtualAddress::new(u32::MAX) + 1;
    }
}
