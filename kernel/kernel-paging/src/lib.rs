//! # Two-Level Paging Manager
//!
//! Owns the 32-bit x86 page-table format and the **address space**
//! abstraction: one page directory per process plus one for the kernel
//! itself.
//!
//! ## Virtual Address → Physical Frame Walk
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//!
//!  CR3 → Page Directory → Page Table → Physical Frame
//! ```
//!
//! Both levels are 1024 four-byte entries ([`PageEntryBits`]). The upper
//! region of every directory (the kernel half) is populated from the same
//! set of immortal kernel page tables, so kernel mappings are identical in
//! every address space and never reference-counted.
//!
//! ## Editing tables that are not mapped
//!
//! Page tables live in physical frames, and the kernel can only dereference
//! virtual addresses. Two fixed windows solve this (their addresses are ABI,
//! see `kernel-info`):
//!
//! * **Recursive self-map** — the last directory slot points at the
//!   directory's own frame, which makes every table of the *active* space
//!   visible at a fixed window.
//! * **Quickmap scratch pages** — two reserved virtual pages that can
//!   transiently map an arbitrary frame, e.g. a table of a *different*
//!   address space, or the two sides of a frame copy during cloning.
//!
//! Code never touches these windows directly; it goes through the
//! [`TableWindows`] capability, whose scoped-closure API guarantees the
//! window is released on every exit path. The kernel implementation is
//! [`Quickmap`]; tests substitute a simulated RAM.
//!
//! ## Failure semantics
//!
//! Running out of physical frames is a recoverable [`MapError`]; the
//! quickmap slot assertions and unmapping an unmapped page are kernel bugs
//! and panic.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod entry;
mod quickmap;
mod table;

pub use address_space::AddressSpace;
pub use entry::PageEntryBits;
pub use quickmap::Quickmap;
pub use table::{PageDirectory, PageTable};

use kernel_addresses::{PAGE_BYTES, PhysicalPage, VirtualAddress};

bitflags::bitflags! {
    /// Protection and sharing flags for a mapping, as callers see them.
    /// Translated into hardware [`PageEntryBits`] in exactly one place.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Writes are allowed.
        const WRITABLE = 1 << 0;
        /// User mode (CPL 3) may access the page.
        const USER     = 1 << 1;
        /// The frame is deliberately shared between address spaces;
        /// cloning aliases it instead of copying.
        const SHARED   = 1 << 2;
        /// Disable caching, for device memory.
        const UNCACHED = 1 << 3;
    }
}

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Ran out of physical frames. Nothing is rolled back: `mapped_bytes`
    /// pages at the start of the requested range were installed and the
    /// caller must unmap them.
    #[error("out of physical memory ({mapped_bytes} bytes of the range were mapped)")]
    OutOfMemory { mapped_bytes: u32 },

    /// Address or size is not page-aligned.
    #[error("address or size is not page-aligned")]
    Misaligned,
}

/// Scoped access to physical frames for table edits and page copies.
///
/// Acquisition and release are tied to the closure scope, so a window can
/// not leak on an early return. Implementations: [`Quickmap`] over the two
/// reserved scratch slots in the kernel, simulated RAM in tests.
pub trait TableWindows {
    /// Run `f` over the frame viewed as a page table.
    fn with_table<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut PageTable) -> R) -> R;

    /// Run `f` over the raw bytes of the frame.
    fn with_frame<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut [u8; PAGE_BYTES]) -> R) -> R;

    /// Copy one whole frame. Needs two windows at once, which is exactly
    /// why two quickmap slots are reserved.
    fn copy_frame(&self, dst: PhysicalPage, src: PhysicalPage);
}

/// Drop one virtual address from the translation cache.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = va;
}
