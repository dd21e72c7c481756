//! # Memory Layout
//!
//! The fixed virtual-address layout shared between this core and the
//! boot-time setup code. These values are an ABI: the reserved directory
//! slots, the recursive self-map window, and the quickmap scratch pages are
//! baked into early assembly and must never vary at runtime.

#![no_std]

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Bytes of virtual address space covered by one page-directory slot.
pub const DIRECTORY_SPAN: u32 = 4096 * 1024;

/// End of userspace; the kernel half begins here.
pub const KERNEL_BASE: u32 = 0xc000_0000;

/// First page-directory slot belonging to the kernel half.
pub const FIRST_KERNEL_SLOT: usize = (KERNEL_BASE / DIRECTORY_SPAN) as usize;

/// Window of kernel address space handed to the kernel range allocator.
///
/// Everything the kernel maps dynamically (heap spans, MMIO windows,
/// temporary buffers) comes out of this range.
pub const KERNEL_RANGE_BASE: u32 = 0xc800_0000;

/// Exclusive end of the kernel range-allocator window.
pub const KERNEL_RANGE_END: u32 = 0xe000_0000;

/// Window of user address space handed to each process's range allocator.
pub const USER_RANGE_BASE: u32 = 0x1000_0000;

/// Exclusive end of the per-process range-allocator window.
pub const USER_RANGE_END: u32 = 0x8000_0000;

/// Directory slot holding the scratch page table for the quickmap windows.
pub const SCRATCH_SLOT: usize = 1022;

/// First quickmap scratch page: transiently maps an arbitrary frame.
pub const QUICKMAP_A: u32 = (SCRATCH_SLOT as u32) * DIRECTORY_SPAN;

/// Second quickmap scratch page, so frame-to-frame copies can hold two
/// windows at once.
pub const QUICKMAP_B: u32 = QUICKMAP_A + PAGE_SIZE;

/// Directory slot that maps the directory onto itself.
///
/// With the self-map installed, the page table serving directory slot `n`
/// appears at `RECURSIVE_BASE + n * PAGE_SIZE`, and the directory itself
/// appears as the last page of that window.
pub const RECURSIVE_SLOT: usize = 1023;

/// Base of the recursive self-map window.
pub const RECURSIVE_BASE: u32 = (RECURSIVE_SLOT as u32) * DIRECTORY_SPAN;

/// Virtual address of the scratch page table, reached through the
/// recursive window of the active address space.
pub const SCRATCH_TABLE_WINDOW: u32 = RECURSIVE_BASE + (SCRATCH_SLOT as u32) * PAGE_SIZE;

/// Size of each process's kernel stack.
pub const KERNEL_STACK_SIZE: u32 = 32 * 1024;

const _: () = {
    assert!(KERNEL_BASE % DIRECTORY_SPAN == 0);
    assert!(KERNEL_RANGE_BASE >= KERNEL_BASE);
    assert!(KERNEL_RANGE_BASE % PAGE_SIZE == 0);
    assert!(KERNEL_RANGE_END > KERNEL_RANGE_BASE);
    assert!(KERNEL_RANGE_END <= QUICKMAP_A);
    assert!(USER_RANGE_BASE % PAGE_SIZE == 0);
    assert!(USER_RANGE_END <= KERNEL_BASE);
    assert!(FIRST_KERNEL_SLOT < SCRATCH_SLOT);
    assert!(SCRATCH_SLOT == RECURSIVE_SLOT - 1);
    assert!(KERNEL_STACK_SIZE % PAGE_SIZE == 0);
};
