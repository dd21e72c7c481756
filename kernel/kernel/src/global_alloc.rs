//! Routes Rust's `alloc` machinery through the kernel heap, so scheduler
//! and allocator bookkeeping itself flows through the same path as every
//! other kernel allocation.

use crate::MemoryContext;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use kernel_addresses::VirtualAddress;
use kernel_paging::Quickmap;
use kernel_sync::SyncOnceCell;

static KERNEL_MEMORY: SyncOnceCell<MemoryContext<Quickmap>> = SyncOnceCell::new();

/// Install the machine's memory context; called once from boot, before
/// the first heap allocation.
pub fn install_kernel_memory(ctx: MemoryContext<Quickmap>) {
    KERNEL_MEMORY.get_or_init(|| ctx);
}

/// The installed memory context.
///
/// # Panics
/// Panics before [`install_kernel_memory`].
#[must_use]
pub fn kernel_memory() -> &'static MemoryContext<Quickmap> {
    KERNEL_MEMORY.get().expect("kernel memory not initialized")
}

struct KernelAllocator;

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(ctx) = KERNEL_MEMORY.get() else {
            return null_mut();
        };
        let (Ok(size), Ok(align)) = (
            u32::try_from(layout.size()),
            u32::try_from(layout.align()),
        ) else {
            return null_mut();
        };
        match ctx.kmalloc(size, align) {
            Ok(va) => va.as_u32() as usize as *mut u8,
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        kernel_memory().kfree(VirtualAddress::new(ptr as usize as u32));
    }
}
