use crate::table::PageTable;
use crate::{MapFlags, TableWindows, entry::PageEntryBits, invalidate_page};
use core::cell::UnsafeCell;
use kernel_addresses::{PAGE_BYTES, PhysicalPage, VirtualAddress};
use kernel_info::{QUICKMAP_A, QUICKMAP_B, SCRATCH_TABLE_WINDOW};

const SLOT_COUNT: usize = 2;
const SLOT_BASES: [u32; SLOT_COUNT] = [QUICKMAP_A, QUICKMAP_B];

/// The kernel's [`TableWindows`]: two reserved scratch pages that can map
/// an arbitrary physical frame for exactly as long as an edit or copy
/// takes.
///
/// The scratch page table itself is reached through the recursive self-map
/// of the active address space, so installing a window is an ordinary
/// memory write plus a TLB invalidation. A slot that is already occupied on
/// acquire, or empty on release, is a kernel bug and panics.
///
/// Single-CPU only: callers run window operations with interrupts disabled,
/// which is what makes the interior mutability sound.
pub struct Quickmap {
    busy: UnsafeCell<[bool; SLOT_COUNT]>,
}

// Safety: only one CPU exists and window users hold interrupts off.
unsafe impl Sync for Quickmap {}

impl Quickmap {
    /// # Safety
    /// The scratch page table must be installed in the active address
    /// space (boot does this) and both windows must be unused.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self {
            busy: UnsafeCell::new([false; SLOT_COUNT]),
        }
    }

    fn acquire(&self, page: PhysicalPage) -> usize {
        let busy = unsafe { &mut *self.busy.get() };
        let slot = busy
            .iter()
            .position(|used| !used)
            .expect("quickmap windows exhausted");
        busy[slot] = true;

        let scratch = unsafe { &mut *(SCRATCH_TABLE_WINDOW as usize as *mut PageTable) };
        assert!(
            !scratch.get(slot).present(),
            "quickmap slot {slot} already mapped",
        );
        scratch.set(slot, PageEntryBits::for_leaf(page, MapFlags::WRITABLE));
        invalidate_page(VirtualAddress::new(SLOT_BASES[slot]));
        slot
    }

    fn release(&self, slot: usize) {
        let scratch = unsafe { &mut *(SCRATCH_TABLE_WINDOW as usize as *mut PageTable) };
        assert!(
            scratch.get(slot).present(),
            "releasing an empty quickmap slot {slot}",
        );
        scratch.set(slot, PageEntryBits::new());
        invalidate_page(VirtualAddress::new(SLOT_BASES[slot]));

        let busy = unsafe { &mut *self.busy.get() };
        busy[slot] = false;
    }
}

impl TableWindows for Quickmap {
    fn with_table<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut PageTable) -> R) -> R {
        let slot = self.acquire(page);
        let table = unsafe { &mut *(SLOT_BASES[slot] as usize as *mut PageTable) };
        let result = f(table);
        self.release(slot);
        result
    }

    fn with_frame<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut [u8; PAGE_BYTES]) -> R) -> R {
        let slot = self.acquire(page);
        let bytes = unsafe { &mut *(SLOT_BASES[slot] as usize as *mut [u8; PAGE_BYTES]) };
        let result = f(bytes);
        self.release(slot);
        result
    }

    fn copy_frame(&self, dst: PhysicalPage, src: PhysicalPage) {
        let src_slot = self.acquire(src);
        let dst_slot = self.acquire(dst);
        unsafe {
            core::ptr::copy_nonoverlapping(
                SLOT_BASES[src_slot] as usize as *const u8,
                SLOT_BASES[dst_slot] as usize as *mut u8,
                PAGE_BYTES,
            );
        }
        self.release(dst_slot);
        self.release(src_slot);
    }
}
