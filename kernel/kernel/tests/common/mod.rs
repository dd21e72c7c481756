//! Shared harness: a simulated machine — Vec-backed physical RAM playing
//! the part of the quickmap windows — wired into a full `MemoryContext`.

use kernel::MemoryContext;
use kernel_addresses::{PAGE_BYTES, PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_frames::{RefCount, Region, RegionKind};
use kernel_paging::{PageTable, TableWindows};

#[repr(align(4096))]
struct SimFrame([u8; PAGE_BYTES]);

/// Simulated physical memory; frame numbers index straight into it.
pub struct SimRam {
    base: *mut SimFrame,
    len: usize,
}

// Safety: tests are single-threaded over the context.
unsafe impl Sync for SimRam {}
unsafe impl Send for SimRam {}

impl SimRam {
    pub fn new(frame_count: usize) -> Self {
        let frames: Box<[SimFrame]> = (0..frame_count)
            .map(|_| SimFrame([0; PAGE_BYTES]))
            .collect();
        let len = frames.len();
        let base = Box::leak(frames).as_mut_ptr();
        Self { base, len }
    }

    fn frame_ptr(&self, page: PhysicalPage) -> *mut u8 {
        let index = page.index() as usize;
        assert!(index < self.len, "simulated RAM has no frame #{index}");
        unsafe { self.base.add(index).cast::<u8>() }
    }
}

impl TableWindows for SimRam {
    fn with_table<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut PageTable) -> R) -> R {
        f(unsafe { &mut *self.frame_ptr(page).cast::<PageTable>() })
    }

    fn with_frame<R>(&self, page: PhysicalPage, f: impl FnOnce(&mut [u8; PAGE_BYTES]) -> R) -> R {
        f(unsafe { &mut *self.frame_ptr(page).cast::<[u8; PAGE_BYTES]>() })
    }

    fn copy_frame(&self, dst: PhysicalPage, src: PhysicalPage) {
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_BYTES);
        }
    }
}

/// A booted memory context over `frames` simulated frames.
pub fn machine(frames: usize) -> MemoryContext<SimRam> {
    let words = vec![0usize; frames.div_ceil(usize::BITS as usize)].leak();
    let counts = vec![RefCount::ZERO; frames].leak();
    let regions = [Region {
        base: PhysicalAddress::new(0),
        length: frames as u32 * PAGE_SIZE,
        kind: RegionKind::Usable,
    }];
    MemoryContext::new(SimRam::new(frames), words, counts, &regions)
        .expect("simulated machine boots")
}
