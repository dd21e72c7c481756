//! The kernel's memory context: one explicit handle bundling every shared
//! memory structure, plus the glue that implements the allocator seams
//! (range-node paging, heap backing, heap byte access) on top of the
//! paging manager.
//!
//! Lock order, everywhere: heap → ranges → frames. The spin locks cover
//! the table walks; callers on the real machine additionally run inside
//! interrupt-disabled sections at the dispatch boundary.

use kernel_addresses::{PAGE_BYTES, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_frames::{FrameAllocError, FrameStats, FrameTable, RefCount, Region};
use kernel_heap::{HeapBacking, HeapError, HeapMemory, HeapStats, KernelHeap};
use kernel_info::{
    KERNEL_RANGE_BASE, KERNEL_RANGE_END, KERNEL_STACK_SIZE, USER_RANGE_BASE, USER_RANGE_END,
};
use kernel_paging::{AddressSpace, MapError, MapFlags, TableWindows};
use kernel_ranges::{NodePager, RangeAllocError, RangeAllocator, RangeNode};
use kernel_sched::StackRange;
use kernel_sync::SpinLock;
use log::{info, warn};

/// Failures while bringing the memory system up.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("building the kernel address space: {0}")]
    Frames(#[from] FrameAllocError),
    #[error("initializing the kernel range allocator: {0}")]
    Ranges(#[from] RangeAllocError),
}

/// Everything the kernel's memory management shares, in one place.
///
/// `W` is the [`TableWindows`] implementation: the quickmap scratch pages
/// on the machine, simulated RAM in tests.
pub struct MemoryContext<W: TableWindows> {
    frames: SpinLock<FrameTable<'static>>,
    windows: W,
    kernel_space: AddressSpace,
    kernel_ranges: SpinLock<RangeAllocator>,
    heap: SpinLock<KernelHeap>,
}

impl<W: TableWindows> MemoryContext<W> {
    /// Bring up the memory system: frame table over the boot memory map,
    /// the kernel address space with its preallocated kernel-half tables,
    /// and the kernel range allocator over its fixed window.
    ///
    /// `words` and `counts` are the frame-table storage the boot code
    /// carved out of reserved memory.
    ///
    /// # Errors
    /// [`InitError`] when physical memory is exhausted during setup —
    /// boot treats that as fatal.
    pub fn new(
        windows: W,
        words: &'static mut [usize],
        counts: &'static mut [RefCount],
        regions: &[Region],
    ) -> Result<Self, InitError> {
        let mut table = FrameTable::new(words, counts, regions);
        let kernel_space = AddressSpace::new_kernel(&mut table, &windows)?;
        let frames = SpinLock::new(table);

        let kernel_ranges = {
            let mut pager = SpacePager {
                frames: &frames,
                windows: &windows,
                space: &kernel_space,
                user: false,
            };
            RangeAllocator::new(
                &mut pager,
                VirtualAddress::new(KERNEL_RANGE_BASE),
                VirtualAddress::new(KERNEL_RANGE_END),
            )?
        };

        info!(
            "memory context up: kernel range window {:#x}..{:#x}",
            KERNEL_RANGE_BASE, KERNEL_RANGE_END,
        );
        Ok(Self {
            frames,
            windows,
            kernel_space,
            kernel_ranges: SpinLock::new(kernel_ranges),
            heap: SpinLock::new(KernelHeap::new()),
        })
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    #[must_use]
    pub const fn windows(&self) -> &W {
        &self.windows
    }

    /// Run `f` with the frame table locked.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut FrameTable<'static>) -> R) -> R {
        f(&mut self.frames.lock())
    }

    /// A [`NodePager`] that backs range-allocator nodes through `space`.
    #[must_use]
    pub fn pager_for<'a>(&'a self, space: &'a AddressSpace, user: bool) -> SpacePager<'a, W> {
        SpacePager {
            frames: &self.frames,
            windows: &self.windows,
            space,
            user,
        }
    }

    // ----- kernel heap ----------------------------------------------------

    /// Allocate zero-filled kernel memory.
    ///
    /// # Errors
    /// [`HeapError`] on exhaustion or invalid size/alignment.
    pub fn kmalloc(&self, size: u32, align: u32) -> Result<VirtualAddress, HeapError> {
        let mut heap = self.heap.lock();
        heap.allocate(&mut HeapEnv { ctx: self }, size, align)
    }

    /// Free a [`kmalloc`](Self::kmalloc) allocation.
    pub fn kfree(&self, ptr: VirtualAddress) {
        let mut heap = self.heap.lock();
        heap.free(&mut HeapEnv { ctx: self }, ptr);
    }

    /// Resize an allocation (allocate-copy-free).
    ///
    /// # Errors
    /// [`HeapError`]; the old allocation survives a failure.
    pub fn krealloc(
        &self,
        ptr: Option<VirtualAddress>,
        new_size: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let mut heap = self.heap.lock();
        heap.reallocate(&mut HeapEnv { ctx: self }, ptr, new_size)
    }

    /// Duplicate a string onto the kernel heap, NUL-terminated.
    ///
    /// # Errors
    /// [`HeapError`].
    pub fn kstrdup(&self, s: &str) -> Result<VirtualAddress, HeapError> {
        let mut heap = self.heap.lock();
        heap.duplicate_str(&mut HeapEnv { ctx: self }, s)
    }

    /// Read mapped kernel memory. (Tests and diagnostic dumps; kernel code
    /// on the machine reads through the mapping directly.)
    pub fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) {
        HeapEnv { ctx: self }.read(va, buf);
    }

    /// Write mapped kernel memory.
    pub fn write_bytes(&self, va: VirtualAddress, bytes: &[u8]) {
        HeapEnv { ctx: self }.write(va, bytes);
    }

    // ----- kernel virtual ranges -----------------------------------------

    /// Reserve bare kernel address space (no frames) — MMIO windows,
    /// temporary buffers, kernel stacks.
    ///
    /// # Errors
    /// [`RangeAllocError`].
    pub fn allocate_kernel_range(&self, size: u32) -> Result<VirtualAddress, RangeAllocError> {
        let mut ranges = self.kernel_ranges.lock();
        let mut pager = self.pager_for(&self.kernel_space, false);
        ranges.alloc(&mut pager, size)
    }

    /// Return a kernel range.
    ///
    /// # Errors
    /// [`RangeAllocError::InvalidArgument`] for spans outside the window.
    pub fn free_kernel_range(
        &self,
        addr: VirtualAddress,
        size: u32,
    ) -> Result<(), RangeAllocError> {
        let mut ranges = self.kernel_ranges.lock();
        let mut pager = self.pager_for(&self.kernel_space, false);
        ranges.free(&mut pager, addr, size)
    }

    #[must_use]
    pub fn kernel_range_free_bytes(&self) -> u32 {
        self.kernel_ranges.lock().free_bytes()
    }

    // ----- process address-space lifecycle --------------------------------

    /// Fresh, empty address space for a new process.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`].
    pub fn create_process_space(&self) -> Result<AddressSpace, FrameAllocError> {
        AddressSpace::create(&mut self.frames.lock(), &self.windows, &self.kernel_space)
    }

    /// Eagerly duplicate a process's address space for fork.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`].
    pub fn clone_process_space(&self, src: &AddressSpace) -> Result<AddressSpace, MapError> {
        AddressSpace::clone_space(&mut self.frames.lock(), &self.windows, src, &self.kernel_space)
    }

    /// Tear down a dead process's address space. The scheduler has already
    /// switched the hardware root away from it.
    pub fn destroy_process_space(&self, space: AddressSpace) {
        space.destroy(&mut self.frames.lock(), &self.windows);
    }

    /// Range allocator for a process's user-space mappings, with its nodes
    /// living in (and mapped through) that process's own address space.
    ///
    /// # Errors
    /// [`RangeAllocError`].
    pub fn new_user_ranges(&self, space: &AddressSpace) -> Result<RangeAllocator, RangeAllocError> {
        let mut pager = self.pager_for(space, true);
        RangeAllocator::new(
            &mut pager,
            VirtualAddress::new(USER_RANGE_BASE),
            VirtualAddress::new(USER_RANGE_END),
        )
    }

    /// Allocate and map a kernel stack for a new process.
    ///
    /// # Errors
    /// [`HeapError`] on address-space or frame exhaustion.
    pub fn allocate_kernel_stack(&self) -> Result<StackRange, HeapError> {
        let mut env = HeapEnv { ctx: self };
        let pages = KERNEL_STACK_SIZE / PAGE_SIZE;
        let base = env.reserve(pages)?;
        Ok(StackRange {
            base,
            size: KERNEL_STACK_SIZE,
        })
    }

    /// Unmap and free a reaped process's kernel stack.
    pub fn free_kernel_stack(&self, stack: StackRange) {
        HeapEnv { ctx: self }.release(stack.base, stack.size / PAGE_SIZE);
    }

    // ----- reporting ------------------------------------------------------

    #[must_use]
    pub fn frame_stats(&self) -> FrameStats {
        self.frames.lock().stats()
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }
}

/// [`NodePager`] over one address space: range-allocator nodes are pages
/// mapped, read, and written through the paging manager — the range
/// allocator's deliberate recursive dependency on the layer below it.
pub struct SpacePager<'a, W: TableWindows> {
    frames: &'a SpinLock<FrameTable<'static>>,
    windows: &'a W,
    space: &'a AddressSpace,
    user: bool,
}

impl<W: TableWindows> SpacePager<'_, W> {
    fn node_flags(&self) -> MapFlags {
        if self.user {
            MapFlags::WRITABLE | MapFlags::USER
        } else {
            MapFlags::WRITABLE
        }
    }
}

impl<W: TableWindows> NodePager for SpacePager<'_, W> {
    fn map_node(&mut self, va: VirtualAddress) -> Result<(), RangeAllocError> {
        self.space
            .map_to_free_frames(
                &mut self.frames.lock(),
                self.windows,
                va,
                PAGE_SIZE,
                self.node_flags(),
            )
            .map_err(|e| match e {
                MapError::OutOfMemory { .. } => RangeAllocError::OutOfMemory,
                MapError::Misaligned => RangeAllocError::InvalidArgument,
            })
    }

    fn unmap_node(&mut self, va: VirtualAddress) {
        self.space
            .unmap(&mut self.frames.lock(), self.windows, va, PAGE_SIZE);
    }

    fn read_node(&self, va: VirtualAddress) -> RangeNode {
        let pa = self.space.virtual_to_physical(self.windows, va);
        self.windows.with_frame(pa.page(), |bytes| {
            let len = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
            let next = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
            RangeNode {
                len,
                next: (next != 0).then(|| VirtualAddress::new(next)),
            }
        })
    }

    fn write_node(&mut self, va: VirtualAddress, node: RangeNode) {
        let pa = self.space.virtual_to_physical(self.windows, va);
        self.windows.with_frame(pa.page(), |bytes| {
            bytes[0..4].copy_from_slice(&node.len.to_ne_bytes());
            let next = node.next.map_or(0, VirtualAddress::as_u32);
            bytes[4..8].copy_from_slice(&next.to_ne_bytes());
        });
    }
}

/// The heap's view of the layers below: spans come from the kernel range
/// allocator backed by fresh frames, bytes are reached through the table
/// windows.
struct HeapEnv<'a, W: TableWindows> {
    ctx: &'a MemoryContext<W>,
}

impl<W: TableWindows> HeapBacking for HeapEnv<'_, W> {
    fn reserve(&mut self, pages: u32) -> Result<VirtualAddress, HeapError> {
        let ctx = self.ctx;
        let bytes = pages * PAGE_SIZE;

        let va = {
            let mut ranges = ctx.kernel_ranges.lock();
            let mut pager = ctx.pager_for(&ctx.kernel_space, false);
            ranges.alloc(&mut pager, bytes).map_err(|e| match e {
                RangeAllocError::OutOfAddressSpace => HeapError::OutOfAddressSpace,
                RangeAllocError::OutOfMemory => HeapError::OutOfMemory,
                RangeAllocError::InvalidArgument => HeapError::InvalidArgument,
            })?
        };

        match ctx.kernel_space.map_to_free_frames(
            &mut ctx.frames.lock(),
            &ctx.windows,
            va,
            bytes,
            MapFlags::WRITABLE,
        ) {
            Ok(()) => Ok(va),
            Err(MapError::OutOfMemory { mapped_bytes }) => {
                // the documented contract: unmap the partial prefix ourselves
                if mapped_bytes > 0 {
                    ctx.kernel_space
                        .unmap(&mut ctx.frames.lock(), &ctx.windows, va, mapped_bytes);
                }
                let mut ranges = ctx.kernel_ranges.lock();
                let mut pager = ctx.pager_for(&ctx.kernel_space, false);
                if ranges.free(&mut pager, va, bytes).is_err() {
                    warn!("leaking {bytes:#x} bytes of kernel range at {va} after OOM");
                }
                Err(HeapError::OutOfMemory)
            }
            Err(MapError::Misaligned) => unreachable!("range allocator returns aligned spans"),
        }
    }

    fn release(&mut self, base: VirtualAddress, pages: u32) {
        let ctx = self.ctx;
        let bytes = pages * PAGE_SIZE;
        ctx.kernel_space
            .unmap(&mut ctx.frames.lock(), &ctx.windows, base, bytes);
        let mut ranges = ctx.kernel_ranges.lock();
        let mut pager = ctx.pager_for(&ctx.kernel_space, false);
        if ranges.free(&mut pager, base, bytes).is_err() {
            warn!("leaking {bytes:#x} bytes of kernel range at {base}");
        }
    }
}

impl<W: TableWindows> HeapMemory for HeapEnv<'_, W> {
    fn read(&self, va: VirtualAddress, buf: &mut [u8]) {
        let ctx = self.ctx;
        let mut done = 0;
        while done < buf.len() {
            let cursor = va + done as u32;
            let pa = ctx.kernel_space.virtual_to_physical(&ctx.windows, cursor);
            let offset = pa.page_offset() as usize;
            let chunk = (PAGE_BYTES - offset).min(buf.len() - done);
            ctx.windows.with_frame(pa.page(), |bytes| {
                buf[done..done + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
            });
            done += chunk;
        }
    }

    fn write(&mut self, va: VirtualAddress, data: &[u8]) {
        let ctx = self.ctx;
        let mut done = 0;
        while done < data.len() {
            let cursor = va + done as u32;
            let pa = ctx.kernel_space.virtual_to_physical(&ctx.windows, cursor);
            let offset = pa.page_offset() as usize;
            let chunk = (PAGE_BYTES - offset).min(data.len() - done);
            ctx.windows.with_frame(pa.page(), |bytes| {
                bytes[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            });
            done += chunk;
        }
    }

    fn fill(&mut self, va: VirtualAddress, byte: u8, len: u32) {
        let ctx = self.ctx;
        let mut done = 0;
        while done < len {
            let cursor = va + done;
            let pa = ctx.kernel_space.virtual_to_physical(&ctx.windows, cursor);
            let offset = pa.page_offset() as usize;
            let chunk = (PAGE_BYTES - offset).min((len - done) as usize);
            ctx.windows.with_frame(pa.page(), |bytes| {
                bytes[offset..offset + chunk].fill(byte);
            });
            done += chunk as u32;
        }
    }

    fn copy(&mut self, dst: VirtualAddress, src: VirtualAddress, len: u32) {
        // bounce through a small stack buffer; spans may straddle pages
        let mut buffer = [0u8; 256];
        let mut done = 0;
        while done < len {
            let chunk = buffer.len().min((len - done) as usize);
            self.read(src + done, &mut buffer[..chunk]);
            let (to_write, _) = buffer.split_at(chunk);
            let dst_cursor = dst + done;
            self.write(dst_cursor, to_write);
            done += chunk as u32;
        }
    }
}

/// Physical address of the frame backing `va` in `space`; diagnostic
/// helper for boot and tests.
#[must_use]
pub fn backing_frame<W: TableWindows>(
    ctx: &MemoryContext<W>,
    space: &AddressSpace,
    va: VirtualAddress,
) -> Option<PhysicalAddress> {
    space.translate(ctx.windows(), va)
}
