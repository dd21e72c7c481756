use crate::entry::PageEntryBits;
use crate::table::PageTable;
use crate::{MapError, MapFlags, TableWindows, invalidate_page};
use kernel_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, TABLE_ENTRIES, VirtualAddress};
use kernel_frames::{Frame, FrameAllocError, FrameTable};
use kernel_info::{FIRST_KERNEL_SLOT, RECURSIVE_SLOT, SCRATCH_SLOT};
use log::{debug, info};

/// One page directory and the tables hanging off it.
///
/// Every process owns exactly one `AddressSpace`; the kernel owns one more
/// whose upper-half directory slots are copied by reference into each new
/// space. The handle is deliberately not `Clone`: duplication goes through
/// [`AddressSpace::clone_space`] and teardown through
/// [`AddressSpace::destroy`], which consumes it.
///
/// All operations reach physical table frames through a [`TableWindows`]
/// capability and take the frame table explicitly; nothing here touches
/// ambient global state.
pub struct AddressSpace {
    directory: PhysicalPage,
}

impl AddressSpace {
    /// The frame holding this space's page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        self.directory
    }

    /// Build the kernel's own address space.
    ///
    /// Every kernel-half page table (directory slots covering
    /// [`KERNEL_BASE`](kernel_info::KERNEL_BASE) up to and including the
    /// quickmap scratch slot) is allocated up front. Kernel mappings
    /// therefore never allocate tables at run time, which keeps the kernel
    /// half of every directory identical for the lifetime of the system —
    /// process directories copy these slots by reference and never see them
    /// change shape.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] — only plausible with a pathological
    /// boot memory map; boot treats it as fatal.
    pub fn new_kernel<W: TableWindows>(
        frames: &mut FrameTable<'_>,
        windows: &W,
    ) -> Result<Self, FrameAllocError> {
        let directory = frames.allocate()?.into_page();
        windows.with_table(directory, PageTable::zero);

        for slot in FIRST_KERNEL_SLOT..=SCRATCH_SLOT {
            let table_page = frames.allocate()?.into_page();
            windows.with_table(table_page, PageTable::zero);
            windows.with_table(directory, |dir| {
                dir.set(slot, PageEntryBits::for_table(table_page, false));
            });
        }
        windows.with_table(directory, |dir| {
            dir.set(RECURSIVE_SLOT, PageEntryBits::for_table(directory, false));
        });

        info!("kernel address space rooted at {directory:?}");
        Ok(Self { directory })
    }

    /// Create a fresh address space for a new process: empty user half,
    /// kernel half copied (by reference, no refcount churn — the kernel
    /// tables are immortal), recursive slot pointing at the new directory
    /// itself.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`].
    pub fn create<W: TableWindows>(
        frames: &mut FrameTable<'_>,
        windows: &W,
        kernel: &Self,
    ) -> Result<Self, FrameAllocError> {
        let directory = frames.allocate()?.into_page();
        let kernel_dir = windows.with_table(kernel.directory, |t| t.snapshot());

        windows.with_table(directory, |dir| {
            dir.zero();
            for slot in FIRST_KERNEL_SLOT..=SCRATCH_SLOT {
                dir.set(slot, kernel_dir[slot]);
            }
            dir.set(RECURSIVE_SLOT, PageEntryBits::for_table(directory, false));
        });

        debug!("created address space {directory:?}");
        Ok(Self { directory })
    }

    /// Duplicate `src` for a forked child. Eager, no copy-on-write:
    ///
    /// * entries flagged **shared** alias the same frame, with its
    ///   reference count incremented;
    /// * every other present entry gets a freshly allocated frame and a
    ///   full 4 KiB copy through the quickmap windows.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if frames run out mid-clone. The partial
    /// clone is torn down before returning, so `mapped_bytes` is always 0.
    pub fn clone_space<W: TableWindows>(
        frames: &mut FrameTable<'_>,
        windows: &W,
        src: &Self,
        kernel: &Self,
    ) -> Result<Self, MapError> {
        let clone = Self::create(frames, windows, kernel)
            .map_err(|_| MapError::OutOfMemory { mapped_bytes: 0 })?;
        let src_dir = windows.with_table(src.directory, |t| t.snapshot());

        for (dir_index, dir_entry) in src_dir.iter().enumerate().take(FIRST_KERNEL_SLOT) {
            if !dir_entry.present() {
                continue;
            }
            let src_entries = windows.with_table(dir_entry.physical_page(), |t| t.snapshot());
            match Self::clone_table(frames, windows, &src_entries) {
                Ok(table_page) => {
                    windows.with_table(clone.directory, |dir| {
                        dir.set(dir_index, dir_entry.with_physical_page(table_page));
                    });
                }
                Err(e) => {
                    clone.destroy(frames, windows);
                    return Err(e);
                }
            }
        }

        debug!(
            "cloned address space {:?} -> {:?}",
            src.directory, clone.directory,
        );
        Ok(clone)
    }

    /// Duplicate one page table's worth of mappings.
    fn clone_table<W: TableWindows>(
        frames: &mut FrameTable<'_>,
        windows: &W,
        src_entries: &[PageEntryBits; TABLE_ENTRIES],
    ) -> Result<PhysicalPage, MapError> {
        let table_page = frames
            .allocate()
            .map_err(|_| MapError::OutOfMemory { mapped_bytes: 0 })?
            .into_page();

        let mut dst = [PageEntryBits::new(); TABLE_ENTRIES];
        for (index, entry) in src_entries.iter().enumerate() {
            if !entry.present() {
                continue;
            }
            let dst_page = if entry.shared() {
                frames.share(entry.physical_page()).into_page()
            } else {
                match frames.allocate() {
                    Ok(copy) => {
                        let copy_page = copy.into_page();
                        windows.copy_frame(copy_page, entry.physical_page());
                        copy_page
                    }
                    Err(_) => {
                        // Give back everything parked in this table so far.
                        for parked in dst.iter().take(index).filter(|e| e.present()) {
                            frames.unreference(unsafe { Frame::adopt(parked.physical_page()) });
                        }
                        frames.unreference(unsafe { Frame::adopt(table_page) });
                        return Err(MapError::OutOfMemory { mapped_bytes: 0 });
                    }
                }
            };
            dst[index] = entry.with_physical_page(dst_page);
        }

        windows.with_table(table_page, |table| table.fill_from(&dst));
        Ok(table_page)
    }

    /// Tear the space down: unreference every frame mapped in the user
    /// half, the user page tables, and finally the directory itself.
    /// Kernel-half slots and the recursive slot are skipped — those tables
    /// are immortal and were never counted.
    ///
    /// The caller must have switched the hardware root away from this
    /// space first.
    pub fn destroy<W: TableWindows>(self, frames: &mut FrameTable<'_>, windows: &W) {
        let dir_snapshot = windows.with_table(self.directory, |t| t.snapshot());
        for dir_entry in dir_snapshot.iter().take(FIRST_KERNEL_SLOT) {
            if !dir_entry.present() {
                continue;
            }
            let table_page = dir_entry.physical_page();
            let entries = windows.with_table(table_page, |t| t.snapshot());
            for entry in entries.iter().filter(|e| e.present()) {
                frames.unreference(unsafe { Frame::adopt(entry.physical_page()) });
            }
            frames.unreference(unsafe { Frame::adopt(table_page) });
        }
        debug!("destroyed address space {:?}", self.directory);
        frames.unreference(unsafe { Frame::adopt(self.directory) });
    }

    /// Map `size` bytes at `va` to freshly allocated frames.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] mid-range rolls back nothing: the
    /// already-mapped prefix length is reported and the caller unmaps it.
    pub fn map_to_free_frames<W: TableWindows>(
        &self,
        frames: &mut FrameTable<'_>,
        windows: &W,
        va: VirtualAddress,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        check_page_range(va, size)?;
        for i in 0..size / PAGE_SIZE {
            let page_va = va + i * PAGE_SIZE;
            let oom = |_| MapError::OutOfMemory {
                mapped_bytes: i * PAGE_SIZE,
            };
            let table_page = self.ensure_table(frames, windows, page_va).map_err(oom)?;
            let frame = frames.allocate().map_err(oom)?;
            Self::install(
                windows,
                table_page,
                page_va,
                PageEntryBits::for_leaf(frame.into_page(), flags),
            );
        }
        Ok(())
    }

    /// Map `size` bytes at `va` to the caller-specified physical range,
    /// taking a reference on every frame. Used for device MMIO and the
    /// framebuffer.
    ///
    /// # Errors
    /// [`MapError`] on misalignment or table-allocation failure.
    pub fn map_to_physical_range<W: TableWindows>(
        &self,
        frames: &mut FrameTable<'_>,
        windows: &W,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        check_page_range(va, size)?;
        if !pa.is_page_aligned() {
            return Err(MapError::Misaligned);
        }
        for i in 0..size / PAGE_SIZE {
            let page_va = va + i * PAGE_SIZE;
            let table_page = self
                .ensure_table(frames, windows, page_va)
                .map_err(|_| MapError::OutOfMemory {
                    mapped_bytes: i * PAGE_SIZE,
                })?;
            let frame = frames.share(PhysicalPage::from_index(pa.page().index() + i));
            Self::install(
                windows,
                table_page,
                page_va,
                PageEntryBits::for_leaf(frame.into_page(), flags),
            );
        }
        Ok(())
    }

    /// Install mappings at `dst` pointing at the frames currently mapped
    /// at `src`, incrementing their reference counts — how pages are
    /// shared during heap growth or for explicit shared-memory mappings.
    ///
    /// # Errors
    /// [`MapError`] on misalignment or table-allocation failure.
    ///
    /// # Panics
    /// Panics if any page of `src` is unmapped.
    pub fn copy_mapping<W: TableWindows>(
        &self,
        frames: &mut FrameTable<'_>,
        windows: &W,
        dst: VirtualAddress,
        src: VirtualAddress,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        check_page_range(dst, size)?;
        check_page_range(src, size)?;
        for i in 0..size / PAGE_SIZE {
            let offset = i * PAGE_SIZE;
            let pa = self.virtual_to_physical(windows, src + offset);
            let table_page = self
                .ensure_table(frames, windows, dst + offset)
                .map_err(|_| MapError::OutOfMemory {
                    mapped_bytes: offset,
                })?;
            let frame = frames.share(pa.page());
            Self::install(
                windows,
                table_page,
                dst + offset,
                PageEntryBits::for_leaf(frame.into_page(), flags),
            );
        }
        Ok(())
    }

    /// Unmap `size` bytes at `va`, returning each frame's reference and
    /// invalidating the translation cache per page.
    ///
    /// # Panics
    /// Unmapping an unmapped page is a kernel bug and panics.
    pub fn unmap<W: TableWindows>(
        &self,
        frames: &mut FrameTable<'_>,
        windows: &W,
        va: VirtualAddress,
        size: u32,
    ) {
        assert!(
            va.is_page_aligned() && size % PAGE_SIZE == 0,
            "unmap of unaligned range {va} + {size:#x}",
        );
        for i in 0..size / PAGE_SIZE {
            let page_va = va + i * PAGE_SIZE;
            let dir_entry = windows.with_table(self.directory, |dir| {
                dir.get(page_va.directory_index())
            });
            assert!(
                dir_entry.present(),
                "unmapping {page_va}, which has no page table",
            );
            let entry = windows.with_table(dir_entry.physical_page(), |table| {
                let entry = table.get(page_va.table_index());
                table.set(page_va.table_index(), PageEntryBits::new());
                entry
            });
            assert!(entry.present(), "unmapping unmapped page {page_va}");
            frames.unreference(unsafe { Frame::adopt(entry.physical_page()) });
            invalidate_page(page_va);
        }
    }

    /// Translate a virtual address if it is mapped.
    #[must_use]
    pub fn translate<W: TableWindows>(
        &self,
        windows: &W,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let dir_entry = windows.with_table(self.directory, |dir| dir.get(va.directory_index()));
        if !dir_entry.present() {
            return None;
        }
        let entry = windows.with_table(dir_entry.physical_page(), |table| {
            table.get(va.table_index())
        });
        if !entry.present() {
            return None;
        }
        Some(entry.physical_page().base() + va.page_offset())
    }

    /// The physical address backing `va`.
    ///
    /// # Panics
    /// Calling this on an unmapped address is a programming error and
    /// panics; use [`translate`](Self::translate) when absence is expected.
    #[must_use]
    pub fn virtual_to_physical<W: TableWindows>(
        &self,
        windows: &W,
        va: VirtualAddress,
    ) -> PhysicalAddress {
        self.translate(windows, va)
            .unwrap_or_else(|| panic!("virtual_to_physical on unmapped address {va}"))
    }

    /// Load the hardware translation root with this space's directory.
    ///
    /// # Safety
    /// CPL 0 only, and the caller must hold interrupts off so the switch
    /// stays consistent with the scheduler's saved state.
    #[cfg(target_arch = "x86")]
    pub unsafe fn activate(&self) {
        let root = self.directory.base().as_u32();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
        }
    }

    /// Look up (or, in the user half, build) the page table covering `va`.
    fn ensure_table<W: TableWindows>(
        &self,
        frames: &mut FrameTable<'_>,
        windows: &W,
        va: VirtualAddress,
    ) -> Result<PhysicalPage, FrameAllocError> {
        let dir_index = va.directory_index();
        let existing = windows.with_table(self.directory, |dir| dir.get(dir_index));
        if existing.present() {
            return Ok(existing.physical_page());
        }
        assert!(
            dir_index < FIRST_KERNEL_SLOT,
            "no kernel page table for {va}; kernel tables are preallocated at boot",
        );
        let table_page = frames.allocate()?.into_page();
        windows.with_table(table_page, PageTable::zero);
        windows.with_table(self.directory, |dir| {
            dir.set(dir_index, PageEntryBits::for_table(table_page, true));
        });
        Ok(table_page)
    }

    fn install<W: TableWindows>(
        windows: &W,
        table_page: PhysicalPage,
        va: VirtualAddress,
        entry: PageEntryBits,
    ) {
        windows.with_table(table_page, |table| {
            assert!(
                !table.get(va.table_index()).present(),
                "mapping over an existing mapping at {va}",
            );
            table.set(va.table_index(), entry);
        });
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AddressSpace({:?})", self.directory)
    }
}

fn check_page_range(va: VirtualAddress, size: u32) -> Result<(), MapError> {
    if va.is_page_aligned() && size % PAGE_SIZE == 0 {
        Ok(())
    } else {
        Err(MapError::Misaligned)
    }
}
