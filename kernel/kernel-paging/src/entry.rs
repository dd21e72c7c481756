use crate::MapFlags;
use bitfield_struct::bitfield;
use kernel_addresses::PhysicalPage;

/// One 32-bit x86 page-directory or page-table entry in raw bitfield form.
///
/// The layout is the hardware-defined superset of both levels:
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Present |
/// | 1     | `RW` | Writable |
/// | 2     | `US` | User-mode accessible |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Disable caching |
/// | 5     | `A`  | Accessed |
/// | 6     | `D`  | Dirty (leaf only) |
/// | 7     | `PS` | Large page (directory only; unused here) |
/// | 8     | `G`  | Global (leaf only) |
/// | 9-11  | avail| OS use — bit 9 marks a **shared** mapping |
/// | 12-31 | addr | Physical frame number |
///
/// The `shared` bit is what address-space cloning consults: shared entries
/// alias the same frame in the clone, private entries get a fresh copy.
#[bitfield(u32)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,
    /// OS-available bit 9: frame is deliberately shared between address
    /// spaces; cloning aliases it instead of copying.
    pub shared: bool,
    #[bits(2)]
    pub os_available: u8,
    #[bits(20)]
    frame_index: u32,
}

impl PageEntryBits {
    /// The physical page this entry maps or links to.
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame_index())
    }

    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage) -> Self {
        self.with_frame_index(page.index())
    }

    /// A directory entry linking to a page table.
    ///
    /// Non-leaf entries are always writable; the leaf decides the final
    /// permission. `user` opens the whole slot to CPL 3 lookups.
    #[must_use]
    pub const fn for_table(page: PhysicalPage, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_page(page)
    }

    /// A leaf entry mapping one frame with the given public flags.
    #[must_use]
    pub fn for_leaf(page: PhysicalPage, flags: MapFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(MapFlags::WRITABLE))
            .with_user_access(flags.contains(MapFlags::USER))
            .with_cache_disabled(flags.contains(MapFlags::UNCACHED))
            .with_shared(flags.contains(MapFlags::SHARED))
            .with_physical_page(page)
    }

    /// Recover the public flag view of a leaf entry.
    #[must_use]
    pub fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.writable() {
            flags |= MapFlags::WRITABLE;
        }
        if self.user_access() {
            flags |= MapFlags::USER;
        }
        if self.cache_disabled() {
            flags |= MapFlags::UNCACHED;
        }
        if self.shared() {
            flags |= MapFlags::SHARED;
        }
        flags
    }
}
