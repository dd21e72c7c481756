use crate::entry::PageEntryBits;
use kernel_addresses::TABLE_ENTRIES;

/// A page-aligned array of 1024 entries — the shape of both levels of the
/// two-level walk. A directory is a `PageTable` whose entries link to
/// tables instead of mapping frames.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; TABLE_ENTRIES],
}

/// Level-1 view of a [`PageTable`].
pub type PageDirectory = PageTable;

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            *entry = PageEntryBits::new();
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    pub fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Copy of all entries, for walking a table after its window is gone.
    #[must_use]
    pub fn snapshot(&self) -> [PageEntryBits; TABLE_ENTRIES] {
        self.entries
    }

    /// Replace every entry at once, e.g. from a prepared snapshot.
    pub fn fill_from(&mut self, entries: &[PageEntryBits; TABLE_ENTRIES]) {
        self.entries = *entries;
    }

    /// Number of present entries; diagnostic use.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
