//! Page table nodes and the levels of the hierarchy.

use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{ENTRY_COUNT, PAGE_SIZE};
use crate::error::corrupted;
use crate::{AddressTranslator, FrameNumber, PageEntry, PageSize, PhysicalAddress};

/// Top-level slots covering the user half.
pub const USER_SLOTS: Range<usize> = 0..ENTRY_COUNT / 2;

/// Top-level slots covering the kernel half, shared by every address space.
pub const KERNEL_SLOTS: Range<usize> = ENTRY_COUNT / 2..ENTRY_COUNT;

/// A level of the 4-level hierarchy, named by the table that lives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Pt,
    Pd,
    Pdpt,
    Pml4,
}

impl Level {
    /// Bit position of the lowest address bit indexed at this level.
    #[inline]
    pub const fn shift(self) -> u32 {
        12 + 9 * self as u32
    }

    /// Bytes of address space covered by one entry at this level.
    #[inline]
    pub const fn coverage(self) -> usize {
        1 << self.shift()
    }

    /// Index into a table at this level for a stripped address.
    #[inline]
    pub const fn index_of(self, stripped: usize) -> usize {
        (stripped >> self.shift()) & (ENTRY_COUNT - 1)
    }

    /// The level of the tables this level's entries point to.
    #[inline]
    pub const fn next_lower(self) -> Option<Level> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Size of a leaf at this level. PML4 entries can never be leaves.
    #[inline]
    pub const fn leaf_size(self) -> Option<PageSize> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(PageSize::Size1GiB),
            Self::Pd => Some(PageSize::Size2MiB),
            Self::Pt => Some(PageSize::Size4KiB),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

/// One entry slot of a live table.
///
/// Slots are atomic so that the kernel half, which is shared between address spaces, can
/// be read while another space updates it under the kernel lock.
#[repr(transparent)]
pub struct EntrySlot(AtomicU64);

impl EntrySlot {
    #[inline]
    pub fn load(&self) -> PageEntry {
        PageEntry::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, entry: PageEntry) {
        self.0.store(entry.as_raw(), Ordering::Release);
    }

    /// Clears the slot, returning what it held.
    #[inline]
    pub fn take(&self) -> PageEntry {
        PageEntry::from_raw(self.0.swap(0, Ordering::AcqRel))
    }
}

impl fmt::Debug for EntrySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

/// A 4 KiB page table node: 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [EntrySlot; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    #[inline]
    pub fn slot(&self, index: usize) -> &EntrySlot {
        &self.entries[index]
    }

    /// Iterates over `(index, slot)` pairs of the given index range.
    pub fn slots(&self, range: Range<usize>) -> impl Iterator<Item = (usize, &EntrySlot)> {
        range.map(move |index| (index, &self.entries[index]))
    }
}

/// The physical identity of a table node.
///
/// Handles are plain frame numbers; turning one into a reference is the single unsafe step
/// between the entry format and the tree structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableHandle(FrameNumber);

impl TableHandle {
    /// # Panics
    ///
    /// Panics if `address` is not page-aligned.
    pub fn new(address: PhysicalAddress) -> Self {
        if !address.is_aligned(PAGE_SIZE) {
            corrupted(format_args!("table at unaligned address {address}"));
        }
        Self(address.frame_number())
    }

    /// The child table referenced by a present, non-huge entry.
    pub fn from_entry(entry: PageEntry) -> Self {
        match entry.address() {
            Some(address) => Self::new(address),
            None => corrupted(format_args!("{entry:?} does not reference a table")),
        }
    }

    #[inline]
    pub fn address(self) -> PhysicalAddress {
        self.0.start()
    }

    #[inline]
    pub fn frame(self) -> FrameNumber {
        self.0
    }

    /// Returns the table behind this handle.
    ///
    /// # Safety
    ///
    /// The handle must refer to a live table node that stays allocated for `'t`.
    #[inline]
    pub unsafe fn get<'t>(self) -> &'t PageTable {
        let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(self.address());
        // SAFETY: the caller guarantees the node is live; all mutation goes through atomics.
        unsafe { &*ptr }
    }

    /// Zeroes the node.
    ///
    /// # Safety
    ///
    /// The caller must own the node exclusively: it is not linked into any tree.
    pub unsafe fn clear(self) {
        let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(self.address());
        // SAFETY: exclusive ownership guaranteed by the caller.
        unsafe { ptr.write_bytes(0, 1) };
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup;
    use crate::{PageFlags, VirtualAddress};

    #[test]
    fn level_geometry() {
        assert_eq!(Level::Pt.coverage(), 4096);
        assert_eq!(Level::Pd.coverage(), 2 << 20);
        assert_eq!(Level::Pdpt.coverage(), 1 << 30);
        assert_eq!(Level::Pml4.coverage(), 512usize << 30);
        assert_eq!(Level::Pml4.next_lower(), Some(Level::Pdpt));
        assert_eq!(Level::Pt.next_lower(), None);
        assert_eq!(Level::Pml4.leaf_size(), None);
    }

    #[test]
    fn level_index_matches_address() {
        let addr = VirtualAddress::new(0x0000_0080_4020_1000);
        assert_eq!(Level::Pml4.index_of(addr.strip()), 1);
        assert_eq!(Level::Pdpt.index_of(addr.strip()), 1);
        assert_eq!(Level::Pd.index_of(addr.strip()), 1);
        assert_eq!(Level::Pt.index_of(addr.strip()), 1);
    }

    #[test]
    fn slots_split_the_address_space() {
        assert_eq!(USER_SLOTS.end, KERNEL_SLOTS.start);
        assert_eq!(KERNEL_SLOTS.end, ENTRY_COUNT);
        assert_eq!(
            Level::Pml4.index_of(VirtualAddress::new(0xFFFF_8000_0000_0000).strip()),
            KERNEL_SLOTS.start
        );
    }

    #[test]
    fn slot_take_clears() {
        let slot = EntrySlot(AtomicU64::new(0));
        let entry = PageEntry::leaf(PhysicalAddress::new(0x3000), PageFlags::empty());
        slot.store(entry);
        assert_eq!(slot.load(), entry);
        assert_eq!(slot.take(), entry);
        assert_eq!(slot.load(), PageEntry::EMPTY);
    }

    #[test]
    fn handle_reaches_emulated_table() {
        setup();
        let translator = AddressTranslator::current();
        let address = translator.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let handle = TableHandle::new(address);

        let table = unsafe { handle.get() };
        table.slot(3).store(PageEntry::leaf(PhysicalAddress::new(0x9000), PageFlags::empty()));
        assert!(unsafe { handle.get() }.slot(3).load().is_present());

        unsafe { handle.clear() };
        assert!(table.slots(0..ENTRY_COUNT).all(|(_, slot)| !slot.load().is_present()));
    }

    #[test]
    #[should_panic(expected = "page table corruption")]
    fn handle_rejects_unaligned_address() {
        TableHandle::new(PhysicalAddress::new(0x1008));
    }

    #[test]
    #[should_panic(expected = "page table corruption")]
    fn handle_rejects_absent_entry() {
        TableHandle::from_entry(PageEntry::EMPTY);
    }
}
