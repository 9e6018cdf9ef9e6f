//! Page table entries in the x86-64 format.

use core::fmt;

use x86_64::structures::paging::PageTableFlags;

use crate::table::TableHandle;
use crate::{PageFlags, PageSize, PhysicalAddress};

/// A single 64-bit page table entry.
///
/// An entry is either all zero (absent), a link to a lower-level table, or a leaf mapping
/// a frame. Leaves above the page-table level carry the huge bit.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 contain the physical address.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Flags given to every intermediate entry. The leaf decides the effective rights.
    const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
        .union(PageTableFlags::WRITABLE)
        .union(PageTableFlags::USER_ACCESSIBLE);

    pub const EMPTY: Self = Self(0);

    /// A present 4 KiB leaf mapping `frame`.
    pub fn leaf(frame: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            frame.is_aligned(PageSize::Size4KiB.bytes()),
            "frame must be page-aligned"
        );
        let bits = flags.as_table_flags() | PageTableFlags::PRESENT;
        Self((frame.as_u64() & Self::ADDRESS_MASK) | bits.bits())
    }

    /// A present huge leaf mapping `frame`, as found in tables set up by boot code.
    #[cfg(test)]
    pub(crate) fn huge(frame: PhysicalAddress, flags: PageFlags, size: PageSize) -> Self {
        assert!(frame.is_aligned(size.bytes()), "huge frame must be size-aligned");
        let bits = flags.as_table_flags() | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE;
        Self((frame.as_u64() & Self::ADDRESS_MASK) | bits.bits())
    }

    /// A link to the lower-level table `child`.
    pub(crate) fn table(child: TableHandle) -> Self {
        Self(child.address().as_u64() | Self::TABLE_FLAGS.bits())
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Returns whether the huge bit is set.
    ///
    /// Only meaningful on PDPT and PD entries; the same bit means PAT on a PT entry.
    #[inline]
    pub fn is_huge(self) -> bool {
        self.flags().contains(PageTableFlags::HUGE_PAGE)
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Returns the caller-visible mapping attributes.
    #[inline]
    pub fn mapping_flags(self) -> PageFlags {
        PageFlags::from_entry(self.flags())
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns the base of the frame mapped by a leaf of the given size.
    ///
    /// Huge leaves reuse low address bits for PAT, so the address is masked to the size.
    pub fn frame_base(self, size: PageSize) -> Option<PhysicalAddress> {
        self.address()
            .map(|address| address.align_down(size.bytes()))
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "PageEntry({address}, {:?})", self.flags()),
            None => write!(f, "PageEntry(absent, {:#x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_absent() {
        assert!(!PageEntry::EMPTY.is_present());
        assert_eq!(PageEntry::EMPTY.address(), None);
        assert_eq!(PageEntry::default(), PageEntry::EMPTY);
    }

    #[test]
    fn leaf_holds_frame_and_flags() {
        let flags = PageFlags::empty().writable().user();
        let entry = PageEntry::leaf(PhysicalAddress::new(0x1234_5000), flags);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x1234_5000)));
        assert_eq!(entry.mapping_flags(), flags);
    }

    #[test]
    fn leaf_keeps_no_execute() {
        let entry = PageEntry::leaf(PhysicalAddress::new(0x5000), PageFlags::empty().no_execute());
        assert_eq!(entry.as_raw() >> 63, 1);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x5000)));
    }

    #[test]
    fn table_link_is_permissive() {
        let entry = PageEntry::table(TableHandle::new(PhysicalAddress::new(0x7000)));
        assert_eq!(entry.as_raw(), 0x7000 | 0b111);
        assert!(entry.mapping_flags().is_user());
        assert!(entry.mapping_flags().is_writable());
    }

    #[test]
    fn huge_frame_base_masks_pat_bit() {
        let entry = PageEntry::huge(
            PhysicalAddress::new(0x4000_0000),
            PageFlags::empty(),
            PageSize::Size1GiB,
        );
        // PAT for huge pages lives in bit 12.
        let with_pat = PageEntry::from_raw(entry.as_raw() | (1 << 12));
        assert!(with_pat.is_huge());
        assert_eq!(
            with_pat.frame_base(PageSize::Size1GiB),
            Some(PhysicalAddress::new(0x4000_0000))
        );
    }
}
