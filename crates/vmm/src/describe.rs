//! Summaries of what an address space maps.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::arch::ENTRY_COUNT;
use crate::table::{KERNEL_SLOTS, Level, PageTable, TableHandle, USER_SLOTS};
use crate::{HumanSize, MapError, PageFlags, PageSize, Unsupported, VirtualAddress};

/// A run of contiguous mapped virtual memory with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub start: VirtualAddress,
    pub size: usize,
    /// Writable, user and no-execute bits shared by the whole run.
    pub flags: PageFlags,
}

impl fmt::Display for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.start.as_usize().wrapping_add(self.size);
        write!(
            f,
            "{:#018x} .. {:#018x} ({}) {}",
            self.start.as_usize(),
            end,
            self.flags,
            HumanSize(self.size)
        )
    }
}

/// Lists the mapped ranges of a tree, user half first.
///
/// Runs never span the two halves. 2 MiB leaves are refused.
pub(crate) fn scan(root: &PageTable) -> Result<Vec<MappedRange>, MapError> {
    let mut scanner = Scanner::default();
    for half in [USER_SLOTS, KERNEL_SLOTS] {
        scanner.visit(root, Level::Pml4, 0, half)?;
        scanner.close();
    }
    Ok(scanner.ranges)
}

#[derive(Default)]
struct Scanner {
    ranges: Vec<MappedRange>,
    /// Stripped start, size and protection of the run being built.
    open: Option<(usize, usize, PageFlags)>,
}

impl Scanner {
    fn visit(
        &mut self,
        table: &PageTable,
        level: Level,
        base: usize,
        slots: Range<usize>,
    ) -> Result<(), MapError> {
        for (index, slot) in table.slots(slots) {
            let entry = slot.load();
            let start = base + (index << level.shift());
            if !entry.is_present() {
                self.close();
                continue;
            }

            match level.next_lower() {
                None => self.extend(start, PageSize::Size4KiB.bytes(), entry.mapping_flags()),
                Some(_) if entry.is_huge() => match level.leaf_size() {
                    Some(PageSize::Size1GiB) => {
                        self.extend(start, PageSize::Size1GiB.bytes(), entry.mapping_flags())
                    }
                    Some(_) => return Err(MapError::Unsupported(Unsupported::LargePageDescription)),
                    None => crate::error::corrupted(format_args!(
                        "huge bit set in {level} slot {index}"
                    )),
                },
                Some(lower) => {
                    // SAFETY: present non-huge entries link live tables; the caller holds
                    // the space lock.
                    let child = unsafe { TableHandle::from_entry(entry).get() };
                    self.visit(child, lower, start, 0..ENTRY_COUNT)?;
                }
            }
        }
        Ok(())
    }

    fn extend(&mut self, start: usize, size: usize, flags: PageFlags) {
        let flags = flags.protection();
        if let Some((open_start, open_size, open_flags)) = self.open.as_mut() {
            if *open_start + *open_size == start && *open_flags == flags {
                *open_size += size;
                return;
            }
        }
        self.close();
        self.open = Some((start, size, flags));
    }

    fn close(&mut self) {
        if let Some((start, size, flags)) = self.open.take() {
            self.ranges.push(MappedRange {
                start: VirtualAddress::from_stripped(start),
                size,
                flags,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frames;
    use crate::walker::{Walk, descend};
    use crate::{FrameAllocator, Mmu, PageEntry, PhysicalAddress, UniprocessorShootdown};

    #[test]
    fn coalesces_adjacent_pages() {
        let frames = frames(32);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let space = mmu.create().unwrap();
        let flags = PageFlags::empty().writable().user();

        for page in 0..3 {
            space
                .map(
                    VirtualAddress::new(0x40_0000 + page * 0x1000),
                    frames.alloc_frame().unwrap(),
                    flags,
                )
                .unwrap();
        }

        assert_eq!(
            space.describe().unwrap(),
            alloc::vec![MappedRange {
                start: VirtualAddress::new(0x40_0000),
                size: 0x3000,
                flags,
            }]
        );
    }

    #[test]
    fn splits_on_gap_and_protection_change() {
        let frames = frames(32);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let space = mmu.create().unwrap();
        let rw = PageFlags::empty().writable();
        let ro = PageFlags::empty();

        for (page, flags) in [(0x1000, rw), (0x2000, ro), (0x4000, ro)] {
            let frame = frames.alloc_frame().unwrap();
            space.map(VirtualAddress::new(page), frame, flags).unwrap();
        }

        let ranges = space.describe().unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| (r.start.as_usize(), r.size)).collect();
        assert_eq!(starts, alloc::vec![(0x1000, 0x1000), (0x2000, 0x1000), (0x4000, 0x1000)]);
    }

    #[test]
    fn physical_discontinuity_does_not_split() {
        let frames = frames(32);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let space = mmu.create().unwrap();
        let low = frames.alloc_frame().unwrap();
        let high = frames.alloc_frame().unwrap();

        space.map(VirtualAddress::new(0x1000), high, PageFlags::empty()).unwrap();
        space.map(VirtualAddress::new(0x2000), low, PageFlags::empty()).unwrap();

        assert_eq!(space.describe().unwrap().len(), 1);
    }

    #[test]
    fn halves_are_reported_separately_and_canonically() {
        let frames = frames(300);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let kernel = mmu.create_kernel_space().unwrap();
        let flags = PageFlags::empty().writable();

        for page in [0x0000_7FFF_FFFF_F000, 0xFFFF_8000_0000_0000] {
            let frame = frames.alloc_frame().unwrap();
            kernel.map(VirtualAddress::new(page), frame, flags).unwrap();
        }

        let ranges = kernel.describe().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, VirtualAddress::new(0x0000_7FFF_FFFF_F000));
        assert_eq!(ranges[1].start, VirtualAddress::new(0xFFFF_8000_0000_0000));
    }

    #[test]
    fn describes_gigabyte_pages() {
        let frames = frames(32);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let space = mmu.create().unwrap();
        let root = unsafe { TableHandle::new(space.root_address()).get() };

        let vaddr = VirtualAddress::new(0x4000_0000);
        let Walk::Slot(slot) = descend(root, vaddr, Level::Pdpt, Some(mmu.nodes())).unwrap() else {
            panic!("expected a PDPT slot");
        };
        slot.store(PageEntry::huge(
            PhysicalAddress::new(0x8000_0000),
            PageFlags::empty().writable(),
            PageSize::Size1GiB,
        ));

        let ranges = space.describe().unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, vaddr);
        assert_eq!(ranges[0].size, 1 << 30);
        assert_eq!(ranges[0].to_string(), "0x0000000040000000 .. 0x0000000080000000 (-wx) 1GiB");
    }

    #[test]
    fn refuses_two_megabyte_pages() {
        let frames = frames(32);
        let mmu = Mmu::new(&frames, &UniprocessorShootdown);
        let space = mmu.create().unwrap();
        let root = unsafe { TableHandle::new(space.root_address()).get() };

        let Walk::Slot(slot) =
            descend(root, VirtualAddress::new(0x20_0000), Level::Pd, Some(mmu.nodes())).unwrap()
        else {
            panic!("expected a PD slot");
        };
        slot.store(PageEntry::huge(
            PhysicalAddress::new(0x20_0000),
            PageFlags::empty(),
            PageSize::Size2MiB,
        ));

        assert_eq!(
            space.describe(),
            Err(MapError::Unsupported(Unsupported::LargePageDescription))
        );
    }
}
