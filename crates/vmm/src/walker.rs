//! Walking from a root table down to the entry governing an address.

use crate::error::corrupted;
use crate::table::{EntrySlot, Level, PageTable, TableHandle};
use crate::{MapError, NodePool, PageEntry, PageSize, VirtualAddress};

/// Where a walk ended.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Walk<'t> {
    /// The slot at the requested level. It may be empty.
    Slot(&'t EntrySlot),
    /// A huge leaf above the requested level already covers the address.
    Huge(&'t EntrySlot, PageSize),
    /// An intermediate table is missing and creation was not requested.
    Absent(Level),
}

/// Finds the 4 KiB leaf slot for `vaddr`.
///
/// With `nodes`, missing intermediate tables are allocated, zeroed and linked as the walk
/// goes down; a walk with `nodes` never ends in [`Walk::Absent`].
pub(crate) fn locate<'t>(
    root: &'t PageTable,
    vaddr: VirtualAddress,
    nodes: Option<&NodePool<'_>>,
) -> Result<Walk<'t>, MapError> {
    descend(root, vaddr, Level::Pt, nodes)
}

/// Walks down to the slot at `target` for `vaddr`.
pub(crate) fn descend<'t>(
    root: &'t PageTable,
    vaddr: VirtualAddress,
    target: Level,
    nodes: Option<&NodePool<'_>>,
) -> Result<Walk<'t>, MapError> {
    let stripped = vaddr.strip();
    let mut table = root;
    let mut level = Level::Pml4;

    loop {
        let slot = table.slot(level.index_of(stripped));
        if level == target {
            return Ok(Walk::Slot(slot));
        }
        let Some(lower) = level.next_lower() else {
            return Ok(Walk::Slot(slot));
        };

        let mut entry = slot.load();
        if !entry.is_present() {
            let Some(nodes) = nodes else {
                return Ok(Walk::Absent(lower));
            };
            let node = nodes.alloc_node()?;
            entry = PageEntry::table(node);
            slot.store(entry);
            log::debug!("{vaddr}: new {lower} at {node}");
        } else if entry.is_huge() {
            match level.leaf_size() {
                Some(size) => return Ok(Walk::Huge(slot, size)),
                None => corrupted(format_args!("huge bit set in {level} entry for {vaddr}")),
            }
        }

        // SAFETY: present non-huge entries always link a live table of the tree.
        table = unsafe { TableHandle::from_entry(entry).get() };
        level = lower;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frames;
    use crate::{PageFlags, PhysicalAddress};

    fn root(pool: &NodePool<'_>) -> &'static PageTable {
        let node = pool.alloc_node().unwrap();
        unsafe { node.get() }
    }

    #[test]
    fn lookup_without_tables_is_absent() {
        let frames = frames(8);
        let pool = NodePool::new(&frames);
        let root = root(&pool);

        let walk = locate(root, VirtualAddress::new(0x40_0000), None).unwrap();
        assert!(matches!(walk, Walk::Absent(Level::Pdpt)));
        assert_eq!(pool.live_nodes(), 1);
    }

    #[test]
    fn creates_three_tables_once() {
        let frames = frames(8);
        let pool = NodePool::new(&frames);
        let root = root(&pool);
        let vaddr = VirtualAddress::new(0x7F00_0000_1000);

        let Walk::Slot(slot) = locate(root, vaddr, Some(&pool)).unwrap() else {
            panic!("expected a leaf slot");
        };
        assert_eq!(pool.live_nodes(), 4);
        slot.store(PageEntry::leaf(PhysicalAddress::new(0x8000), PageFlags::empty()));

        let Walk::Slot(again) = locate(root, vaddr, Some(&pool)).unwrap() else {
            panic!("expected a leaf slot");
        };
        assert_eq!(pool.live_nodes(), 4);
        assert_eq!(again.load().address(), Some(PhysicalAddress::new(0x8000)));

        // The neighbouring page shares all three tables.
        locate(root, vaddr + 0x1000, Some(&pool)).unwrap();
        assert_eq!(pool.live_nodes(), 4);
    }

    #[test]
    fn intermediate_entries_are_permissive() {
        let frames = frames(8);
        let pool = NodePool::new(&frames);
        let root = root(&pool);
        let vaddr = VirtualAddress::new(0x1000);

        locate(root, vaddr, Some(&pool)).unwrap();
        let top = root.slot(vaddr.table_index(Level::Pml4)).load();
        assert!(top.is_present());
        assert!(top.mapping_flags().is_writable());
        assert!(top.mapping_flags().is_user());
    }

    #[test]
    fn stops_at_huge_leaf() {
        let frames = frames(8);
        let pool = NodePool::new(&frames);
        let root = root(&pool);
        let vaddr = VirtualAddress::new(0x4000_0000);

        let Walk::Slot(pdpt_slot) = descend(root, vaddr, Level::Pdpt, Some(&pool)).unwrap() else {
            panic!("expected a PDPT slot");
        };
        pdpt_slot.store(PageEntry::huge(
            PhysicalAddress::new(0x8000_0000),
            PageFlags::empty(),
            PageSize::Size1GiB,
        ));

        let walk = locate(root, vaddr + 0x1234_5000, Some(&pool)).unwrap();
        assert!(matches!(walk, Walk::Huge(_, PageSize::Size1GiB)));
        assert_eq!(pool.live_nodes(), 2);
    }

    #[test]
    fn reports_exhaustion_part_way() {
        let frames = frames(2);
        let pool = NodePool::new(&frames);
        let root = root(&pool);

        assert_eq!(
            locate(root, VirtualAddress::new(0x1000), Some(&pool)).unwrap_err(),
            MapError::OutOfMemory
        );
        // The PDPT that did get allocated stays linked for the next attempt.
        assert!(root.slot(0).load().is_present());
    }

    #[test]
    #[should_panic(expected = "page table corruption")]
    fn huge_bit_in_top_level_is_fatal() {
        let frames = frames(4);
        let pool = NodePool::new(&frames);
        let root = root(&pool);
        root.slot(0).store(PageEntry::huge(
            PhysicalAddress::new(0x4000_0000),
            PageFlags::empty(),
            PageSize::Size1GiB,
        ));

        let _ = locate(root, VirtualAddress::new(0x1000), None);
    }
}
