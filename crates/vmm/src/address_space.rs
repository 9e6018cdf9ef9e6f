//! Address spaces: a page-table tree plus the operations that edit it.
//!
//! Each space has a reader-writer lock over its tree. Mutations take it exclusively,
//! lookups and dumps share it. Work below the kernel slots additionally takes the MMU's
//! kernel-region lock, always after the space lock.

use alloc::vec::Vec;
use core::fmt;
use core::ops::BitOr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{self, PAGE_SIZE};
use crate::describe::{self, MappedRange};
use crate::error::{corrupted, misuse};
use crate::table::{KERNEL_SLOTS, Level, PageTable, TableHandle, USER_SLOTS};
use crate::walker::{self, Walk};
use crate::{
    CpuSet, InvalidArgument, MapError, Mmu, PageEntry, PageFlags, PageNumber, PageSize,
    PhysicalAddress, RangeError, Unsupported, VirtualAddress,
};

/// Whether a space is the kernel's own or a process's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Owns the shared kernel-half tables. Never torn down.
    Kernel,
    User,
}

/// Which halves [`AddressSpace::clone_from`] copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClonePartitions(u8);

impl ClonePartitions {
    pub const KERNEL: Self = Self(1 << 0);
    pub const USER: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ClonePartitions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result of a successful [`AddressSpace::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the queried virtual address translates to, offset included.
    pub address: PhysicalAddress,
    /// Size of the leaf that maps it.
    pub size: PageSize,
    pub flags: PageFlags,
}

/// Counters gathered while tearing down a user half.
#[derive(Debug, Default)]
struct Teardown {
    frames: usize,
    tables: usize,
    leaked_huge: usize,
}

pub struct AddressSpace<'m> {
    mmu: &'m Mmu<'m>,
    root: spin::RwLock<TableHandle>,
    /// Copy of the root address, which never changes, for lock-free reporting.
    root_address: PhysicalAddress,
    /// CPUs currently translating through this space.
    active: AtomicU64,
    kind: SpaceKind,
}

impl<'m> AddressSpace<'m> {
    pub(crate) fn new(mmu: &'m Mmu<'m>, root: TableHandle, kind: SpaceKind) -> Self {
        Self {
            mmu,
            root: spin::RwLock::new(root),
            root_address: root.address(),
            active: AtomicU64::new(0),
            kind,
        }
    }

    pub fn root_address(&self) -> PhysicalAddress {
        self.root_address
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::Acquire))
    }

    /// Switches the calling CPU to this space and records it as active here.
    ///
    /// # Safety
    ///
    /// The space must map the code and stack the CPU is executing from, and the caller
    /// must [`deactivate`](Self::deactivate) the space it was running before.
    pub unsafe fn activate(&self) {
        let cpu = self.mmu.tlb().current_cpu();
        self.active
            .fetch_or(CpuSet::single(cpu).bits(), Ordering::AcqRel);
        // SAFETY: forwarded to the caller.
        unsafe { arch::load_root(self.root_address) };
    }

    /// Records that the calling CPU no longer runs this space.
    pub fn deactivate(&self) {
        let cpu = self.mmu.tlb().current_cpu();
        self.active
            .fetch_and(!CpuSet::single(cpu).bits(), Ordering::AcqRel);
    }

    /// Maps the 4 KiB page at `vaddr` to `frame`.
    ///
    /// Missing intermediate tables are created. Mapping a page that is already mapped is
    /// misuse; the existing mapping is left untouched.
    pub fn map(
        &self,
        vaddr: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_page(vaddr)?;
        check_frame(frame)?;

        let root = self.root.write();
        let _kernel = self.lock_kernel_region_for(vaddr);
        self.map_locked(&root, vaddr, frame, flags)
    }

    /// Removes the 4 KiB mapping at `vaddr` and returns the frame it pointed to.
    ///
    /// Intermediate tables stay in place even when they become empty.
    pub fn unmap(&self, vaddr: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        check_page(vaddr)?;

        let root = self.root.write();
        let _kernel = self.lock_kernel_region_for(vaddr);
        // SAFETY: the root is live while the space exists; the write lock is held.
        let table = unsafe { root.get() };

        match walker::locate(table, vaddr, None)? {
            Walk::Slot(slot) => {
                let entry = slot.load();
                let Some(frame) = entry.address() else {
                    return Err(misuse(InvalidArgument::NotMapped, vaddr));
                };
                slot.store(PageEntry::EMPTY);
                self.mmu.tlb().invalidate_page(vaddr, self.active_cpus());
                #[cfg(feature = "detailed-logging")]
                log::trace!("{}: unmap {vaddr} (was {frame})", self.root_address);
                Ok(frame)
            }
            Walk::Huge(_, size) => {
                log::warn!("{}: unmap {vaddr} inside a {size} mapping", self.root_address);
                Err(MapError::Unsupported(Unsupported::HugePage))
            }
            Walk::Absent(_) => Err(misuse(InvalidArgument::NotMapped, vaddr)),
        }
    }

    /// Translates `vaddr`, which need not be page-aligned.
    ///
    /// Understands 4 KiB, 2 MiB and 1 GiB leaves. Returns None if nothing maps `vaddr`.
    pub fn query(&self, vaddr: VirtualAddress) -> Option<Translation> {
        let root = self.root.read();
        self.query_locked(&root, vaddr)
    }

    /// Maps `count` consecutive pages starting at `vbase` to consecutive frames from
    /// `pbase`, all with the same flags.
    ///
    /// Stops at the first failure. Pages mapped before it stay mapped; the error says how
    /// many there were.
    pub fn map_range(
        &self,
        vbase: VirtualAddress,
        pbase: PhysicalAddress,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), RangeError> {
        let failed = |mapped, cause| RangeError { mapped, cause };
        check_page(vbase).map_err(|cause| failed(0, cause))?;
        check_frame(pbase).map_err(|cause| failed(0, cause))?;

        // A range cannot cross between halves, so the first page decides.
        let root = self.root.write();
        let _kernel = self.lock_kernel_region_for(vbase);
        for index in 0..count {
            let offset = index.saturating_mul(PAGE_SIZE);
            let (Some(vaddr), Some(frame)) = (vbase.checked_add(offset), pbase.checked_add(offset))
            else {
                return Err(failed(index, misuse(InvalidArgument::NonCanonical, vbase)));
            };
            self.map_locked(&root, vaddr, frame, flags)
                .map_err(|cause| failed(index, cause))?;
        }

        log::debug!(
            "{}: mapped {count} pages at {vbase} -> {pbase}",
            self.root_address
        );
        Ok(())
    }

    /// Backs every unmapped page overlapping `start..end` with a fresh frame.
    ///
    /// Pages that are already mapped are left alone. Returns how many frames were mapped.
    /// On failure the pages backed so far stay mapped and the frame being mapped is
    /// returned to the allocator.
    pub fn populate(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: PageFlags,
    ) -> Result<usize, MapError> {
        if end <= start {
            return Ok(0);
        }
        if start.is_kernel() != end.is_kernel() {
            return Err(misuse(InvalidArgument::NonCanonical, end));
        }

        let first = PageNumber::containing(start);
        let last = PageNumber::containing(end - 1);
        let frames = self.mmu.frames();

        let root = self.root.write();
        let _kernel = self.lock_kernel_region_for(start);
        let mut backed = 0;
        for number in first.as_usize()..=last.as_usize() {
            let page = PageNumber::new(number).start();
            if self.query_locked(&root, page).is_some() {
                continue;
            }
            let frame = frames.alloc_frame()?;
            if let Err(err) = self.map_locked(&root, page, frame, flags) {
                frames.free_frame(frame);
                return Err(err);
            }
            backed += 1;
        }

        log::debug!(
            "{}: populated {start}..{end}, {backed} new frames",
            self.root_address
        );
        Ok(backed)
    }

    /// Copies the selected halves of `src` into this space.
    ///
    /// Copying the kernel half makes this space see exactly the kernel mappings `src` sees.
    /// Copying the user half is not implemented.
    pub fn clone_from(
        &self,
        src: &AddressSpace<'_>,
        partitions: ClonePartitions,
    ) -> Result<(), MapError> {
        if partitions.contains(ClonePartitions::USER) {
            log::warn!("{}: user-half clone requested", self.root_address);
            return Err(MapError::Unsupported(Unsupported::UserClone));
        }
        if !partitions.contains(ClonePartitions::KERNEL) || self.root_address == src.root_address {
            return Ok(());
        }

        // Two space locks are always taken in root address order.
        let (dst_root, src_root) = if self.root_address < src.root_address {
            let dst = self.root.write();
            (dst, src.root.read())
        } else {
            let src_guard = src.root.read();
            (self.root.write(), src_guard)
        };
        let _kernel = self.mmu.lock_kernel_region();

        // SAFETY: both roots are live and locked.
        let (dst, from) = unsafe { (dst_root.get(), src_root.get()) };
        let mut stale = false;
        for (index, slot) in from.slots(KERNEL_SLOTS) {
            let incoming = slot.load();
            let target = dst.slot(index);
            let previous = target.load();
            if previous != incoming {
                stale |= previous.is_present();
                target.store(incoming);
            }
        }
        if stale {
            self.mmu.tlb().invalidate_all(self.active_cpus());
        }

        log::debug!(
            "{}: kernel half cloned from {}",
            self.root_address,
            src.root_address
        );
        Ok(())
    }

    /// Tears the space down, returning its frames and tables to the allocator.
    ///
    /// Dropping a user space does the same. The kernel space is permanent: destroying it
    /// is misuse and leaves its tables in place.
    pub fn destroy(self) -> Result<(), MapError> {
        if self.kind == SpaceKind::Kernel {
            return Err(misuse(InvalidArgument::KernelSpaceTeardown, self.root_address));
        }
        drop(self);
        Ok(())
    }

    /// Lists the mapped regions, coalescing neighbours with equal protection.
    pub fn describe(&self) -> Result<Vec<MappedRange>, MapError> {
        let root = self.root.read();
        // SAFETY: the root is live while the space exists; the read lock is held.
        describe::scan(unsafe { root.get() })
    }

    /// Writes the mapped regions to the log at debug level.
    pub fn log_layout(&self) {
        match self.describe() {
            Ok(ranges) => {
                log::debug!("address space {} ({:?}):", self.root_address, self.kind);
                let (kernel, user): (Vec<&MappedRange>, Vec<&MappedRange>) =
                    ranges.iter().partition(|range| range.start.is_kernel());
                for (name, ranges) in [("user", user), ("kernel", kernel)] {
                    log::debug!("- {name}:");
                    for range in ranges {
                        log::debug!("    {range}");
                    }
                }
            }
            Err(err) => log::warn!("address space {}: {err}", self.root_address),
        }
    }

    fn map_locked(
        &self,
        root: &TableHandle,
        vaddr: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        // SAFETY: the root is live while the space exists; the caller holds the write lock.
        let table = unsafe { root.get() };
        self.share_kernel_slot(table, vaddr)?;

        match walker::locate(table, vaddr, Some(self.mmu.nodes()))? {
            Walk::Slot(slot) => {
                let existing = slot.load();
                if existing.is_present() {
                    return Err(misuse(InvalidArgument::AlreadyMapped, vaddr));
                }
                slot.store(PageEntry::leaf(frame, flags));
                self.mmu.tlb().invalidate_page(vaddr, self.active_cpus());
                #[cfg(feature = "detailed-logging")]
                log::trace!("{}: map {vaddr} -> {frame} [{flags}]", self.root_address);
                Ok(())
            }
            Walk::Huge(_, size) => {
                log::warn!("{}: map {vaddr} inside a {size} mapping", self.root_address);
                Err(MapError::Unsupported(Unsupported::HugePage))
            }
            Walk::Absent(level) => corrupted(format_args!(
                "missing {level} for {vaddr} after creating tables"
            )),
        }
    }

    fn query_locked(&self, root: &TableHandle, vaddr: VirtualAddress) -> Option<Translation> {
        // SAFETY: the root is live while the space exists; the caller holds a lock.
        let table = unsafe { root.get() };

        let (entry, size) = match walker::locate(table, vaddr, None).ok()? {
            Walk::Slot(slot) => (slot.load(), PageSize::Size4KiB),
            Walk::Huge(slot, size) => (slot.load(), size),
            Walk::Absent(_) => return None,
        };
        let base = entry.frame_base(size)?;
        let offset = vaddr.strip() & (size.bytes() - 1);
        Some(Translation {
            address: base + offset,
            size,
            flags: entry.mapping_flags(),
        })
    }

    /// Links the kernel PDPT covering `vaddr` into this root if the slot is still empty.
    ///
    /// Tables below a kernel slot belong to every space, so they are taken from the kernel
    /// root and never built privately. The caller holds the kernel-region lock.
    fn share_kernel_slot(&self, table: &PageTable, vaddr: VirtualAddress) -> Result<(), MapError> {
        if !vaddr.is_kernel() {
            return Ok(());
        }
        let index = vaddr.table_index(Level::Pml4);
        let slot = table.slot(index);
        if slot.load().is_present() {
            return Ok(());
        }

        let Some(template) = self.mmu.kernel_template() else {
            return Err(misuse(InvalidArgument::NoKernelSpace, vaddr));
        };
        // SAFETY: the kernel root lives as long as the MMU.
        let shared = unsafe { template.get() }.slot(index).load();
        if !shared.is_present() {
            corrupted(format_args!("kernel PML4 slot {index} has no PDPT"));
        }
        slot.store(shared);
        Ok(())
    }

    fn lock_kernel_region_for(&self, vaddr: VirtualAddress) -> Option<spin::MutexGuard<'m, ()>> {
        vaddr.is_kernel().then(|| self.mmu.lock_kernel_region())
    }

    /// Frees every table and frame reachable from a user-half entry.
    fn release(&self, link: PageEntry, level: Level, stats: &mut Teardown) {
        let node = TableHandle::from_entry(link);
        // SAFETY: the entry was just unlinked from a tree this space owns exclusively.
        let table: &PageTable = unsafe { node.get() };

        for (_, slot) in table.slots(0..arch::ENTRY_COUNT) {
            let entry = slot.take();
            let Some(frame) = entry.address() else {
                continue;
            };
            match level.next_lower() {
                None => {
                    self.mmu.frames().free_frame(frame);
                    stats.frames += 1;
                }
                Some(_) if entry.is_huge() => stats.leaked_huge += 1,
                Some(lower) => self.release(entry, lower, stats),
            }
        }

        self.mmu.nodes().free_node(node);
        stats.tables += 1;
    }
}

impl Drop for AddressSpace<'_> {
    fn drop(&mut self) {
        if self.kind == SpaceKind::Kernel {
            return;
        }

        let active = self.active_cpus();
        if !active.is_empty() {
            log::warn!(
                "{}: destroyed while active on {active:?}",
                self.root_address
            );
            self.mmu.tlb().invalidate_all(active);
        }

        let root = *self.root.get_mut();
        // SAFETY: `&mut self` means no one else can reach the tree.
        let table = unsafe { root.get() };
        let mut stats = Teardown::default();
        for (index, slot) in table.slots(USER_SLOTS) {
            let entry = slot.take();
            if !entry.is_present() {
                continue;
            }
            if entry.is_huge() {
                corrupted(format_args!("huge bit set in PML4 slot {index}"));
            }
            self.release(entry, Level::Pdpt, &mut stats);
        }
        self.mmu.nodes().free_node(root);
        stats.tables += 1;

        if stats.leaked_huge > 0 {
            log::warn!(
                "{}: leaked {} huge mappings",
                self.root_address,
                stats.leaked_huge
            );
        }
        log::debug!(
            "destroyed address space {}: {} frames, {} tables",
            self.root_address,
            stats.frames,
            stats.tables
        );
    }
}

impl fmt::Debug for AddressSpace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root_address)
            .field("kind", &self.kind)
            .field("active", &self.active_cpus())
            .finish()
    }
}

fn check_page(vaddr: VirtualAddress) -> Result<(), MapError> {
    if vaddr.is_aligned(PAGE_SIZE) {
        Ok(())
    } else {
        Err(misuse(InvalidArgument::UnalignedAddress, vaddr))
    }
}

fn check_frame(frame: PhysicalAddress) -> Result<(), MapError> {
    if frame.is_aligned(PAGE_SIZE) {
        Ok(())
    } else {
        Err(misuse(InvalidArgument::UnalignedFrame, frame))
    }
}
