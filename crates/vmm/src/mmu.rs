//! The MMU context shared by every address space.
//!
//! An [`Mmu`] ties together the frame allocator, the TLB shootdown hooks and the kernel
//! address space. The kernel half of every address space is a copy of the kernel root's
//! upper 256 entries; since those entries point at the same PDPTs, a kernel mapping made
//! through any space is visible in all of them.

use alloc::vec::Vec;

use crate::address_space::{AddressSpace, SpaceKind};
use crate::error::corrupted;
use crate::table::{KERNEL_SLOTS, PageTable, TableHandle};
use crate::{FrameAllocator, HumanSize, MapError, NodePool, PageEntry, PhysicalAddress, Shootdown, Tlb};

pub struct Mmu<'a> {
    nodes: NodePool<'a>,
    tlb: Tlb<'a>,
    kernel: spin::Once<TableHandle>,
    /// Serializes changes below the kernel slots, which every address space shares.
    kernel_region: spin::Mutex<()>,
}

impl<'a> Mmu<'a> {
    pub fn new(frames: &'a dyn FrameAllocator, shootdown: &'a dyn Shootdown) -> Self {
        Self {
            nodes: NodePool::new(frames),
            tlb: Tlb::new(shootdown),
            kernel: spin::Once::new(),
            kernel_region: spin::Mutex::new(()),
        }
    }

    /// Builds the kernel address space.
    ///
    /// Every kernel slot gets its own empty PDPT up front. Those PDPTs are never freed, so
    /// later kernel mappings only ever change tables shared by all address spaces and
    /// never the top level that each space holds a copy of.
    ///
    /// # Panics
    ///
    /// Panics if a kernel address space was already created or adopted.
    pub fn create_kernel_space(&self) -> Result<AddressSpace<'_>, MapError> {
        assert!(
            self.kernel.get().is_none(),
            "kernel address space already registered"
        );

        let root = self.nodes.alloc_node()?;
        // SAFETY: freshly allocated and owned here.
        if let Err(err) = self.fill_kernel_slots(unsafe { root.get() }) {
            self.nodes.free_node(root);
            return Err(err);
        }

        self.kernel.call_once(|| root);
        log::info!(
            "kernel address space at {root}, {} PDPTs ({})",
            KERNEL_SLOTS.len(),
            HumanSize(KERNEL_SLOTS.len() * crate::arch::PAGE_SIZE)
        );
        Ok(AddressSpace::new(self, root, SpaceKind::Kernel))
    }

    /// Takes over a PML4 built by boot code as the kernel address space.
    ///
    /// Kernel slots the boot code left empty get a fresh PDPT, as in
    /// [`create_kernel_space`](Self::create_kernel_space). On failure those PDPTs are freed
    /// again and nothing is registered.
    ///
    /// # Safety
    ///
    /// `root` must be a live PML4 reachable through the current [`AddressTranslator`]
    /// whose tables were not handed out by any frame allocator. It must stay allocated for
    /// the lifetime of this context.
    ///
    /// # Panics
    ///
    /// Panics if a kernel address space was already created or adopted.
    ///
    /// [`AddressTranslator`]: crate::AddressTranslator
    pub unsafe fn adopt_kernel_space(
        &self,
        root: PhysicalAddress,
    ) -> Result<AddressSpace<'_>, MapError> {
        assert!(
            self.kernel.get().is_none(),
            "kernel address space already registered"
        );
        let root = TableHandle::new(root);
        // SAFETY: forwarded to the caller.
        let added = self.fill_kernel_slots(unsafe { root.get() })?;

        self.kernel.call_once(|| root);
        log::info!("adopted kernel address space at {root}, {added} new PDPTs");
        Ok(AddressSpace::new(self, root, SpaceKind::Kernel))
    }

    /// Gives every empty kernel slot of `table` its own PDPT and returns how many it added.
    fn fill_kernel_slots(&self, table: &PageTable) -> Result<usize, MapError> {
        let mut added = Vec::new();
        for (index, slot) in table.slots(KERNEL_SLOTS) {
            let entry = slot.load();
            if entry.is_present() {
                if entry.is_huge() {
                    corrupted(format_args!("huge bit set in PML4 slot {index}"));
                }
                continue;
            }
            match self.nodes.alloc_node() {
                Ok(pdpt) => {
                    slot.store(PageEntry::table(pdpt));
                    added.push(index);
                }
                Err(err) => {
                    for index in added {
                        let entry = table.slot(index).take();
                        self.nodes.free_node(TableHandle::from_entry(entry));
                    }
                    return Err(err);
                }
            }
        }
        Ok(added.len())
    }

    /// Creates an address space with an empty user half.
    ///
    /// Once a kernel space exists, the new space also sees every kernel mapping.
    pub fn create(&self) -> Result<AddressSpace<'_>, MapError> {
        let root = self.nodes.alloc_node()?;

        if let Some(template) = self.kernel.get() {
            let _guard = self.kernel_region.lock();
            // SAFETY: the template is the live kernel root, the new root is owned here.
            let (src, dst) = unsafe { (template.get(), root.get()) };
            for (index, slot) in src.slots(KERNEL_SLOTS) {
                dst.slot(index).store(slot.load());
            }
        }

        log::debug!("created address space at {root}");
        Ok(AddressSpace::new(self, root, SpaceKind::User))
    }

    /// The kernel root every space copies its kernel slots from.
    pub(crate) fn kernel_template(&self) -> Option<TableHandle> {
        self.kernel.get().copied()
    }

    /// Root address of the kernel space, if one has been created or adopted.
    pub fn kernel_root(&self) -> Option<PhysicalAddress> {
        self.kernel.get().map(|root| root.address())
    }

    pub fn nodes(&self) -> &NodePool<'a> {
        &self.nodes
    }

    pub fn tlb(&self) -> &Tlb<'a> {
        &self.tlb
    }

    pub fn frames(&self) -> &'a dyn FrameAllocator {
        self.nodes.frames()
    }

    pub(crate) fn lock_kernel_region(&self) -> spin::MutexGuard<'_, ()> {
        self.kernel_region.lock()
    }
}
