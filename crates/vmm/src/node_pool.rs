//! Page table node allocation.
//!
//! Nodes are ordinary frames from the [`FrameAllocator`]. Freed nodes are kept on a short
//! intrusive list so that address-space churn does not hammer the frame allocator; the
//! link to the next cached node is written into the freed node itself.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::table::TableHandle;
use crate::{AddressTranslator, FrameAllocator, MapError, PhysicalAddress};

/// Cached nodes beyond this count go straight back to the frame allocator.
const CACHE_LIMIT: usize = 32;

/// Link written into the first word of a cached node.
#[repr(C)]
struct FreeNode {
    next: Option<PhysicalAddress>,
}

/// Intrusive list of cached nodes.
struct FreeList {
    head: Option<PhysicalAddress>,
    count: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    fn push(&mut self, node: PhysicalAddress) {
        let link = AddressTranslator::current().phys_to_ptr::<FreeNode>(node);
        // SAFETY: the node was handed back to the pool and nothing else references it.
        unsafe { link.write(FreeNode { next: self.head }) };
        self.head = Some(node);
        self.count += 1;
    }

    fn pop(&mut self) -> Option<PhysicalAddress> {
        let node = self.head?;
        let link = AddressTranslator::current().phys_to_ptr::<FreeNode>(node);
        // SAFETY: every node on the list had its link written by `push`.
        self.head = unsafe { link.read() }.next;
        self.count -= 1;
        Some(node)
    }
}

/// Allocates and frees page table nodes.
pub struct NodePool<'a> {
    frames: &'a dyn FrameAllocator,
    cache: spin::Mutex<FreeList>,
    live: AtomicUsize,
}

impl<'a> NodePool<'a> {
    pub fn new(frames: &'a dyn FrameAllocator) -> Self {
        Self {
            frames,
            cache: spin::Mutex::new(FreeList::new()),
            live: AtomicUsize::new(0),
        }
    }

    /// Returns a zeroed node, or `OutOfMemory` if no frame is available.
    pub fn alloc_node(&self) -> Result<TableHandle, MapError> {
        let cached = self.cache.lock().pop();
        let address = match cached {
            Some(address) => address,
            None => self.frames.alloc_frame().inspect_err(|_| {
                log::warn!("out of frames for page table nodes");
            })?,
        };

        let node = TableHandle::new(address);
        // SAFETY: the node was just taken from the cache or the frame allocator.
        unsafe { node.clear() };
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Returns a node that is no longer linked into any tree.
    pub fn free_node(&self, node: TableHandle) {
        self.live.fetch_sub(1, Ordering::Relaxed);

        let mut cache = self.cache.lock();
        if cache.count < CACHE_LIMIT {
            cache.push(node.address());
        } else {
            drop(cache);
            self.frames.free_frame(node.address());
        }
    }

    /// Returns every cached node to the frame allocator.
    pub fn shrink(&self) -> usize {
        let mut cache = self.cache.lock();
        let mut released = 0;
        while let Some(address) = cache.pop() {
            self.frames.free_frame(address);
            released += 1;
        }
        released
    }

    /// Nodes currently linked into some tree.
    pub fn live_nodes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Nodes parked in the recycle cache.
    pub fn cached_nodes(&self) -> usize {
        self.cache.lock().count
    }

    /// The allocator that backs both nodes and mapped frames.
    pub fn frames(&self) -> &'a dyn FrameAllocator {
        self.frames
    }
}
