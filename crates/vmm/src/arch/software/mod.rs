//! Software emulation for testing and development.
//!
//! Page tables keep the real x86-64 layout. Physical memory is a page-aligned host buffer,
//! and the privileged instructions are recorded per thread instead of executed, so tests
//! can assert on TLB maintenance.

use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::PAGE_SIZE;
use crate::{Invalidation, PhysicalAddress, VirtualAddress};

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space for testing page table operations
/// without requiring actual hardware or virtual memory support from the host OS.
/// Physical address 0 is never handed out, so a zero frame stays recognizably invalid.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
    /// Next allocation offset (simple bump allocator).
    next_alloc: AtomicUsize,
}

// SAFETY: the buffer is only reached through raw pointers handed out by `translate`;
// callers synchronize access to the bytes behind them.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed, page-aligned emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(PAGE_SIZE), PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid emulated memory size {size:#x}"),
        };
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self {
            base,
            layout,
            next_alloc: AtomicUsize::new(PAGE_SIZE),
        }
    }

    /// Allocates a block of memory from the emulated space.
    ///
    /// Returns the physical address of the allocated block, or None if
    /// there's not enough space.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);

            let aligned = current.checked_add(align - 1)? & !(align - 1);
            let end = aligned.checked_add(size)?;

            if end > self.size() {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `len` bytes starting at `phys` do not lie inside the emulated memory.
    pub fn translate(&self, phys: usize, len: usize) -> *mut u8 {
        assert!(
            phys.checked_add(len).is_some_and(|end| end <= self.size()),
            "physical address {phys:#x} out of bounds"
        );
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

std::thread_local! {
    static INVALIDATIONS: RefCell<Vec<Invalidation>> = const { RefCell::new(Vec::new()) };
    static LOADED_ROOT: Cell<Option<PhysicalAddress>> = const { Cell::new(None) };
}

/// Most invalidations kept per thread between calls to [`take_invalidations`].
pub const INVALIDATION_LOG_LIMIT: usize = 1024;

fn record(invalidation: Invalidation) {
    INVALIDATIONS.with(|log| {
        let mut log = log.borrow_mut();
        if log.len() >= INVALIDATION_LOG_LIMIT {
            // A full flush covers everything recorded before it.
            log.clear();
            log.push(Invalidation::All);
        }
        log.push(invalidation);
    });
}

/// Records a single-page invalidation on the calling thread.
pub fn flush_page(page: VirtualAddress) {
    record(Invalidation::Page(page));
}

/// Records a full invalidation on the calling thread.
pub fn flush_all() {
    record(Invalidation::All);
}

/// Records `root` as the table the calling thread's "CPU" translates through.
///
/// # Safety
///
/// Always safe in emulation; the signature mirrors the hardware hook.
pub unsafe fn load_root(root: PhysicalAddress) {
    LOADED_ROOT.with(|loaded| loaded.set(Some(root)));
}

/// Drains the invalidations recorded on the calling thread.
pub fn take_invalidations() -> Vec<Invalidation> {
    INVALIDATIONS.with(|log| core::mem::take(&mut *log.borrow_mut()))
}

/// Returns the root most recently loaded on the calling thread.
pub fn loaded_root() -> Option<PhysicalAddress> {
    LOADED_ROOT.with(|loaded| loaded.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_starts_zeroed_and_aligned() {
        let mem = EmulatedMemory::new(8 * PAGE_SIZE);
        let ptr = mem.translate(PAGE_SIZE, PAGE_SIZE);
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn never_hands_out_frame_zero() {
        let mem = EmulatedMemory::new(8 * PAGE_SIZE);
        assert_eq!(mem.allocate(PAGE_SIZE, PAGE_SIZE), Some(PAGE_SIZE));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn translate_checks_bounds() {
        let mem = EmulatedMemory::new(2 * PAGE_SIZE);
        mem.translate(PAGE_SIZE, PAGE_SIZE + 1);
    }

    #[test]
    fn records_flushes_in_order() {
        take_invalidations();
        let page = VirtualAddress::new(0x4000);
        flush_page(page);
        flush_all();
        assert_eq!(
            take_invalidations(),
            alloc::vec![Invalidation::Page(page), Invalidation::All]
        );
        assert!(take_invalidations().is_empty());
    }

    #[test]
    fn flush_log_stays_bounded() {
        take_invalidations();
        for index in 0..INVALIDATION_LOG_LIMIT + 10 {
            flush_page(VirtualAddress::new(index * PAGE_SIZE));
        }

        let log = take_invalidations();
        assert!(log.len() <= INVALIDATION_LOG_LIMIT);
        assert_eq!(log[0], Invalidation::All);
        assert_eq!(
            log.last(),
            Some(&Invalidation::Page(VirtualAddress::new(
                (INVALIDATION_LOG_LIMIT + 9) * PAGE_SIZE
            )))
        );
    }

    #[test]
    fn records_loaded_root() {
        assert_eq!(loaded_root(), None);
        unsafe { load_root(PhysicalAddress::new(0x5000)) };
        assert_eq!(loaded_root(), Some(PhysicalAddress::new(0x5000)));
    }
}
