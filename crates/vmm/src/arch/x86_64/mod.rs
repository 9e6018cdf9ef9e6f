//! x86_64 privileged instructions used by the page-table core.

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr, instructions::tlb};

use crate::{PhysicalAddress, VirtualAddress};

/// Invalidates the local TLB entry for a single page.
#[inline]
pub fn flush_page(page: VirtualAddress) {
    tlb::flush(VirtAddr::new(page.as_u64()));
}

/// Invalidates every non-global local TLB entry by reloading CR3.
#[inline]
pub fn flush_all() {
    tlb::flush_all();
}

/// Loads `root` into CR3.
///
/// # Safety
///
/// `root` must be the physical address of a complete PML4 that maps the currently
/// executing code and stack.
pub unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
