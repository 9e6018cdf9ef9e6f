#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! The Virtual Memory Manager (VMM) owns the x86-64 page tables of the Polaris kernel. It
//! provides:
//!
//! - Address spaces with 4 KiB map, unmap, query and bulk operations.
//! - A kernel half shared by every address space.
//! - Page table node allocation on top of any physical frame allocator.
//! - TLB invalidation, including cross-CPU shootdown through kernel-supplied hooks.
//! - Software emulation for testing in non-kernel environments.
//!
//! Physical memory is reached through the [`AddressTranslator`]; frames come from a
//! kernel-supplied [`FrameAllocator`]; other CPUs are reached through a [`Shootdown`].

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod describe;
mod entry;
mod error;
mod flags;
mod frame_allocator;
mod human_size;
mod mmu;
mod node_pool;
mod numbers;
mod table;
mod tlb;
mod walker;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, ClonePartitions, SpaceKind, Translation};
pub use describe::MappedRange;
pub use entry::PageEntry;
pub use error::{EINVAL, ENOMEM, ENOSYS, InvalidArgument, MapError, RangeError, Unsupported};
pub use flags::{PageFlags, PageSize};
pub use frame_allocator::{AllocError, FrameAllocator};
pub use human_size::HumanSize;
pub use mmu::Mmu;
pub use node_pool::NodePool;
pub use numbers::{FrameNumber, PageNumber};
pub use table::{EntrySlot, Level, PageTable};
pub use tlb::{CpuSet, Invalidation, Shootdown, Tlb, UniprocessorShootdown, invalidate_local};

pub use arch::PAGE_SIZE;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, loaded_root, take_invalidations};
#[cfg(any(test, feature = "software-emulation"))]
pub use frame_allocator::EmulatedFrames;
