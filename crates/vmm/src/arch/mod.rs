//! Architecture-specific hooks for memory management.
//!
//! The page-table format is always x86-64. What changes between builds is who executes the
//! privileged instructions: the CPU itself, or a software stand-in that records what would
//! have happened so tests can observe it.

// Use the real instructions when we're on x86_64 and not testing or emulating.
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Maximum number of bits in a physical address on x86_64.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in every page table.
pub const ENTRY_COUNT: usize = 512;
