//! TLB maintenance after page table changes.
//!
//! A change is always flushed on the CPU that made it. Kernel-half changes are visible
//! through every address space, so every other online CPU is told too. User-half changes
//! only matter to CPUs currently running the space that changed.

use core::fmt;

use crate::{VirtualAddress, arch};

/// A set of CPU indices, up to 64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const MAX_CPUS: usize = 64;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The set holding only `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is 64 or higher.
    pub const fn single(cpu: usize) -> Self {
        assert!(cpu < Self::MAX_CPUS, "cpu index out of range");
        Self(1 << cpu)
    }

    /// The set of CPUs `0..count`.
    pub const fn first(count: usize) -> Self {
        if count >= Self::MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < Self::MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn without(self, cpu: usize) -> Self {
        if cpu < Self::MAX_CPUS {
            Self(self.0 & !(1 << cpu))
        } else {
            self
        }
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..Self::MAX_CPUS).filter(move |cpu| self.contains(*cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// What a CPU must drop from its TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Page(VirtualAddress),
    All,
}

/// The interrupt side of TLB shootdown, supplied by the kernel.
pub trait Shootdown: Sync {
    /// Index of the CPU executing the caller.
    fn current_cpu(&self) -> usize;

    /// CPUs that are up and may hold translations.
    fn online_cpus(&self) -> CpuSet;

    /// Delivers `invalidation` to every CPU in `targets` and waits until each has performed
    /// it with [`invalidate_local`]. `targets` never contains the calling CPU.
    fn broadcast(&self, targets: CpuSet, invalidation: Invalidation);
}

/// Shootdown for a machine with a single CPU. There is never anyone to notify.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniprocessorShootdown;

impl Shootdown for UniprocessorShootdown {
    fn current_cpu(&self) -> usize {
        0
    }

    fn online_cpus(&self) -> CpuSet {
        CpuSet::single(0)
    }

    fn broadcast(&self, targets: CpuSet, _invalidation: Invalidation) {
        debug_assert!(targets.is_empty(), "no other CPUs to notify: {targets:?}");
    }
}

/// Performs `invalidation` on the calling CPU. IPI handlers call this on the receiving side.
pub fn invalidate_local(invalidation: Invalidation) {
    match invalidation {
        Invalidation::Page(page) => arch::flush_page(page),
        Invalidation::All => arch::flush_all(),
    }
}

/// Issues local flushes and cross-CPU shootdowns.
pub struct Tlb<'a> {
    shootdown: &'a dyn Shootdown,
}

impl<'a> Tlb<'a> {
    pub fn new(shootdown: &'a dyn Shootdown) -> Self {
        Self { shootdown }
    }

    pub fn current_cpu(&self) -> usize {
        self.shootdown.current_cpu()
    }

    /// Drops the translation of `page` wherever it may be cached.
    ///
    /// `active` is the set of CPUs running the address space that changed.
    pub fn invalidate_page(&self, page: VirtualAddress, active: CpuSet) {
        let invalidation = Invalidation::Page(page);
        invalidate_local(invalidation);

        let targets = if page.is_kernel() {
            self.shootdown.online_cpus()
        } else {
            active
        };
        self.notify(targets, invalidation);
    }

    /// Drops every non-global translation of the address space running on `active`.
    pub fn invalidate_all(&self, active: CpuSet) {
        invalidate_local(Invalidation::All);
        self.notify(active, Invalidation::All);
    }

    fn notify(&self, targets: CpuSet, invalidation: Invalidation) {
        let targets = targets
            .intersection(self.shootdown.online_cpus())
            .without(self.current_cpu());
        if targets.is_empty() {
            return;
        }
        #[cfg(feature = "detailed-logging")]
        log::trace!("shootdown {invalidation:?} to {targets:?}");
        self.shootdown.broadcast(targets, invalidation);
    }
}
