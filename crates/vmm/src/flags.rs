//! Mapping attributes and page sizes.

use core::fmt;

use x86_64::structures::paging::PageTableFlags;

use crate::HumanSize;

/// Attributes requested for a mapping.
///
/// This wraps the x86_64 crate's entry flags but only admits the bits a caller may choose.
/// Structural bits (present, huge, accessed, dirty) are owned by the page-table core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    const MAPPING_MASK: u64 = PageTableFlags::WRITABLE.bits()
        | PageTableFlags::USER_ACCESSIBLE.bits()
        | PageTableFlags::WRITE_THROUGH.bits()
        | PageTableFlags::NO_CACHE.bits()
        | PageTableFlags::GLOBAL.bits()
        | PageTableFlags::NO_EXECUTE.bits();

    /// Read-only, supervisor-only, executable.
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Keeps only the caller-selectable bits of raw entry flags.
    pub const fn from_entry(flags: PageTableFlags) -> Self {
        Self(PageTableFlags::from_bits_truncate(
            flags.bits() & Self::MAPPING_MASK,
        ))
    }

    const fn with(self, flag: PageTableFlags) -> Self {
        Self(PageTableFlags::from_bits_truncate(
            self.0.bits() | flag.bits(),
        ))
    }

    /// Allows writes through the mapping.
    pub const fn writable(self) -> Self {
        self.with(PageTableFlags::WRITABLE)
    }

    /// Makes the mapping reachable from user mode.
    pub const fn user(self) -> Self {
        self.with(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Forbids instruction fetches.
    pub const fn no_execute(self) -> Self {
        self.with(PageTableFlags::NO_EXECUTE)
    }

    pub const fn write_through(self) -> Self {
        self.with(PageTableFlags::WRITE_THROUGH)
    }

    pub const fn uncached(self) -> Self {
        self.with(PageTableFlags::NO_CACHE)
    }

    /// Keeps the translation across CR3 reloads. Only meaningful for kernel mappings.
    pub const fn global(self) -> Self {
        self.with(PageTableFlags::GLOBAL)
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn is_no_execute(self) -> bool {
        self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn is_global(self) -> bool {
        self.0.contains(PageTableFlags::GLOBAL)
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    /// Sets or clears the user bit.
    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Sets or clears the no-execute bit.
    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, no_execute);
    }

    /// The protection bits used to group ranges in layout dumps.
    pub(crate) fn protection(self) -> Self {
        Self(self.0.intersection(
            PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE,
        ))
    }

    /// Returns the underlying entry bits.
    pub const fn as_table_flags(self) -> PageTableFlags {
        self.0
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for PageFlags {
    /// Renders the protection as `uwx`, with `-` for absent rights.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let user = if self.is_user() { 'u' } else { '-' };
        let write = if self.is_writable() { 'w' } else { '-' };
        let exec = if self.is_no_execute() { '-' } else { 'x' };
        write!(f, "{user}{write}{exec}")
    }
}

/// Size of the region a single leaf entry maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    /// Returns the size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4KiB => 4 << 10,
            Self::Size2MiB => 2 << 20,
            Self::Size1GiB => 1 << 30,
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HumanSize(self.bytes()))
    }
}
