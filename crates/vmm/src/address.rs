//! Address types for physical and virtual memory, and the translator that turns physical
//! addresses into pointers the kernel can dereference.
//!
//! Virtual addresses are always stored in canonical form. Index computations work on the
//! *stripped* form, where bits 48-63 are cleared; [`VirtualAddress::from_stripped`]
//! restores the sign extension afterwards.

use core::fmt;
use core::ops::{Add, Sub};

use crate::table::Level;
use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Mask selecting the implemented bits of a virtual address (4-level paging).
const STRIP_MASK: usize = (1 << arch::MAX_VIRTUAL_BITS) - 1;

/// The bit that is sign-extended through the unimplemented high bits.
const SIGN_BIT: usize = 1 << (arch::MAX_VIRTUAL_BITS - 1);

/// Translates physical addresses into pointers.
///
/// This is the only place where a physical address becomes dereferenceable:
/// - Hardware: physical memory is reachable through the kernel's direct map.
/// - Emulated: physical memory is a host buffer (tests and host tooling).
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `size` bytes of zeroed host memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// In emulated builds the translator is per-thread, so every test gets its own
    /// physical memory. Use [`AddressTranslator::install`] to share one with other threads.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|current| {
                if current.get().is_some() {
                    panic!("address translator already set");
                }
                let leaked: &'static AddressTranslator =
                    alloc::boxed::Box::leak(alloc::boxed::Box::new(translator));
                current.set(Some(leaked));
            });
        }
    }

    /// Makes an existing translator current on the calling thread.
    ///
    /// Lets several threads operate on the same emulated physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn install(translator: &'static AddressTranslator) {
        ADDRESS_TRANSLATOR.with(|current| current.set(Some(translator)));
    }

    /// Returns the current address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!(
                "address translator not set; call AddressTranslator::set_current during initialization"
            ),
        }
    }

    /// Returns the current address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|current| current.get())
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize(), core::mem::size_of::<T>()) as *mut T,
        }
    }

    /// Carves a block out of the emulated physical memory.
    ///
    /// Returns the physical address of the block, or None if there's not enough space.
    ///
    /// # Panics
    ///
    /// Panics when called on a hardware translator.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        match self {
            Self::Hardware { .. } => panic!("cannot allocate from hardware translator"),
            Self::Emulated(mem) => mem.allocate(size, align).map(PhysicalAddress::new),
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: core::cell::Cell<Option<&'static AddressTranslator>> =
        const { core::cell::Cell::new(None) };
}

/// Generates the parts shared by [`PhysicalAddress`] and [`VirtualAddress`].
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a `u64`.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Adds `offset`, returning None if the result is not a valid address.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(raw) => Self::try_new(raw),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address, at most `MAX_PHYSICAL_BITS` wide."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr >> arch::MAX_PHYSICAL_BITS == 0,
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Creates a new physical address, or None if it exceeds the maximum width.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if addr >> arch::MAX_PHYSICAL_BITS == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A canonical 64-bit virtual address.\n\n\
     Bits 48-63 always replicate bit 47. The lower half (bit 47 clear) is user space,\n\
     the upper half is the kernel region shared by every address space."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(Self::is_canonical(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a new virtual address, or None if it is not canonical.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if Self::is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Restores the sign extension of a stripped (48-bit) address.
    ///
    /// # Panics
    ///
    /// Panics if `stripped` has bits above bit 47 set.
    #[inline]
    pub const fn from_stripped(stripped: usize) -> Self {
        assert!(stripped & !STRIP_MASK == 0, "stripped address out of range");
        if stripped & SIGN_BIT != 0 {
            Self(stripped | !STRIP_MASK)
        } else {
            Self(stripped)
        }
    }

    /// Returns the address with the sign extension removed.
    #[inline]
    pub const fn strip(self) -> usize {
        self.0 & STRIP_MASK
    }

    /// Returns true if the address lies in the kernel (upper) half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 & SIGN_BIT != 0
    }

    /// Returns the offset within the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the index into the table at `level` that governs this address.
    #[inline]
    pub const fn table_index(self, level: Level) -> usize {
        level.index_of(self.strip())
    }

    /// Returns the page containing this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::containing(self)
    }

    const fn is_canonical(addr: usize) -> bool {
        let high = addr & !STRIP_MASK;
        if addr & SIGN_BIT != 0 {
            high == !STRIP_MASK
        } else {
            high == 0
        }
    }
}
