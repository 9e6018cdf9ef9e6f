//! Page and frame number types.
//!
//! Page numbers count 4 KiB pages in the stripped (48-bit) virtual address space, so the
//! kernel half continues where the user half ends with no gap. Converting back through
//! [`PageNumber::start`] restores the canonical form.

use core::fmt;
use core::ops::{Add, Sub};

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch;

/// Generates the parts shared by [`FrameNumber`] and [`PageNumber`].
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Counts pages from the bottom of the stripped address space; the first kernel page\n\
     directly follows the last user page."
);

impl PageNumber {
    /// Returns the page containing `addr`.
    #[inline]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.strip() / arch::PAGE_SIZE)
    }

    /// Returns the canonical virtual address at the start of this page.
    ///
    /// # Panics
    ///
    /// Panics if the page number lies beyond the 48-bit address space.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::from_stripped(self.0 * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::containing(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod frame_number {
        use super::*;

        #[test]
        fn start_address() {
            let frame = FrameNumber::new(1);
            assert_eq!(frame.start().as_usize(), arch::PAGE_SIZE);
        }

        #[test]
        fn from_physical_address() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 10);
            assert_eq!(FrameNumber::from(addr).as_usize(), 3);
        }

        #[test]
        fn arithmetic() {
            let frame = FrameNumber::new(10);
            assert_eq!((frame + 5).as_usize(), 15);
            assert_eq!(FrameNumber::new(10) - FrameNumber::new(3), 7);
        }
    }

    mod page_number {
        use super::*;

        #[test]
        fn user_page_round_trip() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE * 5);
            let page = PageNumber::containing(addr);
            assert_eq!(page.as_usize(), 5);
            assert_eq!(page.start(), addr);
        }

        #[test]
        fn kernel_page_is_canonical() {
            let addr = VirtualAddress::new(0xFFFF_8000_0000_3000);
            let page = PageNumber::containing(addr);
            assert_eq!(page.as_usize(), (0x0000_8000_0000_3000) / arch::PAGE_SIZE);
            assert_eq!(page.start(), addr);
        }

        #[test]
        fn last_user_page_is_followed_by_first_kernel_page() {
            let last_user = PageNumber::containing(VirtualAddress::new(0x0000_7FFF_FFFF_F000));
            assert_eq!(
                (last_user + 1).start(),
                VirtualAddress::new(0xFFFF_8000_0000_0000)
            );
        }

        #[test]
        fn ignores_page_offset() {
            let page = PageNumber::from(VirtualAddress::new(arch::PAGE_SIZE * 3 + 10));
            assert_eq!(page.as_usize(), 3);
        }
    }
}
