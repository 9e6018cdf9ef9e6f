//! Errors reported by mapping and lifecycle operations.

use core::fmt;

use crate::AllocError;

/// `ENOMEM`: a frame or table node could not be allocated.
pub const ENOMEM: i32 = 12;
/// `EINVAL`: the caller passed an argument the operation cannot accept.
pub const EINVAL: i32 = 22;
/// `ENOSYS`: the operation exists but this case is not implemented.
pub const ENOSYS: i32 = 38;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A frame or page-table node could not be allocated.
    OutOfMemory,
    /// The request itself is wrong.
    InvalidArgument(InvalidArgument),
    /// The request is well-formed but needs a feature this core lacks.
    Unsupported(Unsupported),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidArgument {
    UnalignedAddress,
    UnalignedFrame,
    /// A range runs off the end of its half of the address space.
    NonCanonical,
    AlreadyMapped,
    NotMapped,
    /// The kernel address space cannot be destroyed.
    KernelSpaceTeardown,
    /// A kernel address was mapped before any kernel address space exists.
    NoKernelSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// Installing, removing or splitting a 2 MiB or 1 GiB mapping.
    HugePage,
    /// Copying the user half between address spaces.
    UserClone,
    /// Describing a space that contains 2 MiB mappings.
    LargePageDescription,
}

impl MapError {
    /// The negative-errno code a system-call layer should return, without the sign.
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::InvalidArgument(_) => EINVAL,
            Self::Unsupported(_) => ENOSYS,
        }
    }
}

impl From<AllocError> for MapError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnalignedAddress => "virtual address is not page-aligned",
            Self::UnalignedFrame => "physical frame is not page-aligned",
            Self::NonCanonical => "range leaves the canonical address space",
            Self::AlreadyMapped => "page is already mapped",
            Self::NotMapped => "page is not mapped",
            Self::KernelSpaceTeardown => "kernel address space cannot be destroyed",
            Self::NoKernelSpace => "no kernel address space to share",
        })
    }
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HugePage => "huge page mappings",
            Self::UserClone => "cloning user mappings",
            Self::LargePageDescription => "describing 2 MiB mappings",
        })
    }
}

impl core::error::Error for MapError {}

/// A bulk mapping that stopped part way.
///
/// The first `mapped` pages of the range are mapped and stay mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeError {
    pub mapped: usize,
    pub cause: MapError,
}

impl From<RangeError> for MapError {
    fn from(err: RangeError) -> Self {
        err.cause
    }
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after mapping {} pages", self.cause, self.mapped)
    }
}

impl core::error::Error for RangeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Reports caller misuse.
///
/// Misuse is a bug in the caller, so the `fatal-misuse` feature turns it into a panic.
pub(crate) fn misuse(kind: InvalidArgument, at: impl fmt::Display) -> MapError {
    log::error!("{kind} at {at}");
    if cfg!(feature = "fatal-misuse") {
        panic!("{kind} at {at}");
    }
    MapError::InvalidArgument(kind)
}

/// Stops the kernel on a page-table state that no operation could have produced.
#[cold]
#[track_caller]
pub(crate) fn corrupted(what: fmt::Arguments<'_>) -> ! {
    panic!("page table corruption: {what}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{capture_logs, captured_logs};

    #[test]
    fn errno_mapping() {
        assert_eq!(MapError::OutOfMemory.errno(), ENOMEM);
        assert_eq!(MapError::InvalidArgument(InvalidArgument::NotMapped).errno(), EINVAL);
        assert_eq!(MapError::Unsupported(Unsupported::UserClone).errno(), ENOSYS);
    }

    #[test]
    fn alloc_error_converts() {
        assert_eq!(MapError::from(AllocError::OutOfMemory), MapError::OutOfMemory);
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            MapError::InvalidArgument(InvalidArgument::AlreadyMapped).to_string(),
            "invalid argument: page is already mapped"
        );
        let err = RangeError {
            mapped: 3,
            cause: MapError::OutOfMemory,
        };
        assert_eq!(err.to_string(), "out of memory after mapping 3 pages");
        assert_eq!(MapError::from(err), MapError::OutOfMemory);
    }

    #[cfg(not(feature = "fatal-misuse"))]
    #[test]
    fn misuse_returns_invalid_argument() {
        capture_logs();
        assert_eq!(
            misuse(InvalidArgument::UnalignedFrame, "0x1001"),
            MapError::InvalidArgument(InvalidArgument::UnalignedFrame)
        );
        assert_eq!(
            captured_logs(),
            alloc::vec![(
                log::Level::Error,
                "physical frame is not page-aligned at 0x1001".to_string()
            )]
        );
    }

    #[cfg(feature = "fatal-misuse")]
    #[test]
    #[should_panic(expected = "page is already mapped at 0x1000")]
    fn misuse_is_fatal() {
        misuse(InvalidArgument::AlreadyMapped, "0x1000");
    }

    #[cfg(feature = "fatal-misuse")]
    #[test]
    fn fatal_misuse_is_logged_first() {
        capture_logs();
        let result = std::panic::catch_unwind(|| misuse(InvalidArgument::NotMapped, "0x2000"));
        assert!(result.is_err());
        assert_eq!(
            captured_logs(),
            alloc::vec![(log::Level::Error, "page is not mapped at 0x2000".to_string())]
        );
    }
}
