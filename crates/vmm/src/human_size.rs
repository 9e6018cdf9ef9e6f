//! Human-readable sizes for mapping diagnostics.

use core::fmt;

/// Formats a byte count with binary prefixes (KiB, MiB, ...).
///
/// Exact multiples print without a fraction. Anything else gets a single truncated decimal,
/// using integer arithmetic only so the type is usable without floating point.
///
/// ```
/// use vmm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(3 << 20)), "3MiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let bytes = self.0 as u128;
        let mut unit = 0;
        while unit + 1 < UNITS.len() && bytes >= 1u128 << (10 * (unit + 1)) {
            unit += 1;
        }

        let scale = 1u128 << (10 * unit);
        let whole = bytes / scale;
        let tenths = (bytes % scale) * 10 / scale;
        if tenths == 0 {
            write!(f, "{whole}{}", UNITS[unit])
        } else {
            write!(f, "{whole}.{tenths}{}", UNITS[unit])
        }
    }
}
