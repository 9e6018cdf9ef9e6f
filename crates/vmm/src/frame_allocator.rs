//! The source of physical frames.

use crate::PhysicalAddress;

/// Errors that can occur when allocating frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No frame is available.
    OutOfMemory,
}

/// Hands out and takes back 4 KiB physical frames.
///
/// Implementations must be safe to call from several CPUs at once. Frames returned by
/// `alloc_frame` need not be zeroed.
pub trait FrameAllocator: Sync {
    fn alloc_frame(&self) -> Result<PhysicalAddress, AllocError>;

    /// Returns `frame` to the allocator. The frame must have come from `alloc_frame`.
    fn free_frame(&self, frame: PhysicalAddress);
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedFrames;

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use alloc::vec::Vec;

    use super::{AllocError, FrameAllocator};
    use crate::arch::PAGE_SIZE;
    use crate::{AddressTranslator, PhysicalAddress};

    /// A frame allocator over a block carved from emulated physical memory.
    ///
    /// Tracks outstanding frames and detects double frees, and can be told to fail after a
    /// number of allocations so exhaustion paths can be exercised.
    pub struct EmulatedFrames {
        inner: spin::Mutex<Pool>,
    }

    struct Pool {
        base: usize,
        next: usize,
        end: usize,
        free: Vec<PhysicalAddress>,
        outstanding: usize,
        budget: Option<usize>,
    }

    impl EmulatedFrames {
        /// Carves `count` frames from the current emulated memory.
        ///
        /// # Panics
        ///
        /// Panics if the emulated memory cannot hold `count` more frames.
        pub fn new(count: usize) -> Self {
            let Some(base) = AddressTranslator::current().allocate(count * PAGE_SIZE, PAGE_SIZE)
            else {
                panic!("emulated memory cannot hold {count} frames");
            };
            Self {
                inner: spin::Mutex::new(Pool {
                    base: base.as_usize(),
                    next: base.as_usize(),
                    end: base.as_usize() + count * PAGE_SIZE,
                    free: Vec::new(),
                    outstanding: 0,
                    budget: None,
                }),
            }
        }

        /// Number of frames handed out and not yet returned.
        pub fn outstanding(&self) -> usize {
            self.inner.lock().outstanding
        }

        /// Limits how many more frames may be allocated. `None` lifts the limit.
        pub fn set_budget(&self, frames: Option<usize>) {
            self.inner.lock().budget = frames;
        }
    }

    impl FrameAllocator for EmulatedFrames {
        fn alloc_frame(&self) -> Result<PhysicalAddress, AllocError> {
            let mut pool = self.inner.lock();
            if pool.budget == Some(0) {
                return Err(AllocError::OutOfMemory);
            }

            let frame = match pool.free.pop() {
                Some(frame) => frame,
                None if pool.next < pool.end => {
                    let frame = PhysicalAddress::new(pool.next);
                    pool.next += PAGE_SIZE;
                    frame
                }
                None => return Err(AllocError::OutOfMemory),
            };

            if let Some(budget) = pool.budget.as_mut() {
                *budget -= 1;
            }
            pool.outstanding += 1;
            Ok(frame)
        }

        fn free_frame(&self, frame: PhysicalAddress) {
            let mut pool = self.inner.lock();
            assert!(frame.is_aligned(PAGE_SIZE), "freeing unaligned frame {frame}");
            assert!(
                (pool.base..pool.next).contains(&frame.as_usize()),
                "freeing frame {frame} that was never allocated"
            );
            assert!(!pool.free.contains(&frame), "frame {frame} freed twice");
            pool.free.push(frame);
            pool.outstanding -= 1;
        }
    }

}
