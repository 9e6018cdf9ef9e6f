//! Fixtures shared by the in-crate tests.

use std::cell::RefCell;

use crate::arch::PAGE_SIZE;
use crate::{
    AddressTranslator, CpuSet, EmulatedFrames, FrameAllocator, Invalidation, PhysicalAddress,
    Shootdown,
};

/// Emulated physical memory given to each test thread.
pub const EMULATED_MEMORY: usize = 32 << 20;

/// Installs emulated memory on the calling thread, once.
pub fn setup() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_MEMORY));
    }
}

/// A fresh frame allocator holding `count` frames.
pub fn frames(count: usize) -> EmulatedFrames {
    setup();
    EmulatedFrames::new(count)
}

/// Allocates `count` frames from a pool that has not recycled any, so they are adjacent.
pub fn contiguous(frames: &EmulatedFrames, count: usize) -> PhysicalAddress {
    let base = frames.alloc_frame().unwrap();
    for page in 1..count {
        assert_eq!(frames.alloc_frame(), Ok(base + page * PAGE_SIZE));
    }
    base
}

std::thread_local! {
    static CAPTURED: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Sends log records to a buffer owned by the thread that emitted them.
struct ThreadLogger;

impl log::Log for ThreadLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        CAPTURED.with(|captured| {
            captured
                .borrow_mut()
                .push((record.level(), record.args().to_string()));
        });
    }

    fn flush(&self) {}
}

static LOGGER: ThreadLogger = ThreadLogger;
static INSTALL_LOGGER: std::sync::Once = std::sync::Once::new();

/// Starts capturing this thread's log records, dropping any captured before.
pub fn capture_logs() {
    INSTALL_LOGGER.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
    CAPTURED.with(|captured| captured.borrow_mut().clear());
}

/// Drains the log records captured on this thread.
pub fn captured_logs() -> Vec<(log::Level, String)> {
    CAPTURED.with(|captured| core::mem::take(&mut *captured.borrow_mut()))
}

/// A shootdown that records every broadcast instead of interrupting anyone.
pub struct RecordingShootdown {
    cpu: usize,
    online: CpuSet,
    sent: spin::Mutex<Vec<(CpuSet, Invalidation)>>,
}

impl RecordingShootdown {
    pub fn new(cpu: usize, online: CpuSet) -> Self {
        Self {
            cpu,
            online,
            sent: spin::Mutex::new(Vec::new()),
        }
    }

    /// Drains the broadcasts recorded so far.
    pub fn sent(&self) -> Vec<(CpuSet, Invalidation)> {
        core::mem::take(&mut *self.sent.lock())
    }
}

impl Shootdown for RecordingShootdown {
    fn current_cpu(&self) -> usize {
        self.cpu
    }

    fn online_cpus(&self) -> CpuSet {
        self.online
    }

    fn broadcast(&self, targets: CpuSet, invalidation: Invalidation) {
        self.sent.lock().push((targets, invalidation));
    }
}
