//! Injected collaborators of the channel core.
//!
//! A [`Runtime`] bundles the three services channels and selects consume: a [`TaskScheduler`]
//! to park and resume tasks, a [`MemoryMover`] to copy element bytes, and an [`Instrument`] that
//! observes synchronization for race detection. Channels used together in one select should
//! share a scheduler.

use crate::sched::{TaskScheduler, ThreadScheduler};
use std::{
    fmt::{self, Debug, Formatter},
    ptr,
    sync::{Arc, OnceLock},
};


/// Typed copy of element values between user memory and channel storage
pub trait MemoryMover: Send + Sync {
    /// Copy `len` bytes from `src` to `dst`
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads and `dst` valid for writes of `len` bytes, and the two
    /// regions must not overlap.
    unsafe fn typed_copy(&self, dst: *mut u8, src: *const u8, len: usize);

    /// Overwrite `len` bytes at `dst` with the zero representation
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `len` bytes.
    unsafe fn typed_clear(&self, dst: *mut u8, len: usize) {
        if len != 0 {
            ptr::write_bytes(dst, 0, len);
        }
    }
}

/// [`MemoryMover`] for element types with no write-barrier requirements
#[derive(Debug, Default, Copy, Clone)]
pub struct TypedCopy;

impl MemoryMover for TypedCopy {
    unsafe fn typed_copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        if len != 0 {
            ptr::copy_nonoverlapping(src, dst, len);
        }
    }
}


/// Race-detector hooks
///
/// Called at the same program points as the real copies and lock handoffs. Purely diagnostic:
/// implementations must not affect control flow. All methods default to no-ops.
pub trait Instrument: Send + Sync {
    /// The caller acquires the synchronization object at `addr`
    fn acquire(&self, _addr: usize) {}

    /// The caller releases the synchronization object at `addr`
    fn release(&self, _addr: usize) {}

    /// The caller reads `len` bytes at `addr`
    fn read(&self, _addr: usize, _len: usize) {}

    /// The caller writes `len` bytes at `addr`
    fn write(&self, _addr: usize, _len: usize) {}
}

/// Instrumentation that does nothing
#[derive(Debug, Default, Copy, Clone)]
pub struct NoInstrument;

impl Instrument for NoInstrument {}

/// Instrumentation that reports every hook as a `tracing` trace event
#[derive(Debug, Default, Copy, Clone)]
pub struct TraceInstrument;

impl Instrument for TraceInstrument {
    fn acquire(&self, addr: usize) {
        trace!(addr, "race acquire");
    }

    fn release(&self, addr: usize) {
        trace!(addr, "race release");
    }

    fn read(&self, addr: usize, len: usize) {
        trace!(addr, len, "race read");
    }

    fn write(&self, addr: usize, len: usize) {
        trace!(addr, len, "race write");
    }
}


/// Bundle of the services a channel or select is constructed with
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn TaskScheduler>,
    mover: Arc<dyn MemoryMover>,
    instrument: Arc<dyn Instrument>,
}

impl Runtime {
    /// The process-wide default runtime
    ///
    /// Uses [`ThreadScheduler`] and [`TypedCopy`]. Instrumentation is [`NoInstrument`], or
    /// [`TraceInstrument`] if the `trace-instrument` feature is enabled.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| RuntimeBuilder::new().build())
    }

    /// Start building a custom runtime, with every service defaulting to the global choice
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The task scheduler
    pub fn scheduler(&self) -> &dyn TaskScheduler {
        &*self.scheduler
    }

    /// The memory mover
    pub fn mover(&self) -> &dyn MemoryMover {
        &*self.mover
    }

    /// The instrumentation hooks
    pub fn instrument(&self) -> &dyn Instrument {
        &*self.instrument
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::global().clone()
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}


/// Builder for [`Runtime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    scheduler: Option<Arc<dyn TaskScheduler>>,
    mover: Option<Arc<dyn MemoryMover>>,
    instrument: Option<Arc<dyn Instrument>>,
}

impl RuntimeBuilder {
    /// Construct with no services overridden
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the task scheduler
    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Override the memory mover
    pub fn mover(mut self, mover: Arc<dyn MemoryMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    /// Override the instrumentation hooks
    pub fn instrument(mut self, instrument: Arc<dyn Instrument>) -> Self {
        self.instrument = Some(instrument);
        self
    }

    /// Finish building
    pub fn build(self) -> Runtime {
        Runtime {
            scheduler: self.scheduler.unwrap_or_else(|| Arc::new(ThreadScheduler)),
            mover: self.mover.unwrap_or_else(|| Arc::new(TypedCopy)),
            instrument: self.instrument.unwrap_or_else(default_instrument),
        }
    }
}

fn default_instrument() -> Arc<dyn Instrument> {
    if cfg!(feature = "trace-instrument") {
        Arc::new(TraceInstrument)
    } else {
        Arc::new(NoInstrument)
    }
}
