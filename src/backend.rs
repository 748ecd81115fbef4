//! Execution backends.
//!
//! A [`Backend`] is the strategy object the executor hands every parallel
//! loop to. It decides how the units of one [`Resource`] kind are spread over
//! hardware; the executor only relies on the fork-join contract: `for_each`
//! returns after every unit has finished.
//!
//! Three backends are provided:
//!
//! - [`Sequential`]: every resource kind runs in ascending order on the caller
//! - [`Threaded`]: CPU workers via rayon, vector lanes in chunks
//! - [`Device`]: a host simulation of block/thread device execution

use std::sync::atomic::AtomicBool;
#[cfg(feature = "parallel")]
use std::sync::Arc;

use crate::index::Segment;
use crate::maybe_sync::{MaybeSync, UnitFn};
use crate::policy::Resource;
use crate::threading::{for_each_lane, run_serial, split_range};
#[cfg(feature = "parallel")]
use crate::ConfigError;
use crate::{Result, DEFAULT_BLOCK_THREADS, DEFAULT_LANE_WIDTH};

/// Strategy for running the units of one parallel loop.
///
/// Implementations must call `f` exactly once for every index of `range`
/// (unless `f` fails) and must not return before all calls have finished.
pub trait Backend: MaybeSync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether `resource` can be realized. Checked before a launch starts.
    fn supports(&self, _resource: Resource) -> bool {
        true
    }

    /// Run `f` for every index of `range` on units of kind `resource`.
    fn for_each(&self, resource: Resource, range: Segment, f: &UnitFn<'_>) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn supports(&self, resource: Resource) -> bool {
        (**self).supports(resource)
    }

    fn for_each(&self, resource: Resource, range: Segment, f: &UnitFn<'_>) -> Result<()> {
        (**self).for_each(resource, range, f)
    }
}

// ---------------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------------

/// Runs every resource kind in ascending index order on the calling thread.
///
/// Barriers degenerate to sequencing points: program order already places
/// every write of one phase before any read of the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl Backend for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn for_each(&self, _resource: Resource, range: Segment, f: &UnitFn<'_>) -> Result<()> {
        run_serial(range, &AtomicBool::new(false), f)
    }
}

// ---------------------------------------------------------------------------
// Threaded
// ---------------------------------------------------------------------------

/// Loop-parallel CPU backend.
///
/// `CpuWorker`, `GpuThread` and `GpuBlock` loops are split over at most
/// `threads()` rayon workers, either on the global pool or on a dedicated one.
/// `VectorLane` loops run in lane chunks on the worker that reaches them.
/// Without the `parallel` feature everything runs on the caller.
#[derive(Debug, Clone)]
pub struct Threaded {
    #[cfg(feature = "parallel")]
    pool: Option<Arc<rayon::ThreadPool>>,
    nthreads: usize,
    grain: usize,
    lane_width: usize,
}

impl Default for Threaded {
    fn default() -> Self {
        Self::new()
    }
}

impl Threaded {
    /// Use the global rayon pool.
    pub fn new() -> Self {
        #[cfg(feature = "parallel")]
        let nthreads = rayon::current_num_threads();
        #[cfg(not(feature = "parallel"))]
        let nthreads = 1;

        Self {
            #[cfg(feature = "parallel")]
            pool: None,
            nthreads,
            grain: crate::MIN_SPLIT_LENGTH,
            lane_width: DEFAULT_LANE_WIDTH,
        }
    }

    /// Use a dedicated pool of `threads` workers.
    ///
    /// # Errors
    /// [`ConfigError::ThreadPool`] if the pool cannot be built.
    #[cfg(feature = "parallel")]
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;
        let nthreads = pool.current_num_threads();
        Ok(Self {
            pool: Some(Arc::new(pool)),
            nthreads,
            grain: crate::MIN_SPLIT_LENGTH,
            lane_width: DEFAULT_LANE_WIDTH,
        })
    }

    /// Without `parallel` there is no pool; the request is accepted and
    /// everything runs on the caller.
    #[cfg(not(feature = "parallel"))]
    pub fn with_threads(_threads: usize) -> Result<Self> {
        Ok(Self::new())
    }

    /// Slices of at most `grain` indices are not split further.
    pub fn grain(mut self, grain: usize) -> Self {
        self.grain = grain.max(1);
        self
    }

    pub fn lane_width(mut self, width: usize) -> Self {
        self.lane_width = width.max(1);
        self
    }

    /// Worker budget for one parallel loop.
    pub fn threads(&self) -> usize {
        self.nthreads
    }

    fn split(&self, range: Segment, f: &UnitFn<'_>) -> Result<()> {
        let abort = AtomicBool::new(false);
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            return pool.install(|| split_range(range, self.nthreads, self.grain, &abort, f));
        }
        split_range(range, self.nthreads, self.grain, &abort, f)
    }
}

impl Backend for Threaded {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn for_each(&self, resource: Resource, range: Segment, f: &UnitFn<'_>) -> Result<()> {
        match resource {
            Resource::VectorLane => for_each_lane(range, self.lane_width, f),
            Resource::CpuWorker | Resource::GpuThread | Resource::GpuBlock => self.split(range, f),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Host simulation of a block/thread device.
///
/// Blocks are independent and are distributed over host workers. The threads
/// of one block are issued in lockstep order on that block's worker, in chunks
/// of `block_threads`, so a block-wide barrier is the join at the end of the
/// thread loop. `CpuWorker` loops have no device counterpart and are rejected
/// before launch.
#[derive(Debug, Clone)]
pub struct Device {
    block_threads: usize,
    lane_width: usize,
    nthreads: usize,
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_THREADS)
    }
}

impl Device {
    pub fn new(block_threads: usize) -> Self {
        #[cfg(feature = "parallel")]
        let nthreads = rayon::current_num_threads();
        #[cfg(not(feature = "parallel"))]
        let nthreads = 1;

        Self {
            block_threads: block_threads.max(1),
            lane_width: DEFAULT_LANE_WIDTH,
            nthreads,
        }
    }

    pub fn block_threads(&self) -> usize {
        self.block_threads
    }
}

impl Backend for Device {
    fn name(&self) -> &'static str {
        "device"
    }

    fn supports(&self, resource: Resource) -> bool {
        !matches!(resource, Resource::CpuWorker)
    }

    fn for_each(&self, resource: Resource, range: Segment, f: &UnitFn<'_>) -> Result<()> {
        match resource {
            Resource::GpuBlock => {
                split_range(range, self.nthreads, 1, &AtomicBool::new(false), f)
            }
            // block-stride loop: each pass covers one block's worth of threads
            Resource::GpuThread => for_each_lane(range, self.block_threads, f),
            Resource::VectorLane => for_each_lane(range, self.lane_width, f),
            Resource::CpuWorker => run_serial(range, &AtomicBool::new(false), f),
        }
    }
}
