//! Policy-driven nested-loop execution.
//!
//! A kernel launch combines three things:
//!
//! - an [`IndexSpace`]: one half-open [`Segment`] per loop dimension,
//! - a [`Policy`] tree describing loop order, tiling, collapsing, parallel
//!   resource mapping and staging-memory scopes,
//! - a [`Kernel`]: the ordered list of bodies the policy refers to by position,
//!   plus any [`Reducer`]s the bodies contribute to.
//!
//! [`execute`] validates the policy against the space and the chosen
//! [`Backend`], lowers barriers into phase-split loop nests, and then runs the
//! bodies. Every configuration problem is reported before the first body runs.
//!
//! # Primary API
//!
//! - [`IndexSpace`], [`Segment`]: the iteration domain
//! - [`Policy`], [`Resource`]: the declarative loop nest
//! - [`tile_count`], [`tile_bounds`], [`tiles`]: the tile partitioner
//! - [`StagingTile`]: fixed-shape memory shared by one tile's participants
//! - [`Reducer`], [`ReduceSum`], [`Combine`]: cross-participant accumulation
//! - [`Sequential`], [`Threaded`], [`Device`]: interchangeable backends
//! - [`execute`], [`Plan`]: the executor
//!
//! # Example
//!
//! ```rust
//! use loopnest::{execute, IndexSpace, Kernel, Policy, ReduceSum, Sequential};
//!
//! let space = IndexSpace::new([(0, 4), (0, 3)]).unwrap();
//! let policy = Policy::seq(1, [Policy::seq(0, [Policy::body(0)])]);
//!
//! let count = ReduceSum::<i64>::new(0);
//! let kernel = Kernel::<f64>::new()
//!     .attach(&count)
//!     .body(|_ctx| {
//!         count.contribute(1);
//!         Ok(())
//!     });
//!
//! execute(&policy, &space, &Sequential, &kernel).unwrap();
//! assert_eq!(count.get().unwrap(), 12);
//! ```
//!
//! # Staging memory
//!
//! A [`Policy::staging`] scope acquires one zero-initialized [`StagingTile`]
//! per activation and hands it to every body below it. Loop nests that are
//! siblings under the scope run as separate passes, so everything written by
//! the first nest is visible to the second. A [`Policy::Barrier`] placed
//! inside a loop nest splits that nest into phases in the same way.

mod backend;
mod exec;
mod index;
mod maybe_sync;
mod plan;
mod policy;
mod reduce;
mod scalar;
mod staging;
mod threading;
mod tile;

// ============================================================================
// Iteration space and tiling
// ============================================================================
pub use index::{IndexSpace, Segment};
pub use tile::{tile_bounds, tile_count, tiles, Tiles};

// ============================================================================
// Policy tree
// ============================================================================
pub use policy::{Policy, Resource};

// ============================================================================
// Staging memory
// ============================================================================
pub use scalar::StageScalar;
pub use staging::{StagingTile, TileCell};

// ============================================================================
// Reductions
// ============================================================================
pub use reduce::{
    Accumulate, Combine, Max, Min, Product, ReduceMax, ReduceMin, ReduceSum, Reducer, Sum,
};

// ============================================================================
// Backends and execution
// ============================================================================
pub use backend::{Backend, Device, Sequential, Threaded};
pub use exec::{execute, Context, Kernel};
pub use maybe_sync::{BodyFn, MaybeSync, UnitFn};
pub use plan::Plan;

// ============================================================================
// Constants
// ============================================================================

/// Lane width used by vector-lane dispatch when the backend does not set one.
pub const DEFAULT_LANE_WIDTH: usize = 8;

/// Threads per simulated device block.
pub const DEFAULT_BLOCK_THREADS: usize = 256;

/// Slices of this length or shorter are never split further across workers.
pub const MIN_SPLIT_LENGTH: usize = 1;

// ============================================================================
// Error types
// ============================================================================

/// Malformed policy or launch configuration.
///
/// Always reported before any body runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A range with `lo > hi`, or one spanning more than `i64::MAX` points.
    #[error("invalid range [{lo}, {hi}) for dim {dim}")]
    InvalidRange { dim: usize, lo: i64, hi: i64 },

    /// A standalone segment with `lo > hi` or an extent that overflows `i64`.
    #[error("invalid segment [{lo}, {hi})")]
    InvalidSegment { lo: i64, hi: i64 },

    /// A sub-range that does not lie inside its parent range.
    #[error("sub-range [{lo}, {hi}) is outside dim {dim}")]
    SubRangeOutside { dim: usize, lo: i64, hi: i64 },

    /// A policy node names a dimension the index space does not have.
    #[error("dim {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    /// A dimension is bound twice along one path, or listed twice in a collapse.
    #[error("dim {dim} is already bound by an enclosing loop")]
    DuplicateBinding { dim: usize },

    /// Tile size was zero or negative.
    #[error("tile size must be positive, got {0}")]
    NonPositiveTileSize(i64),

    /// A collapse with no dimensions.
    #[error("collapse lists no dimensions")]
    EmptyCollapse,

    /// A collapse nested inside another collapse.
    #[error("collapse over {dims:?} is nested inside another collapse")]
    NestedCollapse { dims: Vec<usize> },

    /// The collapsed extent product does not fit in `i64`.
    #[error("collapse over {dims:?} has more than i64::MAX points")]
    CollapseOverflow { dims: Vec<usize> },

    /// A staging scope with an empty shape or a zero extent.
    #[error("invalid staging shape {0:?}")]
    InvalidShape(Vec<usize>),

    /// A block-level loop inside a staging scope would share the tile across blocks.
    #[error("staging memory cannot be shared across blocks (dim {dim})")]
    CrossBlockStaging { dim: usize },

    /// A barrier with no staging scope to synchronize.
    #[error("barrier outside of a staging scope")]
    BarrierOutsideStaging,

    /// A barrier in a nested staging scope that sits under a parallel loop
    /// (dim `dim`) which an outer staging scope encloses: the outer tile is
    /// shared by every participant of that loop and the barrier cannot join them.
    #[error("barrier cannot synchronize an outer staging tile shared across parallel dim {dim}")]
    BarrierAcrossParallel { dim: usize },

    /// A body node refers past the end of the kernel's body list.
    #[error("body {index} requested but only {count} supplied")]
    UnknownBody { index: usize, count: usize },

    /// The backend cannot realize the requested resource kind.
    #[error("backend `{backend}` does not support {resource:?}")]
    UnsupportedResource {
        backend: &'static str,
        resource: Resource,
    },

    /// An accumulator was attached to two overlapping launches.
    #[error("accumulator is already attached to a running launch")]
    AccumulatorInUse,

    /// A worker pool could not be built.
    #[error("thread pool: {0}")]
    ThreadPool(String),
}

/// Out-of-bounds access detected while a kernel runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// A body asked for a coordinate of a dimension the space does not have.
    #[error("coordinate {dim} requested from rank-{rank} index space")]
    Coordinate { dim: usize, rank: usize },

    /// Local staging coordinates outside the tile shape.
    #[error("staging index {index:?} out of bounds for shape {shape:?}")]
    Staging { index: Vec<i64>, shape: Vec<usize> },

    /// A body asked for a staging tile that is not in scope.
    #[error("staging tile {index} requested but {in_scope} in scope")]
    TileNotInScope { index: usize, in_scope: usize },

    /// A tile index past the last tile.
    #[error("tile {index} out of range for {count} tiles")]
    Tile { index: i64, count: i64 },
}

/// Errors that can occur while building or executing a kernel launch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("access error: {0}")]
    Access(#[from] AccessError),

    /// An accumulator was read while its launch was still running.
    #[error("accumulator read before its launch completed")]
    PrematureRead,
}

/// Result type for loop-nest operations.
pub type Result<T> = std::result::Result<T, LoopError>;
