//! Policy interpreter.
//!
//! The executor walks a lowered policy tree with a [`Frame`] per participant:
//! the current coordinate of every dimension, the range each dimension may
//! still iterate (narrowed by tiles), and the staging tiles in scope. Parallel
//! loops hand a clone of the frame to every unit through the [`Backend`].

use smallvec::SmallVec;
use tracing::{instrument, trace};

use crate::backend::Backend;
use crate::index::{IndexSpace, Segment};
use crate::maybe_sync::{BodyFn, MaybeSync};
use crate::plan::Plan;
use crate::policy::{Policy, Resource};
use crate::reduce::Accumulate;
use crate::scalar::StageScalar;
use crate::staging::StagingTile;
use crate::tile::tiles;
use crate::{AccessError, ConfigError, Result};

/// What a body sees for one iteration.
pub struct Context<'a, T> {
    coords: &'a [i64],
    tiles: &'a [&'a StagingTile<T>],
}

impl<'a, T> Context<'a, T> {
    /// Absolute coordinate of `dim`.
    ///
    /// A dimension that no enclosing loop binds reads as the start of its
    /// current range: the range start of the space, or the first index of
    /// the enclosing tile.
    ///
    /// # Errors
    /// [`AccessError::Coordinate`] if `dim` is not a dimension of the space.
    #[inline]
    pub fn index(&self, dim: usize) -> Result<i64> {
        self.coords.get(dim).copied().ok_or_else(|| {
            AccessError::Coordinate {
                dim,
                rank: self.coords.len(),
            }
            .into()
        })
    }

    pub fn coords(&self) -> &[i64] {
        self.coords
    }

    pub fn rank(&self) -> usize {
        self.coords.len()
    }

    /// The `k`-th staging tile in scope, outermost first.
    ///
    /// # Errors
    /// [`AccessError::TileNotInScope`] if fewer than `k + 1` scopes enclose the body.
    pub fn tile(&self, k: usize) -> Result<&'a StagingTile<T>> {
        self.tiles.get(k).copied().ok_or_else(|| {
            AccessError::TileNotInScope {
                index: k,
                in_scope: self.tiles.len(),
            }
            .into()
        })
    }

    pub fn tiles(&self) -> &[&'a StagingTile<T>] {
        self.tiles
    }
}

impl<T> std::fmt::Debug for Context<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("coords", &self.coords)
            .field("tiles", &self.tiles.len())
            .finish()
    }
}

/// The bodies of one launch, addressed by position, plus the accumulators
/// they contribute to.
pub struct Kernel<'a, T = f64> {
    bodies: Vec<Box<BodyFn<'a, T>>>,
    reducers: Vec<&'a dyn Accumulate>,
}

impl<T> Default for Kernel<'_, T> {
    fn default() -> Self {
        Self {
            bodies: Vec::new(),
            reducers: Vec::new(),
        }
    }
}

impl<'a, T> Kernel<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a body. Its index is the number of bodies added before it.
    pub fn body<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_, T>) -> Result<()> + MaybeSync + 'a,
    {
        self.bodies.push(Box::new(f));
        self
    }

    /// Attach an accumulator. It is opened for the duration of every launch
    /// of this kernel, so reading it from a body fails.
    pub fn attach(mut self, acc: &'a dyn Accumulate) -> Self {
        self.reducers.push(acc);
        self
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub(crate) fn bodies(&self) -> &[Box<BodyFn<'a, T>>] {
        &self.bodies
    }

    pub(crate) fn reducers(&self) -> &[&'a dyn Accumulate] {
        &self.reducers
    }
}

impl<T> std::fmt::Debug for Kernel<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("bodies", &self.bodies.len())
            .field("reducers", &self.reducers.len())
            .finish()
    }
}

/// Per-participant interpreter state.
struct Frame<'t, T> {
    coords: SmallVec<[i64; 6]>,
    ranges: SmallVec<[Segment; 6]>,
    tiles: SmallVec<[&'t StagingTile<T>; 4]>,
}

impl<T> Clone for Frame<'_, T> {
    fn clone(&self) -> Self {
        Self {
            coords: self.coords.clone(),
            ranges: self.ranges.clone(),
            tiles: self.tiles.clone(),
        }
    }
}

pub(crate) struct Executor<'e, 'a, B: ?Sized, T> {
    backend: &'e B,
    bodies: &'e [Box<BodyFn<'a, T>>],
}

impl<'e, 'a, B: Backend + ?Sized, T: StageScalar> Executor<'e, 'a, B, T> {
    pub(crate) fn new(backend: &'e B, bodies: &'e [Box<BodyFn<'a, T>>]) -> Self {
        Self { backend, bodies }
    }

    pub(crate) fn run(&self, nodes: &[Policy], space: &IndexSpace) -> Result<()> {
        let frame = Frame {
            coords: space.origin(),
            ranges: SmallVec::from_slice(space.segments()),
            tiles: SmallVec::new(),
        };
        self.run_list(nodes, &frame)
    }

    fn run_list(&self, nodes: &[Policy], frame: &Frame<'_, T>) -> Result<()> {
        nodes.iter().try_for_each(|n| self.run_node(n, frame))
    }

    fn run_node(&self, node: &Policy, frame: &Frame<'_, T>) -> Result<()> {
        match node {
            Policy::Seq { dim, children } => {
                let mut f = frame.clone();
                let range = frame.ranges[*dim];
                for i in range.lo..range.hi {
                    f.coords[*dim] = i;
                    self.run_list(children, &f)?;
                }
                Ok(())
            }
            Policy::Par {
                dim,
                resource,
                children,
            } => {
                let dim = *dim;
                self.backend
                    .for_each(*resource, frame.ranges[dim], &|i| {
                        let mut f = frame.clone();
                        f.coords[dim] = i;
                        self.run_list(children, &f)
                    })
            }
            Policy::Tile {
                dim,
                size,
                children,
            } => {
                let mut f = frame.clone();
                for seg in tiles(frame.ranges[*dim], *size)? {
                    f.ranges[*dim] = seg;
                    f.coords[*dim] = seg.lo;
                    self.run_list(children, &f)?;
                }
                Ok(())
            }
            Policy::Collapse {
                dims,
                resource,
                children,
            } => self.run_collapse(dims, *resource, children, frame),
            Policy::Staging { shape, children } => {
                let tile = StagingTile::<T>::acquire(shape)?;
                trace!(shape = ?shape.as_slice(), depth = frame.tiles.len(), "staging tile acquired");
                let inner = Frame {
                    coords: frame.coords.clone(),
                    ranges: frame.ranges.clone(),
                    tiles: frame
                        .tiles
                        .iter()
                        .copied()
                        .chain(std::iter::once(&tile))
                        .collect(),
                };
                let r = self.run_list(children, &inner);
                drop(inner);
                trace!(epoch = tile.epoch(), "staging tile released");
                tile.release();
                r
            }
            Policy::Barrier => {
                trace!(tiles = frame.tiles.len(), "barrier");
                frame.tiles.iter().for_each(|t| t.barrier());
                Ok(())
            }
            Policy::Body(index) => {
                let body = self.bodies.get(*index).ok_or(ConfigError::UnknownBody {
                    index: *index,
                    count: self.bodies.len(),
                })?;
                body(&Context {
                    coords: &frame.coords,
                    tiles: &frame.tiles,
                })
            }
        }
    }

    fn run_collapse(
        &self,
        dims: &[usize],
        resource: Resource,
        children: &[Policy],
        frame: &Frame<'_, T>,
    ) -> Result<()> {
        let ranges: SmallVec<[Segment; 4]> = dims.iter().map(|&d| frame.ranges[d]).collect();
        if ranges.iter().any(Segment::is_empty) {
            return Ok(());
        }
        let total = ranges
            .iter()
            .try_fold(1i64, |acc, r| acc.checked_mul(r.extent()))
            .ok_or_else(|| ConfigError::CollapseOverflow {
                dims: dims.to_vec(),
            })?;
        self.backend
            .for_each(resource, Segment { lo: 0, hi: total }, &|flat| {
                let mut f = frame.clone();
                let mut rest = flat;
                // last listed dim varies fastest
                for (&d, r) in dims.iter().zip(&ranges).rev() {
                    let ext = r.extent();
                    f.coords[d] = r.lo + rest % ext;
                    rest /= ext;
                }
                self.run_list(children, &f)
            })
    }
}

/// Validate `policy`, lower it and run `kernel` over `space` on `backend`.
///
/// `policy` is either a single node or a list of sibling nodes. Configuration
/// errors are reported before any body runs; the first error a body returns
/// stops the launch and is returned.
#[instrument(skip_all, fields(backend = backend.name(), rank = space.rank()))]
pub fn execute<P, B, T>(policy: &P, space: &IndexSpace, backend: &B, kernel: &Kernel<'_, T>) -> Result<()>
where
    P: AsRef<[Policy]> + ?Sized,
    B: Backend + ?Sized,
    T: StageScalar,
{
    Plan::compile(policy.as_ref(), space, backend, kernel.len())?.run(kernel)
}
