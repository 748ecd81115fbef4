//! Policy validation and lowering.
//!
//! A launch goes through the same pipeline every time:
//! 1. Validate the policy against the index space, the body count and the
//!    backend. Every configuration error is found here, before any body runs.
//! 2. Lower barriers. A parallel loop whose children contain a barrier is
//!    split into one loop per barrier-free phase, and sequential loops that
//!    carry a barrier are hoisted above the parallel loop, so that on every
//!    backend the barrier becomes a point where all participants of the
//!    preceding phase have been joined.
//! 3. Interpret the lowered tree (see `exec`).

use smallvec::SmallVec;
use tracing::debug;

use crate::backend::Backend;
use crate::exec::{Executor, Kernel};
use crate::index::IndexSpace;
use crate::policy::{Policy, Resource};
use crate::reduce::Accumulate;
use crate::scalar::StageScalar;
use crate::{ConfigError, Result};

/// A validated, lowered launch that can be run repeatedly.
#[derive(Debug)]
pub struct Plan<'a, B: ?Sized> {
    nodes: Vec<Policy>,
    space: &'a IndexSpace,
    backend: &'a B,
    bodies_required: usize,
}

struct Validator<'a, B: ?Sized> {
    rank: usize,
    body_count: usize,
    backend: &'a B,
    bound: SmallVec<[bool; 8]>,
    /// Largest range each dim can have at the current node.
    extents: SmallVec<[i64; 8]>,
    /// Dims of the parallel loops enclosing the current node, outermost first.
    parallel: SmallVec<[usize; 8]>,
    /// For each enclosing staging scope, `parallel.len()` at its entry.
    scopes: SmallVec<[usize; 4]>,
    in_collapse: bool,
    max_body: Option<usize>,
}

impl<B: Backend + ?Sized> Validator<'_, B> {
    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.rank {
            return Err(ConfigError::DimOutOfRange {
                dim,
                rank: self.rank,
            }
            .into());
        }
        if self.bound[dim] {
            return Err(ConfigError::DuplicateBinding { dim }.into());
        }
        Ok(())
    }

    fn check_resource(&self, resource: Resource, dim: usize) -> Result<()> {
        if !self.backend.supports(resource) {
            return Err(ConfigError::UnsupportedResource {
                backend: self.backend.name(),
                resource,
            }
            .into());
        }
        if resource == Resource::GpuBlock && !self.scopes.is_empty() {
            return Err(ConfigError::CrossBlockStaging { dim }.into());
        }
        Ok(())
    }

    fn visit_list(&mut self, nodes: &[Policy]) -> Result<()> {
        nodes.iter().try_for_each(|n| self.visit(n))
    }

    fn visit_bound(&mut self, dims: &[usize], children: &[Policy]) -> Result<()> {
        for &d in dims {
            self.bound[d] = true;
        }
        let r = self.visit_list(children);
        for &d in dims {
            self.bound[d] = false;
        }
        r
    }

    fn visit_parallel(&mut self, dims: &[usize], children: &[Policy]) -> Result<()> {
        self.parallel.push(dims[0]);
        let r = self.visit_bound(dims, children);
        self.parallel.pop();
        r
    }

    /// A barrier synchronizes every tile in scope. Tiles of scopes entered
    /// before a parallel loop are shared by all of its participants, which a
    /// barrier inside a later scope cannot join.
    fn check_barrier(&self) -> Result<()> {
        let (Some(&outer), Some(&inner)) = (self.scopes.first(), self.scopes.last()) else {
            return Err(ConfigError::BarrierOutsideStaging.into());
        };
        if outer < inner {
            return Err(ConfigError::BarrierAcrossParallel {
                dim: self.parallel[outer],
            }
            .into());
        }
        Ok(())
    }

    fn visit(&mut self, node: &Policy) -> Result<()> {
        match node {
            Policy::Seq { dim, children } => {
                self.check_dim(*dim)?;
                self.visit_bound(&[*dim], children)
            }
            Policy::Par {
                dim,
                resource,
                children,
            } => {
                self.check_dim(*dim)?;
                self.check_resource(*resource, *dim)?;
                self.visit_parallel(&[*dim], children)
            }
            Policy::Tile {
                dim,
                size,
                children,
            } => {
                self.check_dim(*dim)?;
                if *size <= 0 {
                    return Err(ConfigError::NonPositiveTileSize(*size).into());
                }
                let outer = self.extents[*dim];
                self.extents[*dim] = outer.min(*size);
                let r = self.visit_list(children);
                self.extents[*dim] = outer;
                r
            }
            Policy::Collapse {
                dims,
                resource,
                children,
            } => {
                if dims.is_empty() {
                    return Err(ConfigError::EmptyCollapse.into());
                }
                if self.in_collapse {
                    return Err(ConfigError::NestedCollapse {
                        dims: dims.to_vec(),
                    }
                    .into());
                }
                for (k, &d) in dims.iter().enumerate() {
                    self.check_dim(d)?;
                    if dims[..k].contains(&d) {
                        return Err(ConfigError::DuplicateBinding { dim: d }.into());
                    }
                }
                self.check_resource(*resource, dims[0])?;
                let mut extents = dims.iter().map(|&d| self.extents[d]);
                if !extents.clone().any(|e| e == 0)
                    && extents.try_fold(1i64, i64::checked_mul).is_none()
                {
                    return Err(ConfigError::CollapseOverflow {
                        dims: dims.to_vec(),
                    }
                    .into());
                }
                self.in_collapse = true;
                let r = self.visit_parallel(dims, children);
                self.in_collapse = false;
                r
            }
            Policy::Staging { shape, children } => {
                if shape.is_empty() || shape.contains(&0) {
                    return Err(ConfigError::InvalidShape(shape.to_vec()).into());
                }
                self.scopes.push(self.parallel.len());
                let r = self.visit_list(children);
                self.scopes.pop();
                r
            }
            Policy::Barrier => self.check_barrier(),
            Policy::Body(index) => {
                if *index >= self.body_count {
                    return Err(ConfigError::UnknownBody {
                        index: *index,
                        count: self.body_count,
                    }
                    .into());
                }
                self.max_body = Some(self.max_body.map_or(*index, |m| m.max(*index)));
                Ok(())
            }
        }
    }
}

/// True if `nodes` carries a barrier that synchronizes the enclosing level:
/// a direct barrier, or one inside a sequential loop or tile. Barriers inside
/// a nested staging scope belong to that scope.
fn has_level_barrier(nodes: &[Policy]) -> bool {
    nodes.iter().any(|n| match n {
        Policy::Barrier => true,
        Policy::Seq { children, .. } | Policy::Tile { children, .. } => {
            has_level_barrier(children)
        }
        _ => false,
    })
}

/// Lower a node list in which every participant runs the same control flow.
fn lower_list(nodes: &[Policy]) -> Vec<Policy> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Policy::Barrier | Policy::Body(_) => out.push(node.clone()),
            // staging scopes are opaque: their barriers never split an outer loop
            Policy::Staging { children, .. }
            | Policy::Seq { children, .. }
            | Policy::Tile { children, .. } => out.push(node.with_children(lower_list(children))),
            Policy::Par { children, .. } | Policy::Collapse { children, .. } => {
                out.extend(distribute(node, lower_list(children)))
            }
        }
    }
    out
}

/// Push the parallel loop `header` down through already-lowered `children`,
/// splitting it at every level barrier.
fn distribute(header: &Policy, children: Vec<Policy>) -> Vec<Policy> {
    if !has_level_barrier(&children) {
        return vec![header.with_children(children)];
    }

    let mut out = Vec::new();
    let mut run: Vec<Policy> = Vec::new();
    let flush = |run: &mut Vec<Policy>, out: &mut Vec<Policy>| {
        if !run.is_empty() {
            out.push(header.with_children(std::mem::take(run)));
        }
    };

    for child in children {
        match child {
            Policy::Barrier => {
                flush(&mut run, &mut out);
                out.push(Policy::Barrier);
            }
            Policy::Seq { .. } | Policy::Tile { .. } if has_level_barrier(child.children()) => {
                flush(&mut run, &mut out);
                let inner = distribute(header, child.children().to_vec());
                out.push(child.with_children(inner));
            }
            other => run.push(other),
        }
    }
    flush(&mut run, &mut out);
    out
}

fn count_barriers(nodes: &[Policy]) -> usize {
    nodes
        .iter()
        .map(|n| match n {
            Policy::Barrier => 1,
            _ => count_barriers(n.children()),
        })
        .sum()
}

impl<'a, B: Backend + ?Sized> Plan<'a, B> {
    /// Validate `policy` for `space`, `backend` and a kernel of `body_count`
    /// bodies, then lower it.
    ///
    /// # Errors
    /// Any [`ConfigError`] the policy triggers.
    pub fn compile(
        policy: &[Policy],
        space: &'a IndexSpace,
        backend: &'a B,
        body_count: usize,
    ) -> Result<Self> {
        let mut v = Validator {
            rank: space.rank(),
            body_count,
            backend,
            bound: SmallVec::from_elem(false, space.rank()),
            extents: space.segments().iter().map(|s| s.extent()).collect(),
            parallel: SmallVec::new(),
            scopes: SmallVec::new(),
            in_collapse: false,
            max_body: None,
        };
        v.visit_list(policy)?;

        let nodes = lower_list(policy);
        debug!(
            backend = backend.name(),
            rank = space.rank(),
            bodies = body_count,
            body_nodes = policy.iter().map(Policy::body_count).sum::<usize>(),
            barriers = count_barriers(&nodes),
            "plan compiled"
        );
        Ok(Self {
            nodes,
            space,
            backend,
            bodies_required: v.max_body.map_or(0, |m| m + 1),
        })
    }

    /// The lowered policy.
    pub fn nodes(&self) -> &[Policy] {
        &self.nodes
    }

    /// Run the plan once.
    ///
    /// Attached accumulators are opened before the first body and finalized
    /// before this returns, on success and on failure.
    ///
    /// # Errors
    /// [`ConfigError::UnknownBody`] if `kernel` has fewer bodies than the plan
    /// was compiled for, [`ConfigError::AccumulatorInUse`], or the first error
    /// a body returned.
    pub fn run<T: StageScalar>(&self, kernel: &Kernel<'_, T>) -> Result<()> {
        if kernel.len() < self.bodies_required {
            return Err(ConfigError::UnknownBody {
                index: self.bodies_required - 1,
                count: kernel.len(),
            }
            .into());
        }

        let reducers = kernel.reducers();
        for (k, r) in reducers.iter().enumerate() {
            if let Err(e) = r.open() {
                reducers[..k].iter().for_each(|r| r.close());
                return Err(e);
            }
        }

        let result = if self.space.is_empty() {
            Ok(())
        } else {
            Executor::new(self.backend, kernel.bodies()).run(&self.nodes, self.space)
        };

        reducers.iter().for_each(|r| r.close());
        result
    }
}
