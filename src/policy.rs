//! Declarative loop-nest policies.

use smallvec::SmallVec;

/// Execution resource a parallel loop is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// SIMD-style lanes: data parallel, no cross-lane dependencies.
    VectorLane,
    /// Workers of a bounded CPU thread pool.
    CpuWorker,
    /// Threads within one device block.
    GpuThread,
    /// Device blocks. Staging memory never spans blocks.
    GpuBlock,
}

/// A node of the policy tree.
///
/// Children of a node run in listed order. Bodies under one loop share each
/// iteration (fusion); bodies under sibling loops run as separate passes
/// (fission).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Iterate `dim` in increasing order.
    Seq { dim: usize, children: Vec<Policy> },
    /// Distribute `dim` over `resource` units. No ordering across units.
    Par {
        dim: usize,
        resource: Resource,
        children: Vec<Policy>,
    },
    /// Split `dim` into tiles of `size`; children see one clipped tile at a time.
    Tile {
        dim: usize,
        size: i64,
        children: Vec<Policy>,
    },
    /// Flatten `dims` (most significant first) into one stream over `resource`.
    Collapse {
        dims: SmallVec<[usize; 4]>,
        resource: Resource,
        children: Vec<Policy>,
    },
    /// One staging tile of `shape`, live for each activation of the children.
    Staging {
        shape: SmallVec<[usize; 4]>,
        children: Vec<Policy>,
    },
    /// Synchronize every staging tile in scope.
    Barrier,
    /// Invoke the body at `index` in the kernel's body list.
    Body(usize),
}

impl Policy {
    pub fn seq(dim: usize, children: impl IntoIterator<Item = Policy>) -> Self {
        Policy::Seq {
            dim,
            children: children.into_iter().collect(),
        }
    }

    pub fn par(dim: usize, resource: Resource, children: impl IntoIterator<Item = Policy>) -> Self {
        Policy::Par {
            dim,
            resource,
            children: children.into_iter().collect(),
        }
    }

    pub fn tile(dim: usize, size: i64, children: impl IntoIterator<Item = Policy>) -> Self {
        Policy::Tile {
            dim,
            size,
            children: children.into_iter().collect(),
        }
    }

    pub fn collapse(
        dims: &[usize],
        resource: Resource,
        children: impl IntoIterator<Item = Policy>,
    ) -> Self {
        Policy::Collapse {
            dims: SmallVec::from_slice(dims),
            resource,
            children: children.into_iter().collect(),
        }
    }

    pub fn staging(shape: &[usize], children: impl IntoIterator<Item = Policy>) -> Self {
        Policy::Staging {
            shape: SmallVec::from_slice(shape),
            children: children.into_iter().collect(),
        }
    }

    pub fn barrier() -> Self {
        Policy::Barrier
    }

    pub fn body(index: usize) -> Self {
        Policy::Body(index)
    }

    pub fn children(&self) -> &[Policy] {
        match self {
            Policy::Seq { children, .. }
            | Policy::Par { children, .. }
            | Policy::Tile { children, .. }
            | Policy::Collapse { children, .. }
            | Policy::Staging { children, .. } => children,
            Policy::Barrier | Policy::Body(_) => &[],
        }
    }

    /// Copy of a node with different children. Leaves ignore them.
    pub(crate) fn with_children(&self, children: Vec<Policy>) -> Policy {
        match self {
            Policy::Seq { dim, .. } => Policy::Seq {
                dim: *dim,
                children,
            },
            Policy::Par { dim, resource, .. } => Policy::Par {
                dim: *dim,
                resource: *resource,
                children,
            },
            Policy::Tile { dim, size, .. } => Policy::Tile {
                dim: *dim,
                size: *size,
                children,
            },
            Policy::Collapse { dims, resource, .. } => Policy::Collapse {
                dims: dims.clone(),
                resource: *resource,
                children,
            },
            Policy::Staging { shape, .. } => Policy::Staging {
                shape: shape.clone(),
                children,
            },
            Policy::Barrier => Policy::Barrier,
            Policy::Body(i) => Policy::Body(*i),
        }
    }

    /// Number of `Body` nodes in the subtree.
    pub fn body_count(&self) -> usize {
        match self {
            Policy::Body(_) => 1,
            _ => self.children().iter().map(Policy::body_count).sum(),
        }
    }
}

/// A single node is a one-element policy list, so launches accept either.
impl AsRef<[Policy]> for Policy {
    fn as_ref(&self) -> &[Policy] {
        std::slice::from_ref(self)
    }
}
