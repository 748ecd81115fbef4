//! Fixed-shape staging memory shared by the participants of one tile.
//!
//! A tile is written in one phase, synchronized with [`StagingTile::barrier`],
//! and read in the next. Cells are relaxed atomic words: the barrier (or the
//! join at the end of a parallel loop) is what orders writes before reads.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::scalar::StageScalar;
use crate::{AccessError, ConfigError, Result};

type Shape = SmallVec<[usize; 4]>;

/// A zero-initialized, fixed-shape buffer addressed by local tile coordinates.
///
/// The buffer is row-major: the last coordinate varies fastest.
pub struct StagingTile<T> {
    shape: Shape,
    strides: Shape,
    cells: Box<[AtomicU64]>,
    epoch: AtomicUsize,
    _marker: PhantomData<T>,
}

impl<T: StageScalar> StagingTile<T> {
    /// Allocate a tile of the given shape with every cell set to zero.
    ///
    /// # Errors
    /// [`ConfigError::InvalidShape`] for an empty shape or a zero extent.
    pub fn acquire(shape: &[usize]) -> Result<Self> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(ConfigError::InvalidShape(shape.to_vec()).into());
        }
        let mut strides: Shape = SmallVec::from_elem(1, shape.len());
        for d in (0..shape.len() - 1).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        let len = strides[0] * shape[0];
        let zero = T::from_bits64(0).to_bits64();
        let cells = (0..len).map(|_| AtomicU64::new(zero)).collect();
        Ok(Self {
            shape: SmallVec::from_slice(shape),
            strides,
            cells,
            epoch: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    /// End the tile's lifetime. Equivalent to dropping it.
    pub fn release(self) {}

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of barriers issued on this tile so far.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Synchronization point between a write phase and a read phase.
    ///
    /// The executor calls this once per barrier, after every participant of
    /// the preceding phase has been joined.
    pub fn barrier(&self) {
        fence(Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn offset(&self, index: &[i64]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(self.oob(index));
        }
        let mut off = 0usize;
        for ((&i, &n), &s) in index.iter().zip(&self.shape).zip(&self.strides) {
            if i < 0 || i as usize >= n {
                return Err(self.oob(index));
            }
            off += i as usize * s;
        }
        Ok(off)
    }

    #[inline]
    fn offset_fast(&self, index: &[i64]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        let mut off = 0usize;
        for ((&i, &n), &s) in index.iter().zip(&self.shape).zip(&self.strides) {
            debug_assert!(i >= 0 && (i as usize) < n, "staging index {index:?} out of bounds");
            off += i as usize * s;
        }
        off
    }

    fn oob(&self, index: &[i64]) -> crate::LoopError {
        AccessError::Staging {
            index: index.to_vec(),
            shape: self.shape.to_vec(),
        }
        .into()
    }

    /// Read the cell at `index`.
    ///
    /// # Errors
    /// [`AccessError::Staging`] if `index` is outside the shape.
    pub fn get(&self, index: &[i64]) -> Result<T> {
        let off = self.offset(index)?;
        Ok(T::from_bits64(self.cells[off].load(Ordering::Relaxed)))
    }

    /// Write `value` to the cell at `index`.
    ///
    /// # Errors
    /// [`AccessError::Staging`] if `index` is outside the shape.
    pub fn set(&self, index: &[i64], value: T) -> Result<()> {
        let off = self.offset(index)?;
        self.cells[off].store(value.to_bits64(), Ordering::Relaxed);
        Ok(())
    }

    /// Replace the cell at `index` with `f(old)` and return the new value.
    ///
    /// Not atomic with respect to other participants writing the same cell;
    /// meant for cells owned by a single participant.
    pub fn update<F>(&self, index: &[i64], f: F) -> Result<T>
    where
        F: FnOnce(T) -> T,
    {
        let off = self.offset(index)?;
        let cell = &self.cells[off];
        let new = f(T::from_bits64(cell.load(Ordering::Relaxed)));
        cell.store(new.to_bits64(), Ordering::Relaxed);
        Ok(new)
    }

    /// Bounds-checked handle to one cell.
    pub fn at(&self, index: &[i64]) -> Result<TileCell<'_, T>> {
        let off = self.offset(index)?;
        Ok(TileCell {
            cell: &self.cells[off],
            _marker: PhantomData,
        })
    }

    /// Fast-path read: per-dimension bounds are only checked in debug builds.
    ///
    /// # Panics
    /// If the flattened offset falls outside the buffer.
    #[inline]
    pub fn load(&self, index: &[i64]) -> T {
        T::from_bits64(self.cells[self.offset_fast(index)].load(Ordering::Relaxed))
    }

    /// Fast-path write: per-dimension bounds are only checked in debug builds.
    ///
    /// # Panics
    /// If the flattened offset falls outside the buffer.
    #[inline]
    pub fn store(&self, index: &[i64], value: T) {
        self.cells[self.offset_fast(index)].store(value.to_bits64(), Ordering::Relaxed);
    }

    /// Set every cell to `value`.
    pub fn fill(&self, value: T) {
        let bits = value.to_bits64();
        for c in self.cells.iter() {
            c.store(bits, Ordering::Relaxed);
        }
    }

    /// Copy of the contents in row-major order.
    pub fn to_vec(&self) -> Vec<T> {
        self.cells
            .iter()
            .map(|c| T::from_bits64(c.load(Ordering::Relaxed)))
            .collect()
    }
}

impl<T> std::fmt::Debug for StagingTile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingTile")
            .field("shape", &self.shape)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

/// A single staging cell, obtained from [`StagingTile::at`].
pub struct TileCell<'a, T> {
    cell: &'a AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: StageScalar> TileCell<'_, T> {
    #[inline]
    pub fn get(&self) -> T {
        T::from_bits64(self.cell.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: T) {
        self.cell.store(value.to_bits64(), Ordering::Relaxed);
    }
}
