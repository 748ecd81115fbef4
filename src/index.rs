//! Iteration domains.

use smallvec::SmallVec;

use crate::{ConfigError, Result};

/// Half-open integer range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub lo: i64,
    pub hi: i64,
}

impl Segment {
    /// Create a segment, checking `lo <= hi` and that the extent fits in `i64`.
    ///
    /// # Errors
    /// [`ConfigError::InvalidSegment`].
    pub fn new(lo: i64, hi: i64) -> Result<Self> {
        if !spans_fit(lo, hi) {
            return Err(ConfigError::InvalidSegment { lo, hi }.into());
        }
        Ok(Self { lo, hi })
    }

    /// Number of points in the segment, saturating at `i64::MAX`.
    #[inline]
    pub fn extent(&self) -> i64 {
        self.hi.saturating_sub(self.lo)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }

    #[inline]
    pub fn contains(&self, i: i64) -> bool {
        self.lo <= i && i < self.hi
    }
}

#[inline]
fn spans_fit(lo: i64, hi: i64) -> bool {
    lo <= hi && hi.checked_sub(lo).is_some()
}

impl From<std::ops::Range<i64>> for Segment {
    fn from(r: std::ops::Range<i64>) -> Self {
        Self {
            lo: r.start,
            hi: r.end,
        }
    }
}

/// An ordered tuple of segments, one per loop dimension.
///
/// Dimensions are numbered `0..rank()`. The space is immutable once built and
/// can be shared by concurrent launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpace {
    segments: SmallVec<[Segment; 6]>,
}

impl IndexSpace {
    /// Build a space from `(lo, hi)` pairs.
    ///
    /// # Errors
    /// [`ConfigError::InvalidRange`] if any pair has `lo > hi` or spans more
    /// than `i64::MAX` points.
    pub fn new<I>(ranges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        let mut segments = SmallVec::new();
        for (dim, (lo, hi)) in ranges.into_iter().enumerate() {
            if !spans_fit(lo, hi) {
                return Err(ConfigError::InvalidRange { dim, lo, hi }.into());
            }
            segments.push(Segment { lo, hi });
        }
        Ok(Self { segments })
    }

    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.segments.len()
    }

    /// Segment of `dim`, if the space has it.
    #[inline]
    pub fn segment(&self, dim: usize) -> Option<Segment> {
        self.segments.get(dim).copied()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Extent of one dimension.
    ///
    /// # Errors
    /// [`ConfigError::DimOutOfRange`] for a dimension past the rank.
    pub fn extent(&self, dim: usize) -> Result<i64> {
        self.segment(dim)
            .map(|s| s.extent())
            .ok_or_else(|| self.dim_error(dim))
    }

    /// Total number of coordinate tuples (product of extents), saturating at
    /// `u64::MAX`.
    pub fn len(&self) -> u64 {
        self.segments
            .iter()
            .fold(1u64, |acc, s| acc.saturating_mul(s.extent() as u64))
    }

    /// True if any dimension is empty.
    ///
    /// A rank-0 space holds exactly one (empty) tuple and is not empty.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().any(Segment::is_empty)
    }

    /// Copy of the space with `dim` clipped to `[lo, hi)`.
    ///
    /// # Errors
    /// [`ConfigError::SubRangeOutside`] if `[lo, hi)` is not inside the current
    /// range of `dim`, or [`ConfigError::DimOutOfRange`].
    pub fn sub_range(&self, dim: usize, lo: i64, hi: i64) -> Result<Self> {
        let seg = self.segment(dim).ok_or_else(|| self.dim_error(dim))?;
        if lo > hi || lo < seg.lo || hi > seg.hi {
            return Err(ConfigError::SubRangeOutside { dim, lo, hi }.into());
        }
        let mut segments = self.segments.clone();
        segments[dim] = Segment { lo, hi };
        Ok(Self { segments })
    }

    /// Starting coordinate of every dimension.
    pub(crate) fn origin(&self) -> SmallVec<[i64; 6]> {
        self.segments.iter().map(|s| s.lo).collect()
    }

    fn dim_error(&self, dim: usize) -> crate::LoopError {
        ConfigError::DimOutOfRange {
            dim,
            rank: self.rank(),
        }
        .into()
    }
}
