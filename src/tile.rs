//! Tile partitioning of a single dimension.
//!
//! A range of extent `e` split with tile size `ts` yields `ceil(e / ts)`
//! contiguous tiles ordered by tile index. Every tile except possibly the last
//! has extent `ts`; the last has extent `e - ts * (count - 1)`, which is
//! always in `[1, ts]`.

use crate::index::Segment;
use crate::{AccessError, ConfigError, Result};

#[inline]
fn check_tile_size(tile_size: i64) -> Result<()> {
    if tile_size <= 0 {
        return Err(ConfigError::NonPositiveTileSize(tile_size).into());
    }
    Ok(())
}

/// Number of tiles covering `extent` elements.
///
/// # Errors
/// [`ConfigError::NonPositiveTileSize`] if `tile_size <= 0`.
pub fn tile_count(extent: i64, tile_size: i64) -> Result<i64> {
    check_tile_size(tile_size)?;
    if extent <= 0 {
        return Ok(0);
    }
    Ok(extent / tile_size + i64::from(extent % tile_size != 0))
}

/// Bounds `[start, end)` of tile `tile_index`, relative to the range start.
///
/// # Errors
/// [`ConfigError::NonPositiveTileSize`] for a bad tile size,
/// [`AccessError::Tile`] if `tile_index` is not in `[0, tile_count)`.
pub fn tile_bounds(extent: i64, tile_size: i64, tile_index: i64) -> Result<(i64, i64)> {
    let count = tile_count(extent, tile_size)?;
    if tile_index < 0 || tile_index >= count {
        return Err(AccessError::Tile {
            index: tile_index,
            count,
        }
        .into());
    }
    // tile_index < count keeps start inside [0, extent)
    let start = tile_index * tile_size;
    let end = extent.min(start.saturating_add(tile_size));
    Ok((start, end))
}

/// Iterate the tiles of `segment` as absolute sub-segments.
///
/// # Errors
/// [`ConfigError::NonPositiveTileSize`] if `tile_size <= 0`.
pub fn tiles(segment: Segment, tile_size: i64) -> Result<Tiles> {
    let count = tile_count(segment.extent(), tile_size)?;
    Ok(Tiles {
        segment,
        tile_size,
        next: 0,
        count,
    })
}

/// Iterator over the tiles of one segment, in tile-index order.
#[derive(Debug, Clone)]
pub struct Tiles {
    segment: Segment,
    tile_size: i64,
    next: i64,
    count: i64,
}

impl Iterator for Tiles {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.next >= self.count {
            return None;
        }
        let lo = self.segment.lo + self.next * self.tile_size;
        let hi = self.segment.hi.min(lo.saturating_add(self.tile_size));
        self.next += 1;
        Some(Segment { lo, hi })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next).max(0) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Tiles {}
