//! Range splitting for the parallel backends.
//!
//! A range is cut in half with `rayon::join` until either the thread budget
//! for the subtree is spent or the slice is no longer than the grain. Each
//! leaf runs its slice in ascending order.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::index::Segment;
use crate::maybe_sync::UnitFn;
use crate::Result;

/// Run `f` over `range` in order, stopping early once `abort` is raised.
pub(crate) fn run_serial(range: Segment, abort: &AtomicBool, f: &UnitFn<'_>) -> Result<()> {
    for i in range.lo..range.hi {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = f(i) {
            abort.store(true, Ordering::Relaxed);
            return Err(e);
        }
    }
    Ok(())
}

/// Run `f` over `range` in chunks of `width` lanes.
///
/// Lanes of a chunk carry no cross-lane ordering contract; they are issued
/// in ascending order on the calling worker.
pub(crate) fn for_each_lane(range: Segment, width: usize, f: &UnitFn<'_>) -> Result<()> {
    let width = width.max(1) as i64;
    let mut lo = range.lo;
    while lo < range.hi {
        let hi = range.hi.min(lo + width);
        for lane in lo..hi {
            f(lane)?;
        }
        lo = hi;
    }
    Ok(())
}

/// Recursively split `range` across at most `nthreads` workers.
///
/// Returns the first error any slice produced; slices that have not started
/// yet observe `abort` and skip their work.
#[cfg(feature = "parallel")]
pub(crate) fn split_range(
    range: Segment,
    nthreads: usize,
    grain: usize,
    abort: &AtomicBool,
    f: &UnitFn<'_>,
) -> Result<()> {
    let len = range.extent().max(0) as usize;
    if nthreads <= 1 || len <= grain.max(crate::MIN_SPLIT_LENGTH) {
        return run_serial(range, abort, f);
    }

    let mid = range.lo + (len / 2) as i64;
    let nt_left = nthreads / 2;
    let nt_right = nthreads - nt_left;
    let left = Segment {
        lo: range.lo,
        hi: mid,
    };
    let right = Segment {
        lo: mid,
        hi: range.hi,
    };

    let (r1, r2) = rayon::join(
        || split_range(left, nt_left, grain, abort, f),
        || split_range(right, nt_right, grain, abort, f),
    );
    r1?;
    r2?;
    Ok(())
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn split_range(
    range: Segment,
    _nthreads: usize,
    _grain: usize,
    abort: &AtomicBool,
    f: &UnitFn<'_>,
) -> Result<()> {
    run_serial(range, abort, f)
}
