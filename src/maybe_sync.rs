//! Thread-safety bounds that follow the `parallel` feature.
//!
//! With `parallel` enabled, bodies, backends and combine operations are
//! shared with rayon workers and must be [`Sync`]; [`MaybeSync`] is then an
//! alias for it. Without `parallel` every launch runs on the calling thread and
//! the marker is implemented for all types, so bodies may capture `Rc`,
//! `Cell` and the like.

#[cfg(feature = "parallel")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "parallel")]
impl<T: Sync> MaybeSync for T {}

#[cfg(not(feature = "parallel"))]
pub trait MaybeSync {}
#[cfg(not(feature = "parallel"))]
impl<T> MaybeSync for T {}

// Trait objects cannot name `MaybeSync`, so the erased callback types are
// spelled out per feature.

/// Per-unit callback handed to [`Backend::for_each`](crate::Backend::for_each).
#[cfg(feature = "parallel")]
pub type UnitFn<'a> = dyn Fn(i64) -> crate::Result<()> + Sync + 'a;
/// Per-unit callback handed to [`Backend::for_each`](crate::Backend::for_each).
#[cfg(not(feature = "parallel"))]
pub type UnitFn<'a> = dyn Fn(i64) -> crate::Result<()> + 'a;

/// A kernel body, invoked once per iteration of its `Body` node.
#[cfg(feature = "parallel")]
pub type BodyFn<'a, T> = dyn Fn(&crate::Context<'_, T>) -> crate::Result<()> + Sync + 'a;
/// A kernel body, invoked once per iteration of its `Body` node.
#[cfg(not(feature = "parallel"))]
pub type BodyFn<'a, T> = dyn Fn(&crate::Context<'_, T>) -> crate::Result<()> + 'a;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_types_satisfy_markers() {
        fn _check_sync<T: MaybeSync>() {}
        fn _check_send_sync<T: Send + Sync>() {}
        _check_sync::<crate::StagingTile<f64>>();
        _check_sync::<crate::ReduceSum<i64>>();
        _check_sync::<crate::Policy>();
        // policies and spaces are plain data, shareable with or without `parallel`
        _check_send_sync::<crate::Policy>();
        _check_send_sync::<crate::IndexSpace>();
    }

    #[cfg(not(feature = "parallel"))]
    #[test]
    fn test_cell_capturing_body_without_parallel() {
        use std::cell::Cell;
        fn _check_sync<T: MaybeSync>() {}
        _check_sync::<Cell<i64>>();
    }
}
