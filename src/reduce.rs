//! Cross-participant reductions.
//!
//! Every participant folds its contributions into a slot of its own (one slot
//! per worker thread, to keep contention and false sharing off the hot path).
//! The slots are combined into the result when the launch the accumulator is
//! attached to finishes, so the combine operation must be associative and
//! commutative: the grouping of partials depends on how the backend split the
//! work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use num_traits::{Bounded, One, Zero};

use crate::maybe_sync::MaybeSync;
use crate::{ConfigError, LoopError, Result};

/// An associative, commutative combine operation with an identity.
pub trait Combine<T>: MaybeSync {
    fn identity(&self) -> T;
    fn combine(&self, a: T, b: T) -> T;
}

/// Addition. The default operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<T: Zero> Combine<T> for Sum {
    fn identity(&self) -> T {
        T::zero()
    }
    fn combine(&self, a: T, b: T) -> T {
        a + b
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Product;

impl<T: One> Combine<T> for Product {
    fn identity(&self) -> T {
        T::one()
    }
    fn combine(&self, a: T, b: T) -> T {
        a * b
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<T: Bounded + PartialOrd> Combine<T> for Min {
    fn identity(&self) -> T {
        T::max_value()
    }
    fn combine(&self, a: T, b: T) -> T {
        if b < a {
            b
        } else {
            a
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl<T: Bounded + PartialOrd> Combine<T> for Max {
    fn identity(&self) -> T {
        T::min_value()
    }
    fn combine(&self, a: T, b: T) -> T {
        if b > a {
            b
        } else {
            a
        }
    }
}

/// Lifecycle hooks the executor drives for attached accumulators.
pub trait Accumulate: MaybeSync {
    /// Mark the accumulator as owned by a running launch.
    ///
    /// # Errors
    /// [`ConfigError::AccumulatorInUse`] if another launch already owns it.
    fn open(&self) -> Result<()>;

    /// Fold every participant's partial into the result and release ownership.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// A reduction cell with per-participant partials and a deferred read.
pub struct Reducer<T, C = Sum> {
    op: C,
    slots: Box<[Mutex<Option<T>>]>,
    value: Mutex<T>,
    open: AtomicBool,
}

pub type ReduceSum<T> = Reducer<T, Sum>;
pub type ReduceMin<T> = Reducer<T, Min>;
pub type ReduceMax<T> = Reducer<T, Max>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a body that panicked mid-contribution leaves a valid partial behind
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot_count() -> usize {
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads() + 1
    }
    #[cfg(not(feature = "parallel"))]
    {
        1
    }
}

impl<T, C: Combine<T> + Default> Reducer<T, C> {
    /// New accumulator whose result starts at `init`.
    pub fn new(init: T) -> Self {
        Self::with_op(init, C::default())
    }
}

impl<T, C: Combine<T>> Reducer<T, C> {
    pub fn with_op(init: T, op: C) -> Self {
        let slots = (0..slot_count()).map(|_| Mutex::new(None)).collect();
        Self {
            op,
            slots,
            value: Mutex::new(init),
            open: AtomicBool::new(false),
        }
    }

    #[inline]
    fn slot(&self) -> &Mutex<Option<T>> {
        #[cfg(feature = "parallel")]
        let idx = rayon::current_thread_index().map_or(0, |i| i + 1) % self.slots.len();
        #[cfg(not(feature = "parallel"))]
        let idx = 0;
        &self.slots[idx]
    }

    /// Merge `partial` into the calling participant's running value.
    pub fn contribute(&self, partial: T) {
        let mut slot = lock(self.slot());
        let next = match slot.take() {
            Some(acc) => self.op.combine(acc, partial),
            None => partial,
        };
        *slot = Some(next);
    }

    fn fold_slots(&self) {
        let mut value = lock(&self.value);
        for slot in self.slots.iter() {
            if let Some(partial) = lock(slot).take() {
                let acc = std::mem::replace(&mut *value, self.op.identity());
                *value = self.op.combine(acc, partial);
            }
        }
    }

    /// The finalized value.
    ///
    /// # Errors
    /// [`LoopError::PrematureRead`] while the launch this accumulator is
    /// attached to is still running.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        if self.open.load(Ordering::Acquire) {
            return Err(LoopError::PrematureRead);
        }
        self.fold_slots();
        Ok(lock(&self.value).clone())
    }

    /// Fold outstanding partials and return the result.
    ///
    /// Takes `&mut self`, so no launch can still be contributing.
    pub fn finalize(&mut self) -> T
    where
        T: Clone,
    {
        let value = self.value.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in self.slots.iter_mut() {
            let slot = slot.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Some(partial) = slot.take() {
                let acc = std::mem::replace(value, self.op.identity());
                *value = self.op.combine(acc, partial);
            }
        }
        value.clone()
    }

    /// Discard all partials and restart from `init`.
    pub fn reset(&mut self, init: T) {
        for slot in self.slots.iter_mut() {
            *slot.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        }
        *self.value.get_mut().unwrap_or_else(PoisonError::into_inner) = init;
        *self.open.get_mut() = false;
    }
}

impl<T, C> Accumulate for Reducer<T, C>
where
    C: Combine<T>,
    Reducer<T, C>: MaybeSync,
{
    fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(ConfigError::AccumulatorInUse.into());
        }
        Ok(())
    }

    fn close(&self) {
        self.fold_slots();
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl<T: std::fmt::Debug, C> std::fmt::Debug for Reducer<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("value", &*lock(&self.value))
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}
