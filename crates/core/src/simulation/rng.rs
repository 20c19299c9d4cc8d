//! Seeded random number generator shared by a run.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// A thread-safe, seeded random number generator.
///
/// Identifiers, latency samples and churn intervals all draw from one of
/// these, so a run configured with the same seed makes the same random
/// decisions. Draws from concurrent tasks are serialized by the inner lock;
/// their relative order is still up to the scheduler.
#[derive(Clone)]
pub struct SimulationRng {
    inner: Arc<Mutex<SmallRng>>,
    seed: u64,
}

impl SimulationRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))),
            seed,
        }
    }

    pub fn gen_u64(&self) -> u64 {
        self.inner.lock().random()
    }

    /// Generates a random Duration within the given range. An empty range
    /// yields its start.
    pub fn gen_duration(&self, range: std::ops::Range<Duration>) -> Duration {
        let start_nanos = range.start.as_nanos() as u64;
        let end_nanos = range.end.as_nanos() as u64;
        if start_nanos >= end_nanos {
            return range.start;
        }
        let nanos = self.inner.lock().random_range(start_nanos..end_nanos);
        Duration::from_nanos(nanos)
    }

    /// Chooses a random element from a slice, returning None if empty.
    pub fn choose<'a, T>(&self, slice: &'a [T]) -> Option<&'a T> {
        if slice.is_empty() {
            return None;
        }
        let idx = self.inner.lock().random_range(0..slice.len());
        slice.get(idx)
    }

    /// Creates an independent generator derived from this seed and `index`.
    ///
    /// Children do not consume draws from the parent, so adding a consumer on
    /// one stream never shifts the values seen on another.
    pub fn child_with_index(&self, index: u64) -> Self {
        let derived_seed = self
            .seed
            .wrapping_mul(0x517cc1b727220a95)
            .wrapping_add(index);
        Self::new(derived_seed)
    }

    /// Direct access for sampling from distributions. Do not hold the guard
    /// across await points.
    pub fn lock(&self) -> MutexGuard<'_, SmallRng> {
        self.inner.lock()
    }
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRng")
            .field("seed", &self.seed)
            .finish()
    }
}
