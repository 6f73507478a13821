//! Randomness used while building the forest.
//!
//! The builder never reaches for a global generator. It draws from a
//! [`RandomSource`] owned by the index, so a seeded source makes builds
//! byte-for-byte reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The two draws the forest builder needs.
pub trait RandomSource {
    /// Uniform random bit
    fn flip(&mut self) -> bool;

    /// Uniform integer in `[0, n)`. `n` must be non-zero.
    fn index(&mut self, n: usize) -> usize;
}

impl<T: RandomSource + ?Sized> RandomSource for &mut T {
    #[inline]
    fn flip(&mut self) -> bool {
        (**self).flip()
    }

    #[inline]
    fn index(&mut self, n: usize) -> usize {
        (**self).index(n)
    }
}

/// [`RandomSource`] backed by any `rand` generator.
#[derive(Debug, Clone)]
pub struct RngSource<R = StdRng> {
    rng: R,
}

impl RngSource<StdRng> {
    /// Generator seeded from the operating system
    #[must_use]
    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    /// Deterministic generator for reproducible builds
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl<R: Rng> RngSource<R> {
    /// Wrap an existing generator
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl Default for RngSource<StdRng> {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl<R: Rng> RandomSource for RngSource<R> {
    #[inline]
    fn flip(&mut self) -> bool {
        self.rng.random::<bool>()
    }

    #[inline]
    fn index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0, "index() needs a non-empty range");
        self.rng.random_range(0..n)
    }
}
