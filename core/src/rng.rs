//! Deterministic random number generation for synthetic populations.
//!
//! RULE: Nothing in the crate may call any platform RNG.
//! All randomness flows through SampleRng instances derived from a single
//! seed, one stream per purpose. This means:
//!   - Adding a new stream never changes existing streams.
//!   - The same seed always yields the same population.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG stream.
pub struct SampleRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl SampleRng {
    /// Create a stream from the master seed and a stable stream index.
    /// The index must never change once assigned.
    pub fn new(master_seed: u64, stream: Stream) -> Self {
        let derived_seed = master_seed ^ ((stream as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name:  stream.name(),
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

/// Stable stream assignments.
/// NEVER reorder or remove entries, only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Stream {
    PassRates = 0,
    Flags = 1,
    Fanout = 2,
}

impl Stream {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassRates => "pass_rates",
            Self::Flags => "flags",
            Self::Fanout => "fanout",
        }
    }
}
