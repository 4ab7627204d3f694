//! xorshift64* pseudo-random number generator.
//!
//! Fast, 64-bit-state PRNG with good statistical quality for simulation
//! use. Same seed, same sequence: clearing passes, shock draws and
//! tie-breaking all rely on this for deterministic replay.

use serde::{Deserialize, Serialize};

/// Deterministic PRNG used by every logic module.
///
/// # Example
/// ```
/// use econ_simulator_core_rs::RngManager;
///
/// let mut rng = RngManager::new(12345);
/// let noise = rng.next_f64();
/// assert!(noise >= 0.0 && noise < 1.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RngManager {
    state: u64,
}

impl RngManager {
    /// Create a generator from a seed. Zero seeds are remapped to 1
    /// (xorshift state must be nonzero).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Next raw 64-bit value.
    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `[min, max)`.
    ///
    /// # Panics
    /// Panics if `min >= max`.
    pub fn range(&mut self, min: i64, max: i64) -> i64 {
        assert!(min < max, "min must be less than max");
        let span = (max - min) as u64;
        min + (self.next() % span) as i64
    }

    /// Uniform f64 in `[0.0, 1.0)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next() >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }

    /// Standard-normal draw via Box-Muller.
    pub fn next_gaussian(&mut self) -> f64 {
        // Rejection on u1 == 0 keeps ln() finite.
        let mut u1 = self.next_f64();
        while u1 == 0.0 {
            u1 = self.next_f64();
        }
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Normal draw truncated to `[lo, hi]` by resampling, falling back to
    /// clamping after a bounded number of attempts.
    pub fn truncated_normal(&mut self, mean: f64, std_dev: f64, lo: f64, hi: f64) -> f64 {
        for _ in 0..32 {
            let draw = mean + std_dev * self.next_gaussian();
            if draw >= lo && draw <= hi {
                return draw;
            }
        }
        (mean).clamp(lo, hi)
    }

    /// Deterministic Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        if items.len() < 2 {
            return;
        }
        for i in (1..items.len()).rev() {
            let j = (self.next() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }

    /// Current internal state, for checkpoint-style reseeding.
    pub fn get_state(&self) -> u64 {
        self.state
    }
}
