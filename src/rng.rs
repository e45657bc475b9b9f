//! Injectable randomness for the broker's stochastic model.
//!
//! Slippage and broker-rejection draws go through [`RandomSource`] so a
//! backtest is reproducible from its seed and tests can pin every draw.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of the uniform draws used by the broker.
pub trait RandomSource: Send {
    /// Uniform draw in `[low, high]`. Returns `low` when the range is empty.
    fn uniform(&mut self, low: f64, high: f64) -> f64;

    /// Bernoulli draw: true with probability `probability`.
    fn chance(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.uniform(0.0, 1.0) < probability
    }
}

/// Seeded `StdRng`, the default source for backtests and paper trading.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    seed: u64,
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomSource for SeededRandom {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if !(high > low) {
            return low;
        }
        self.rng.gen_range(low..=high)
    }
}

/// Deterministic source returning the same relative position in every range.
///
/// `uniform(low, high)` yields `low + fraction * (high - low)` and
/// `chance(p)` is true iff `fraction < p`.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    fraction: f64,
}

impl FixedRandom {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    /// Always the low end of every range. Any positive probability fires.
    pub fn lowest() -> Self {
        Self { fraction: 0.0 }
    }

    /// Always the high end of every range. Only certain events fire.
    pub fn highest() -> Self {
        Self { fraction: 1.0 }
    }
}

impl RandomSource for FixedRandom {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if !(high > low) {
            return low;
        }
        low + self.fraction * (high - low)
    }

    fn chance(&mut self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        probability > 0.0 && self.fraction < probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_draws_are_reproducible() {
        let mut a = SeededRandom::new(7);
        let mut b = SeededRandom::new(7);
        for _ in 0..16 {
            assert_eq!(a.uniform(0.0, 3.0), b.uniform(0.0, 3.0));
        }
    }

    #[test]
    fn seeded_draws_stay_in_range() {
        let mut rng = SeededRandom::new(99);
        for _ in 0..1_000 {
            let x = rng.uniform(0.2, 0.8);
            assert!((0.2..=0.8).contains(&x));
        }
    }

    #[test]
    fn empty_range_returns_low() {
        let mut rng = SeededRandom::new(1);
        assert_eq!(rng.uniform(0.5, 0.5), 0.5);
        assert_eq!(FixedRandom::highest().uniform(2.0, 1.0), 2.0);
    }

    #[test]
    fn fixed_source_positions() {
        assert_eq!(FixedRandom::lowest().uniform(1.0, 3.0), 1.0);
        assert_eq!(FixedRandom::highest().uniform(1.0, 3.0), 3.0);
        assert_eq!(FixedRandom::new(0.5).uniform(1.0, 3.0), 2.0);
    }

    #[test]
    fn chance_edges() {
        let mut rng = SeededRandom::new(3);
        assert!(!rng.chance(0.0));
        assert!(rng.chance(1.0));
        assert!(!FixedRandom::lowest().chance(0.0));
        assert!(FixedRandom::lowest().chance(0.01));
        assert!(!FixedRandom::highest().chance(0.99));
    }
}
