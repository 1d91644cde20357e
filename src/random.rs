//! Injectable randomness. Everything stochastic in the simulator (reward
//! bonus, peer counts, hash rates, bot behaviour, id suffixes) draws from a
//! [`RandomSource`] so tests can pin it.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub trait RandomSource: Send + Sync {
    /// Uniform draw in `[0, 1)`.
    fn unit(&self) -> f64;

    /// Lowercase base36 string of `len` characters.
    fn token(&self, len: usize) -> String;

    /// Uniform draw in `[low, high)`.
    fn range_f64(&self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.unit()
    }

    /// Uniform integer in `[low, high)`; returns `low` for an empty range.
    fn range_u64(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let span = (high - low) as f64;
        low + ((self.unit() * span) as u64).min(high - low - 1)
    }

    fn chance(&self, probability: f64) -> bool {
        self.unit() < probability
    }
}

/// Thread-local OS-seeded generator; the default for live sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn token(&self, len: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    }
}

/// Deterministic generator for reproducible runs.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn unit(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    fn token(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (0..len)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    }
}

/// Returns the same `unit()` value forever; tokens still vary.
pub struct PinnedRandom {
    unit: f64,
    tokens: SeededRandom,
}

impl PinnedRandom {
    pub fn new(unit: f64) -> Self {
        Self {
            unit: unit.clamp(0.0, 0.999_999),
            tokens: SeededRandom::new(0x5eed),
        }
    }

    /// Pins every uniform draw to zero, so bonus factors collapse to 1.0.
    pub fn zero() -> Self {
        Self::new(0.0)
    }
}

impl RandomSource for PinnedRandom {
    fn unit(&self) -> f64 {
        self.unit
    }

    fn token(&self, len: usize) -> String {
        self.tokens.token(len)
    }
}
