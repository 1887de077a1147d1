use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Randomness shared by weighted selection and self-healing.
///
/// A fixed seed makes every draw sequence reproducible.
#[derive(Debug, Clone)]
pub struct SharedRng(Arc<Mutex<StdRng>>);

impl SharedRng {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self(Arc::new(Mutex::new(rng)))
    }

    /// Uniform integer in `0..upper`. `upper` must be non-zero.
    pub fn below(&self, upper: u64) -> u64 {
        self.0.lock().gen_range(0..upper)
    }

    /// Bernoulli draw with probability `p`.
    pub fn chance(&self, p: f64) -> bool {
        let draw: f64 = self.0.lock().gen();
        draw < p
    }
}
