use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::ml::NodeValue;

use super::cell::MutexCell;

/// Sample source for weight initialisation and batch shuffling.
///
/// Clones share one generator, so a network built and a loader shuffled from
/// the same strategy draw from a single sequence.
#[derive(Clone)]
pub struct RngStrategy {
    seed: Option<u32>,
    generator: Arc<MutexCell<StdRng>>,
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self {
            seed: None,
            generator: Arc::new(MutexCell::new(StdRng::from_entropy())),
        }
    }
}

impl RngStrategy {
    /// Reproducible sequence for a fixed seed.
    pub fn testable(seed: u32) -> Self {
        Self {
            seed: Some(seed),
            generator: Arc::new(MutexCell::new(StdRng::seed_from_u64(seed as u64))),
        }
    }

    pub fn from_seed(seed: Option<u32>) -> Self {
        match seed {
            Some(seed) => Self::testable(seed),
            None => Self::default(),
        }
    }

    pub fn seed(&self) -> Option<u32> {
        self.seed
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seed.is_some()
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.generator.with_inner(|rng| rng.gen())
    }

    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        self.generator.with_inner(|rng| rng.gen_range(min..exclusive_max))
    }
}

impl ShuffleRng for RngStrategy {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>) {
        self.generator.with_inner(|rng| vec.shuffle(rng))
    }
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.seed {
            Some(seed) => f.debug_struct("Seeded").field("seed", &seed).finish(),
            None => write!(f, "Entropy"),
        }
    }
}

pub trait RNG {
    /// Uniform sample in `[0, 1)`.
    fn rand(&self) -> NodeValue;
    /// Uniform index in `min..exclusive_max`.
    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize;
}

pub trait ShuffleRng {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>);
}
