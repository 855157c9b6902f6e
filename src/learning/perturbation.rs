//! Seeded perturbation directions.
//!
//! A zeroth-order step needs the same Gaussian direction `z` four times: to
//! step forward, to step back, to restore, and finally to apply the update.
//! Instead of storing `z` (one tensor per parameter, the size of the model)
//! we keep only the seed and regenerate the stream on demand.

use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::core::params::{ParameterSet, Tensor};

/// Upper bound (exclusive) for freshly sampled step seeds.
const SEED_RANGE: u64 = 1_000_000_000;

/// The only state needed to regenerate one step's noise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerturbationSeed(pub u64);

/// A deterministic stream of standard-normal tensors.
pub struct PerturbationStream {
    rng: StdRng,
}

impl PerturbationStream {
    pub fn new(seed: PerturbationSeed) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed.0),
        }
    }

    /// Next tensor of i.i.d. N(0, 1) entries with the given shape.
    pub fn next_tensor(&mut self, shape: &[usize]) -> Tensor {
        let rng = &mut self.rng;
        Tensor::from_shape_fn(IxDyn(shape), |_| rng.sample::<f32, _>(StandardNormal))
    }

    /// Next scalar N(0, 1) draw.
    pub fn next_scalar(&mut self) -> f32 {
        self.rng.sample(StandardNormal)
    }

    /// Materialise one tensor per shape.  Two calls with the same seed and
    /// shapes return bit-identical tensors.
    pub fn draw(seed: PerturbationSeed, shapes: &[&[usize]]) -> Vec<Tensor> {
        let mut stream = Self::new(seed);
        shapes.iter().map(|shape| stream.next_tensor(shape)).collect()
    }
}

/// `θ ← θ + scale·z` for every trainable parameter, in enumeration order.
///
/// `z` is generated one tensor at a time and dropped right after use.
pub fn perturb_parameters(params: &mut ParameterSet, seed: PerturbationSeed, scale: f32) {
    let mut stream = PerturbationStream::new(seed);
    for entry in params.trainable_mut() {
        let z = stream.next_tensor(entry.value.shape());
        entry.value.scaled_add(scale, &z);
    }
}

/// Source of fresh per-step seeds, itself seeded so that a run is repeatable.
pub struct SeedSource {
    rng: StdRng,
}

impl SeedSource {
    pub fn new(master_seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(master_seed),
        }
    }

    pub fn next_seed(&mut self) -> PerturbationSeed {
        PerturbationSeed(self.rng.gen_range(0..SEED_RANGE))
    }
}
