//! Seeded Gaussian noise for latent initialization and ancestral sampling.

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Standard-normal sample source using the Box-Muller transform.
///
/// Box-Muller yields values in pairs, the second is kept for the next call.
pub struct NoiseSource {
    rng: StdRng,
    spare: Option<f32>,
}

impl NoiseSource {
    /// Create a noise source, seeded for reproducibility or from the OS otherwise.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self { rng, spare: None }
    }

    /// Draw one sample from N(0, 1).
    #[allow(clippy::cast_possible_truncation)]
    pub fn standard_normal(&mut self) -> f32 {
        if let Some(value) = self.spare.take() {
            return value;
        }

        // 1 - u keeps the log argument in (0, 1]
        let u1 = 1.0 - self.rng.random::<f64>();
        let u2 = self.rng.random::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = std::f64::consts::TAU * u2;

        self.spare = Some((radius * theta.sin()) as f32);
        (radius * theta.cos()) as f32
    }

    /// Fill a tensor of the given shape with N(0, 1) samples.
    pub fn tensor(&mut self, shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_simple_fn(shape, || self.standard_normal())
    }
}
