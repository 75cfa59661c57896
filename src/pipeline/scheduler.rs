//! Euler ancestral discrete scheduler, as shipped with the InstructPix2Pix checkpoint.
//!
//! Operates in sigma space: `x_t = x_0 + sigma_t * eps`. Each step takes a
//! deterministic Euler step down to `sigma_down` and re-injects `sigma_up` worth of
//! fresh noise.

use ndarray::Array4;

/// Number of timesteps the model was trained with.
const NUM_TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.000_85;
const BETA_END: f64 = 0.012;

/// Inference schedule for a fixed number of steps.
#[derive(Debug, Clone)]
pub struct EulerAncestralScheduler {
    timesteps: Vec<f32>,
    /// One entry per timestep plus a trailing zero.
    sigmas: Vec<f32>,
    init_noise_sigma: f32,
}

impl EulerAncestralScheduler {
    /// Build the schedule with `linspace` timestep spacing.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new(num_inference_steps: usize) -> Self {
        let train_sigmas = train_sigmas();
        let last = (NUM_TRAIN_TIMESTEPS - 1) as f64;

        // np.linspace(0, T - 1, n)[::-1]
        let timesteps: Vec<f64> = match num_inference_steps {
            0 => Vec::new(),
            1 => vec![0.0],
            n => (0..n)
                .map(|i| last * (n - 1 - i) as f64 / (n - 1) as f64)
                .collect(),
        };

        let mut sigmas: Vec<f32> = timesteps
            .iter()
            .map(|&t| interpolate(&train_sigmas, t) as f32)
            .collect();
        sigmas.push(0.0);

        let sigma_max = sigmas.iter().copied().fold(0.0_f32, f32::max);

        Self {
            timesteps: timesteps.into_iter().map(|t| t as f32).collect(),
            sigmas,
            init_noise_sigma: sigma_max.mul_add(sigma_max, 1.0).sqrt(),
        }
    }

    /// Number of denoising steps in the schedule.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    /// Whether the schedule has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// Model timestep for step `index`.
    #[must_use]
    pub fn timestep(&self, index: usize) -> f32 {
        self.timesteps[index]
    }

    /// Noise level at step `index`. `index == len()` gives the final zero.
    #[must_use]
    pub fn sigma(&self, index: usize) -> f32 {
        self.sigmas[index]
    }

    /// Standard deviation of the initial pure-noise latents.
    #[must_use]
    pub const fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    /// First step to run when denoising from the noised input image (SDEdit).
    ///
    /// Strength 1.0 runs the whole schedule, 0.0 runs nothing (returns `len()`).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn img2img_start_index(&self, strength: f32) -> usize {
        let steps = self.len();
        // Small epsilon so e.g. 0.7 * 30 lands on 21, not 20.999...
        let kept = (steps as f64 * f64::from(strength.clamp(0.0, 1.0)) + 1e-6).floor() as usize;
        steps - kept.min(steps)
    }

    /// Scale the denoising model input to unit variance.
    #[must_use]
    pub fn scale_model_input(&self, sample: &Array4<f32>, index: usize) -> Array4<f32> {
        let sigma = self.sigmas[index];
        sample / sigma.mul_add(sigma, 1.0).sqrt()
    }

    /// Advance `sample` from step `index` to `index + 1`.
    ///
    /// `model_output` is the (guided) epsilon prediction and `noise` a fresh
    /// N(0, 1) tensor of the same shape.
    #[must_use]
    pub fn step(
        &self,
        model_output: &Array4<f32>,
        index: usize,
        sample: &Array4<f32>,
        noise: &Array4<f32>,
    ) -> Array4<f32> {
        let sigma_from = self.sigmas[index];
        let sigma_to = self.sigmas[index + 1];

        let (sigma_up, sigma_down) = ancestral_sigmas(sigma_from, sigma_to);

        let pred_original = sample - &(model_output * sigma_from);
        let derivative = (sample - &pred_original) / sigma_from;
        let dt = sigma_down - sigma_from;

        let prev = sample + &(derivative * dt);
        prev + &(noise * sigma_up)
    }
}

/// Split the transition `sigma_from -> sigma_to` into a deterministic part and a noise part.
fn ancestral_sigmas(sigma_from: f32, sigma_to: f32) -> (f32, f32) {
    let from2 = sigma_from * sigma_from;
    let to2 = sigma_to * sigma_to;
    let sigma_up = (to2 * (from2 - to2) / from2).max(0.0).sqrt();
    let sigma_down = (to2 - sigma_up * sigma_up).max(0.0).sqrt();
    (sigma_up, sigma_down)
}

/// Per-timestep sigmas from the `scaled_linear` beta schedule.
#[allow(clippy::cast_precision_loss)]
fn train_sigmas() -> Vec<f64> {
    let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
    let last = (NUM_TRAIN_TIMESTEPS - 1) as f64;

    let mut alpha_cumprod = 1.0;
    (0..NUM_TRAIN_TIMESTEPS)
        .map(|i| {
            let beta = (end - start).mul_add(i as f64 / last, start).powi(2);
            alpha_cumprod *= 1.0 - beta;
            ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
        })
        .collect()
}

/// Linear interpolation of `values` (sampled at 0, 1, 2, ...) at position `t`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn interpolate(values: &[f64], t: f64) -> f64 {
    let t = t.clamp(0.0, (values.len() - 1) as f64);
    let lo = t.floor() as usize;
    let hi = (lo + 1).min(values.len() - 1);
    let w = t - lo as f64;
    values[lo].mul_add(1.0 - w, values[hi] * w)
}
