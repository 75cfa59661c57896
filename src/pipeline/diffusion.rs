//! Main diffusion pipeline for instruction-guided editing.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array3, Axis};

use crate::error::{Error, Result};
use crate::image;
use crate::model::{Device, ModelCache, ModelFormat, ModelSource, ModelType};

use super::backend::EditModel;
use super::diffusers::DiffusersModel;
use super::guidance;
use super::noise::NoiseSource;
use super::onnx::OnnxModel;
use super::scheduler::EulerAncestralScheduler;
use super::text::PromptTokenizer;
use super::vae::{LatentTensor, VAE_SCALE};

/// Instruction applied when none is given.
pub const DEFAULT_PROMPT: &str = "Add a modern wooden deck and glass railing";

/// Configuration for the editing pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Natural-language edit instruction.
    pub prompt: String,

    /// Fraction of the noise schedule to run (0.0-1.0). Only consulted when
    /// `denoise_from_input` is set; InstructPix2Pix itself ignores it.
    pub strength: f32,

    /// Start from the input latents noised to `strength` (SDEdit) instead of
    /// from pure noise.
    pub denoise_from_input: bool,

    /// How strongly the edit follows the instruction.
    pub guidance_scale: f32,

    /// How strongly the edit stays close to the input image.
    pub image_guidance_scale: f32,

    /// Number of denoising steps.
    pub num_steps: u32,

    /// Output JPEG quality (1-100).
    pub output_quality: u8,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,

    /// Device the models run on.
    pub device: Device,

    /// Where the checkpoint is fetched from.
    pub model: ModelSource,

    /// Layout of the checkpoint files, which also picks the runtime.
    pub format: ModelFormat,

    /// Override for the model cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            strength: 0.7,
            denoise_from_input: false,
            guidance_scale: 9.0,
            image_guidance_scale: 1.5,
            num_steps: 30,
            output_quality: 75,
            seed: None,
            device: Device::default(),
            model: ModelSource::default(),
            format: ModelFormat::default(),
            cache_dir: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(Error::invalid("strength", "must be between 0.0 and 1.0"));
        }

        for (name, value) in [
            ("guidance_scale", self.guidance_scale),
            ("image_guidance_scale", self.image_guidance_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::invalid(name, "must be a finite value >= 0.0"));
            }
        }

        if self.num_steps == 0 {
            return Err(Error::invalid("num_steps", "must be greater than 0"));
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::invalid("output_quality", "must be between 1 and 100"));
        }

        Ok(())
    }

    /// Schedule index denoising starts from.
    #[must_use]
    pub fn start_index(&self, scheduler: &EulerAncestralScheduler) -> usize {
        if self.denoise_from_input {
            scheduler.img2img_start_index(self.strength)
        } else {
            0
        }
    }
}

/// Pipeline holding the tokenizer and the loaded networks.
pub struct Pipeline {
    config: Config,
    tokenizer: PromptTokenizer,
    model: Box<dyn EditModel>,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration.
    ///
    /// This will download models if they are not already cached.
    ///
    /// # Errors
    ///
    /// Returns an error if models cannot be loaded or the device is unavailable.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");

        let cache = ModelCache::new(config.model.clone(), config.format, config.cache_dir.clone())?;
        let device = config.device;

        let tokenizer_path = cache.get_model_path(ModelType::Tokenizer)?;

        let model: Box<dyn EditModel> = match config.format {
            ModelFormat::Diffusers => Box::new(DiffusersModel::load(&cache, device)?),
            ModelFormat::Onnx => Box::new(OnnxModel::load(&cache, device)?),
        };

        let tokenizer = PromptTokenizer::new(&tokenizer_path)?;

        tracing::info!("Pipeline initialized on {device} ({} weights)", config.format);

        Ok(Self {
            config,
            tokenizer,
            model,
        })
    }

    /// Configuration the pipeline was built with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Edit an image according to the configured instruction.
    ///
    /// `output_path` may equal `input_path`, in which case the input is replaced.
    ///
    /// # Arguments
    ///
    /// * `input_path` - Path to the input image
    /// * `output_path` - Path to save the edited image
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails.
    pub fn process<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        input_path: P,
        output_path: Q,
    ) -> Result<()> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        tracing::info!("Processing image: {}", input_path.display());

        // Load image
        let (image_tensor, original_dims) = image::load_image(input_path)?;

        tracing::info!("Encoding instruction: {:?}", self.config.prompt);
        let prompt_embeds = self
            .tokenizer
            .prompt_embeddings(self.model.as_mut(), &self.config.prompt)?;

        tracing::info!("Encoding to latent space...");
        let image_latents = self.model.encode_image(&image_tensor)?;

        tracing::info!("Running diffusion...");
        let latents = denoise(
            self.model.as_mut(),
            &self.config,
            &image_latents,
            &prompt_embeds,
        )?;

        tracing::info!("Decoding from latent space...");
        let output_tensor = self.model.decode_latents(&latents)?;

        tracing::info!("Saving output to: {}", output_path.display());
        image::save_image(
            &output_tensor,
            output_path,
            Some(original_dims),
            self.config.output_quality,
        )?;

        tracing::info!("Processing complete");
        Ok(())
    }
}

/// Latents the loop starts from at schedule index `start`.
///
/// Index 0 is pure noise at `init_noise_sigma`. Later indices noise the scaled
/// image latents to that step's sigma. `None` when no steps remain.
fn initial_latents(
    scheduler: &EulerAncestralScheduler,
    start: usize,
    image_latents: &LatentTensor,
    noise: &mut NoiseSource,
) -> Option<LatentTensor> {
    let shape = image_latents.dim();

    if start >= scheduler.len() {
        None
    } else if start == 0 {
        Some(noise.tensor(shape) * scheduler.init_noise_sigma())
    } else {
        Some(image_latents * VAE_SCALE + noise.tensor(shape) * scheduler.sigma(start))
    }
}

/// Run the guided denoising loop, returning scaled latents.
fn denoise(
    model: &mut dyn EditModel,
    config: &Config,
    image_latents: &LatentTensor,
    prompt_embeds: &Array3<f32>,
) -> Result<LatentTensor> {
    let scheduler = EulerAncestralScheduler::new(config.num_steps as usize);
    let mut noise = NoiseSource::new(config.seed);

    if !config.denoise_from_input {
        tracing::debug!("Strength {} unused without denoise_from_input", config.strength);
    }

    let start = config.start_index(&scheduler);
    let shape = image_latents.dim();

    let Some(mut latents) = initial_latents(&scheduler, start, image_latents, &mut noise) else {
        tracing::warn!(
            "Strength {} leaves no denoising steps, output is a VAE round-trip",
            config.strength
        );
        return Ok(image_latents * VAE_SCALE);
    };

    let image_cond = guidance::image_conditioning(image_latents)?;

    // Progress bar for denoising
    let pb = ProgressBar::new((scheduler.len() - start) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    for index in start..scheduler.len() {
        let timestep = scheduler.timestep(index);
        tracing::debug!(
            "Step {index}: timestep {timestep:.2}, sigma {:.4}",
            scheduler.sigma(index)
        );

        let batched = guidance::repeat_batch(&latents)?;
        let scaled = scheduler.scale_model_input(&batched, index);
        let model_input = concatenate(Axis(1), &[scaled.view(), image_cond.view()]).map_err(
            |err| Error::ShapeMismatch {
                expected: "latents and image conditioning of equal size".to_string(),
                actual: err.to_string(),
            },
        )?;

        let noise_pred = model.predict_noise(model_input, timestep, prompt_embeds)?;
        let guided = guidance::combine(
            &noise_pred,
            config.guidance_scale,
            config.image_guidance_scale,
        )?;

        latents = scheduler.step(&guided, index, &latents, &noise.tensor(shape));

        pb.inc(1);
    }

    pb.finish_with_message("Denoising complete");
    Ok(latents)
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array4};

    use super::*;
    use crate::image::ImageTensor;

    /// Records every `UNet` call and predicts zero noise.
    #[derive(Default)]
    struct RecordingModel {
        timesteps: Vec<f32>,
        samples: Vec<Array4<f32>>,
    }

    impl EditModel for RecordingModel {
        fn encode_text(&mut self, _token_ids: &[u32]) -> Result<Array3<f32>> {
            Ok(Array3::zeros((1, 77, 8)))
        }

        fn encode_image(&mut self, _image: &ImageTensor) -> Result<LatentTensor> {
            unimplemented!("latents are supplied directly")
        }

        fn predict_noise(
            &mut self,
            sample: Array4<f32>,
            timestep: f32,
            _encoder_hidden_states: &Array3<f32>,
        ) -> Result<Array4<f32>> {
            let (batch, _, height, width) = sample.dim();
            self.timesteps.push(timestep);
            self.samples.push(sample);
            Ok(Array4::zeros((batch, 4, height, width)))
        }

        fn decode_latents(&mut self, _latents: &LatentTensor) -> Result<ImageTensor> {
            unimplemented!("latents are inspected directly")
        }
    }

    fn image_latents() -> LatentTensor {
        Array4::from_elem((1, 4, 16, 16), 2.0)
    }

    fn seeded(config: Config) -> Config {
        Config {
            seed: Some(7),
            ..config
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn std_dev(values: &Array4<f32>) -> f32 {
        let n = values.len() as f32;
        let mean = values.sum() / n;
        (values.mapv(|v| (v - mean).powi(2)).sum() / n).sqrt()
    }

    #[test]
    fn test_defaults_match_reference_run() {
        let config = Config::default();

        assert_eq!(config.prompt, "Add a modern wooden deck and glass railing");
        assert!((config.strength - 0.7).abs() < f32::EPSILON);
        assert!(!config.denoise_from_input);
        assert!((config.guidance_scale - 9.0).abs() < f32::EPSILON);
        assert!((config.image_guidance_scale - 1.5).abs() < f32::EPSILON);
        assert_eq!(config.num_steps, 30);
        assert_eq!(config.output_quality, 75);
        assert_eq!(config.device, Device::Cuda(0));
        assert_eq!(config.format, ModelFormat::Diffusers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_run_starts_from_pure_noise() {
        let scheduler = EulerAncestralScheduler::new(30);

        // Strength 0.7 is accepted but does not shorten the schedule
        assert_eq!(Config::default().start_index(&scheduler), 0);

        let img2img = Config {
            denoise_from_input: true,
            ..Config::default()
        };
        assert_eq!(img2img.start_index(&scheduler), 9);
    }

    #[test]
    fn test_initial_latents_at_start_are_scaled_noise() {
        let scheduler = EulerAncestralScheduler::new(30);
        let mut noise = NoiseSource::new(Some(3));

        let latents = initial_latents(&scheduler, 0, &image_latents(), &mut noise).unwrap();

        assert_eq!(latents.dim(), (1, 4, 16, 16));
        let ratio = std_dev(&latents) / scheduler.init_noise_sigma();
        assert!((0.85..1.15).contains(&ratio), "ratio {ratio}");
        // No trace of the image latents
        assert!(latents.mean().unwrap().abs() < 2.0);
    }

    #[test]
    fn test_initial_latents_midway_noise_scaled_image() {
        let scheduler = EulerAncestralScheduler::new(30);
        let mut noise = NoiseSource::new(Some(3));
        let start = 9;

        let latents = initial_latents(&scheduler, start, &image_latents(), &mut noise).unwrap();

        let residual = latents.mapv(|v| v - 2.0 * VAE_SCALE);
        let ratio = std_dev(&residual) / scheduler.sigma(start);
        assert!((0.85..1.15).contains(&ratio), "ratio {ratio}");
        let mean_error = residual.mean().unwrap().abs() / scheduler.sigma(start);
        assert!(mean_error < 0.2, "mean error {mean_error}");
    }

    #[test]
    fn test_initial_latents_none_when_no_steps_remain() {
        let scheduler = EulerAncestralScheduler::new(30);
        let mut noise = NoiseSource::new(Some(3));

        assert!(initial_latents(&scheduler, 30, &image_latents(), &mut noise).is_none());
    }

    #[test]
    fn test_default_denoise_runs_full_schedule() {
        let mut model = RecordingModel::default();
        let config = seeded(Config::default());
        let embeds = Array3::zeros((3, 77, 8));

        let latents = denoise(&mut model, &config, &image_latents(), &embeds).unwrap();

        assert_eq!(model.timesteps.len(), 30);
        assert!((model.timesteps[0] - 999.0).abs() < 1e-3);
        assert!(model.timesteps[29].abs() < 1e-3);
        assert!(model.timesteps.windows(2).all(|w| w[0] > w[1]));
        assert!(latents.iter().all(|v| v.is_finite()));

        // First input: unit-variance noise, image conditioning [img, img, 0]
        let first = &model.samples[0];
        assert_eq!(first.dim(), (3, 8, 16, 16));
        let noisy = first.slice(s![0..1, ..4, .., ..]).to_owned();
        let spread = std_dev(&noisy);
        assert!((0.85..1.15).contains(&spread), "spread {spread}");
        assert!(first.slice(s![0..2, 4.., .., ..]).iter().all(|&v| v == 2.0));
        assert!(first.slice(s![2, 4.., .., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_strength_ignored_without_opt_in() {
        let mut model = RecordingModel::default();
        let config = seeded(Config {
            strength: 0.0,
            ..Config::default()
        });

        denoise(&mut model, &config, &image_latents(), &Array3::zeros((3, 77, 8))).unwrap();
        assert_eq!(model.timesteps.len(), 30);
    }

    #[test]
    fn test_denoise_from_input_skips_early_steps() {
        let mut model = RecordingModel::default();
        let config = seeded(Config {
            denoise_from_input: true,
            ..Config::default()
        });

        denoise(&mut model, &config, &image_latents(), &Array3::zeros((3, 77, 8))).unwrap();

        let scheduler = EulerAncestralScheduler::new(30);
        assert_eq!(model.timesteps.len(), 21);
        assert!((model.timesteps[0] - scheduler.timestep(9)).abs() < 1e-3);
    }

    #[test]
    fn test_zero_strength_round_trips_image_latents() {
        let mut model = RecordingModel::default();
        let config = seeded(Config {
            denoise_from_input: true,
            strength: 0.0,
            ..Config::default()
        });
        let image = image_latents();

        let latents = denoise(&mut model, &config, &image, &Array3::zeros((3, 77, 8))).unwrap();

        assert!(model.timesteps.is_empty());
        // The decoder divides by the same factor
        let unscaled = latents / VAE_SCALE;
        assert!(unscaled.iter().zip(image.iter()).all(|(a, b)| (a - b).abs() < 1e-5));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases = [
            Config {
                strength: 1.5,
                ..Config::default()
            },
            Config {
                strength: -0.1,
                ..Config::default()
            },
            Config {
                guidance_scale: f32::NAN,
                ..Config::default()
            },
            Config {
                image_guidance_scale: -1.0,
                ..Config::default()
            },
            Config {
                num_steps: 0,
                ..Config::default()
            },
            Config {
                output_quality: 0,
                ..Config::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(Error::InvalidParameter { .. })),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_accepts_edges() {
        let config = Config {
            prompt: String::new(),
            strength: 0.0,
            guidance_scale: 0.0,
            image_guidance_scale: 0.0,
            num_steps: 1,
            output_quality: 100,
            ..Config::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_fails_before_loading_models() {
        let config = Config {
            num_steps: 0,
            model: ModelSource::Local(PathBuf::from("/nonexistent/export")),
            ..Config::default()
        };

        assert!(matches!(
            Pipeline::new(config),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_missing_local_weights_are_reported() {
        let checkpoint = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(checkpoint.path().join("tokenizer.json"), b"{}").unwrap();

        for format in [ModelFormat::Diffusers, ModelFormat::Onnx] {
            let config = Config {
                device: Device::Cpu,
                model: ModelSource::Local(checkpoint.path().to_path_buf()),
                format,
                cache_dir: Some(cache.path().to_path_buf()),
                ..Config::default()
            };

            assert!(
                matches!(Pipeline::new(config), Err(Error::MissingModelFile { .. })),
                "{format} checkpoint without weights should be rejected"
            );
        }
    }
}
