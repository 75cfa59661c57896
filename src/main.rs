//! instructedit CLI - edit an image in place with a text instruction.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use instructedit::pipeline::DEFAULT_PROMPT;
use instructedit::{Config, Device, ModelFormat, ModelSource, Pipeline};

/// Edit an image with a natural-language instruction using InstructPix2Pix.
///
/// With no arguments, edits `images.jpeg` in the current directory and overwrites it.
#[derive(Parser, Debug)]
#[command(name = "instructedit")]
#[command(version, about, long_about = None)]
struct Args {
    /// Image to edit.
    #[arg(value_name = "IMAGE", default_value = "images.jpeg")]
    input: PathBuf,

    /// Where to write the edited image. Defaults to overwriting IMAGE.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Edit instruction.
    #[arg(short, long, default_value = DEFAULT_PROMPT, value_name = "TEXT")]
    prompt: String,

    /// Fraction of the noise schedule to run (0.0-1.0). Only used with
    /// --denoise-from-input; InstructPix2Pix ignores it otherwise.
    #[arg(short, long, default_value = "0.7", value_name = "FLOAT")]
    strength: f32,

    /// Start from the input image noised to --strength instead of pure noise.
    #[arg(long)]
    denoise_from_input: bool,

    /// How closely to follow the instruction.
    #[arg(short, long, default_value = "9.0", value_name = "FLOAT")]
    guidance_scale: f32,

    /// How closely to stay with the input image.
    #[arg(long, default_value = "1.5", value_name = "FLOAT")]
    image_guidance_scale: f32,

    /// Number of denoising steps.
    #[arg(long, default_value = "30", value_name = "INT")]
    steps: u32,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "75", value_name = "INT")]
    quality: u8,

    /// Random seed for reproducibility.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Compute device: cpu, cuda or cuda:N.
    #[arg(long, default_value = "cuda:0", value_name = "DEVICE")]
    device: Device,

    /// Hugging Face repository holding the checkpoint.
    #[arg(long, default_value = instructedit::model::DEFAULT_MODEL_REPO, value_name = "REPO")]
    model_repo: String,

    /// Repository revision (branch, tag or commit).
    #[arg(long, default_value = "main", value_name = "REV")]
    revision: String,

    /// Local checkpoint directory to use instead of downloading.
    #[arg(long, value_name = "DIR", conflicts_with = "model_repo")]
    model_dir: Option<PathBuf>,

    /// Checkpoint layout: diffusers (safetensors, candle) or onnx (optimum export).
    #[arg(long, default_value = "diffusers", value_name = "FORMAT")]
    format: ModelFormat,

    /// Hugging Face cache directory (default: $HF_HOME/hub).
    #[arg(long, env = "INSTRUCTEDIT_CACHE_DIR", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("instructedit={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<()> {
    let output = args.output.clone().unwrap_or_else(|| args.input.clone());

    let model = match args.model_dir {
        Some(dir) => ModelSource::Local(dir),
        None => ModelSource::Hub {
            repo: args.model_repo,
            revision: args.revision,
        },
    };

    // Build configuration
    let config = Config {
        prompt: args.prompt,
        strength: args.strength,
        denoise_from_input: args.denoise_from_input,
        guidance_scale: args.guidance_scale,
        image_guidance_scale: args.image_guidance_scale,
        num_steps: args.steps,
        output_quality: args.quality,
        seed: args.seed,
        device: args.device,
        model,
        format: args.format,
        cache_dir: args.cache_dir,
    };

    // Create and run pipeline
    let mut pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;

    pipeline
        .process(&args.input, &output)
        .context("Failed to process image")?;

    println!(
        "Successfully edited {} -> {}",
        args.input.display(),
        output.display()
    );

    Ok(())
}
