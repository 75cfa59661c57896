//! Instruction-guided image editing pipeline.

mod backend;
mod diffusers;
mod diffusion;
mod guidance;
mod noise;
mod onnx;
mod scheduler;
mod tensor;
mod text;
mod vae;

pub use backend::EditModel;
pub use diffusers::DiffusersModel;
pub use diffusion::{Config, Pipeline, DEFAULT_PROMPT};
pub use onnx::OnnxModel;
pub use scheduler::EulerAncestralScheduler;
pub use text::PromptTokenizer;
pub use vae::{LatentTensor, VAE_SCALE};
