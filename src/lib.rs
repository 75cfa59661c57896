//! # instructedit
//!
//! Edit an image with a natural-language instruction using the InstructPix2Pix
//! diffusion model. The checkpoint's diffusers weights run on candle; an optimum
//! ONNX export can run on ONNX Runtime instead.
//!
//! The model is conditioned on both the instruction and the input image, so the
//! result keeps the layout of the original while applying the requested change.
//!
//! ## Example
//!
//! ```no_run
//! use instructedit::{Config, Pipeline};
//!
//! # fn main() -> instructedit::Result<()> {
//! let config = Config {
//!     prompt: "make it snow".to_string(),
//!     ..Config::default()
//! };
//! let mut pipeline = Pipeline::new(config)?;
//!
//! // Overwrites the file with the edited image.
//! pipeline.process("images.jpeg", "images.jpeg")?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use model::{Device, ModelFormat, ModelSource};
pub use pipeline::{Config, Pipeline};
