//! Model resolution, caching and device selection.

mod device;
mod loader;

pub use device::{Device, ParseDeviceError};
pub use loader::{
    ModelCache, ModelFormat, ModelSource, ModelType, ParseFormatError, CLIP_TOKENIZER_REPO,
    DEFAULT_MODEL_REPO,
};
