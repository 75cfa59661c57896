//! Custom error types for instructedit.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the instructedit library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Image dimensions are not supported.
    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    UnsupportedDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Failed to fetch a model file from the Hugging Face Hub.
    #[error("failed to download {name} from {repo}: {source}")]
    ModelDownload {
        name: String,
        repo: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },

    /// A model file expected in a local model directory is absent.
    #[error("model file {path} not found in local model directory")]
    MissingModelFile { path: PathBuf },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// Failed to load the tokenizer or tokenize the prompt.
    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    /// Failed to load safetensors weights into a candle model.
    #[error("failed to load weights {name}: {source}")]
    WeightsLoad {
        name: String,
        #[source]
        source: candle_core::Error,
    },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Tensor operation on the candle backend failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for instructedit operations.
pub type Result<T> = std::result::Result<T, Error>;
