//! Conversions between ONNX Runtime values and ndarray arrays.

use ndarray::{Array, ArrayD, Dimension, IxDyn};

use crate::error::{Error, Result};

/// Extract an f32 array of a fixed rank from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn extract_array<D: Dimension>(value: &ort::value::ValueRef<'_>) -> Result<Array<f32, D>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    if let Some(rank) = D::NDIM {
        if dims.len() != rank {
            return Err(Error::ShapeMismatch {
                expected: format!("{rank}D tensor"),
                actual: format!("{}D tensor", dims.len()),
            });
        }
    }

    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())
        .and_then(|array| array.into_dimensionality::<D>())
        .map_err(|_| Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        })
}

/// Error for a session that produced no outputs.
pub fn missing_output(what: &str) -> Error {
    Error::ShapeMismatch {
        expected: format!("{what} output"),
        actual: "no output".to_string(),
    }
}
