//! Variational Autoencoder operations for encoding/decoding images.

use ndarray::{s, Array4};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::tensor::{extract_array, missing_output};

/// Latent tensor type (N, 4, H/8, W/8).
pub type LatentTensor = Array4<f32>;

/// VAE scaling factor (from Stable Diffusion).
pub const VAE_SCALE: f32 = 0.18215;

/// Channels in the VAE latent space.
pub const LATENT_CHANNELS: usize = 4;

/// Encode an image to latent space using the VAE encoder.
///
/// Returns the mode of the latent distribution, unscaled. The edit model takes
/// these latents directly as image conditioning.
///
/// Exports that emit the full distribution parameters (mean and log-variance,
/// 8 channels) are reduced to the mean.
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn encode(encoder: &mut Session, image: &ImageTensor) -> Result<LatentTensor> {
    let input_value =
        Tensor::from_array(image.clone()).map_err(|source| Error::Inference { source })?;

    let outputs = encoder
        .run(ort::inputs![input_value])
        .map_err(|source| Error::Inference { source })?;

    let output = outputs
        .values()
        .next()
        .ok_or_else(|| missing_output("latent"))?;

    let latent = extract_array::<ndarray::Ix4>(&output)?;
    distribution_mode(latent)
}

/// Reduce encoder output to its 4-channel mean.
fn distribution_mode(latent: Array4<f32>) -> Result<LatentTensor> {
    match latent.shape()[1] {
        LATENT_CHANNELS => Ok(latent),
        channels if channels == 2 * LATENT_CHANNELS => {
            Ok(latent.slice(s![.., ..LATENT_CHANNELS, .., ..]).to_owned())
        }
        channels => Err(Error::ShapeMismatch {
            expected: format!("{LATENT_CHANNELS} or {} latent channels", 2 * LATENT_CHANNELS),
            actual: format!("{channels} channels"),
        }),
    }
}

/// Decode latents back to image space using the VAE decoder.
///
/// # Arguments
///
/// * `decoder` - ONNX session for the VAE decoder
/// * `latent` - Scaled latent tensor in NCHW format (1, 4, H/8, W/8)
///
/// # Returns
///
/// Image tensor in NCHW format with values in [-1, 1].
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn decode(decoder: &mut Session, latent: &LatentTensor) -> Result<ImageTensor> {
    // Unscale latents
    let unscaled = latent / VAE_SCALE;

    let input_value = Tensor::from_array(unscaled).map_err(|source| Error::Inference { source })?;

    let outputs = decoder
        .run(ort::inputs![input_value])
        .map_err(|source| Error::Inference { source })?;

    let output = outputs
        .values()
        .next()
        .ok_or_else(|| missing_output("sample"))?;

    let image = extract_array::<ndarray::Ix4>(&output)?;
    Ok(image.mapv(|v| v.clamp(-1.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_of_four_channels_is_identity() {
        let latent = Array4::<f32>::from_elem((1, 4, 8, 8), 0.3);
        assert_eq!(distribution_mode(latent.clone()).unwrap(), latent);
    }

    #[test]
    fn test_mode_takes_mean_of_parameters() {
        let mut params = Array4::<f32>::zeros((1, 8, 8, 8));
        params.slice_mut(s![.., ..4, .., ..]).fill(1.0);
        params.slice_mut(s![.., 4.., .., ..]).fill(-7.0);

        let mode = distribution_mode(params).unwrap();
        assert_eq!(mode.shape(), &[1, 4, 8, 8]);
        assert!(mode.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_mode_rejects_unknown_layout() {
        let latent = Array4::<f32>::zeros((1, 3, 8, 8));
        assert!(distribution_mode(latent).is_err());
    }
}
