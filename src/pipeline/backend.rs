//! The networks an edit needs, independent of the runtime executing them.

use ndarray::{Array3, Array4};

use crate::error::Result;
use crate::image::ImageTensor;

use super::vae::LatentTensor;

/// Text encoder, VAE and `UNet` of an InstructPix2Pix checkpoint.
///
/// Shapes are NCHW. Latents passed to [`predict_noise`](Self::predict_noise) and
/// [`decode_latents`](Self::decode_latents) are in the scaled (`× 0.18215`) space the
/// scheduler works in; [`encode_image`](Self::encode_image) returns unscaled latents,
/// which is what the `UNet` expects as image conditioning.
pub trait EditModel {
    /// Hidden states `(1, 77, hidden)` for one padded token sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn encode_text(&mut self, token_ids: &[u32]) -> Result<Array3<f32>>;

    /// Latents `(1, 4, H/8, W/8)` for an image in `[-1, 1]`, unscaled.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn encode_image(&mut self, image: &ImageTensor) -> Result<LatentTensor>;

    /// Noise prediction for the 3-way guidance batch `(3, 8, h, w)`.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn predict_noise(
        &mut self,
        sample: Array4<f32>,
        timestep: f32,
        encoder_hidden_states: &Array3<f32>,
    ) -> Result<Array4<f32>>;

    /// Image in `[-1, 1]` for scaled latents.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn decode_latents(&mut self, latents: &LatentTensor) -> Result<ImageTensor>;
}
