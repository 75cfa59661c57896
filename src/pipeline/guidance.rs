//! Classifier-free guidance over text and image conditioning.
//!
//! The `UNet` is run on a batch of three: `[text + image, image only, neither]`.
//! The guided prediction pulls away from the image-only branch toward the
//! instruction, and away from the unconditional branch toward the input image.

use ndarray::{concatenate, s, Array4, Axis};

use crate::error::{Error, Result};

use super::vae::LatentTensor;

/// Batch size of one guided `UNet` call.
pub const GUIDANCE_BATCH: usize = 3;

/// Stack `latents` three times along the batch axis.
///
/// # Errors
///
/// Returns an error if the input does not have a batch of one.
pub fn repeat_batch(latents: &LatentTensor) -> Result<LatentTensor> {
    if latents.shape()[0] != 1 {
        return Err(Error::ShapeMismatch {
            expected: "batch of 1".to_string(),
            actual: format!("{:?}", latents.shape()),
        });
    }

    let view = latents.view();
    concatenate(Axis(0), &[view, view, view]).map_err(|err| Error::ShapeMismatch {
        expected: "stackable latents".to_string(),
        actual: err.to_string(),
    })
}

/// Image conditioning batch `[image, image, zeros]`, matching the guidance layout.
///
/// # Errors
///
/// Returns an error if the input does not have a batch of one.
pub fn image_conditioning(image_latents: &LatentTensor) -> Result<LatentTensor> {
    let mut batch = repeat_batch(image_latents)?;
    batch.slice_mut(s![2.., .., .., ..]).fill(0.0);
    Ok(batch)
}

/// Combine a batched noise prediction into one guided prediction.
///
/// `uncond + guidance_scale * (text - image) + image_guidance_scale * (image - uncond)`
///
/// # Errors
///
/// Returns an error if `noise_pred` does not have a batch of three.
pub fn combine(
    noise_pred: &Array4<f32>,
    guidance_scale: f32,
    image_guidance_scale: f32,
) -> Result<LatentTensor> {
    if noise_pred.shape()[0] != GUIDANCE_BATCH {
        return Err(Error::ShapeMismatch {
            expected: format!("batch of {GUIDANCE_BATCH} noise predictions"),
            actual: format!("{:?}", noise_pred.shape()),
        });
    }

    let text = noise_pred.slice(s![0..1, .., .., ..]);
    let image = noise_pred.slice(s![1..2, .., .., ..]);
    let uncond = noise_pred.slice(s![2..3, .., .., ..]);

    let text_guidance = (&text - &image) * guidance_scale;
    let image_guidance = (&image - &uncond) * image_guidance_scale;

    Ok(&uncond + &text_guidance + &image_guidance)
}
