//! Image loading, processing, and saving utilities.

mod load;
mod save;

pub use load::load_image;
pub use save::save_image;

use ndarray::Array4;

use crate::error::{Error, Result};

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1] range for diffusion model compatibility.
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Spatial downscale factor between pixel space and VAE latent space.
pub const LATENT_SCALE_FACTOR: u32 = 8;

/// Compute the size the diffusion model works at for an image of the given size.
///
/// Both sides are rounded down to a multiple of [`LATENT_SCALE_FACTOR`].
///
/// # Errors
///
/// Returns an error if either side is smaller than one latent pixel.
pub fn working_size(width: u32, height: u32) -> Result<(u32, u32)> {
    if width < LATENT_SCALE_FACTOR || height < LATENT_SCALE_FACTOR {
        return Err(Error::UnsupportedDimensions {
            width,
            height,
            reason: format!("both sides must be at least {LATENT_SCALE_FACTOR} pixels"),
        });
    }

    Ok((
        width - width % LATENT_SCALE_FACTOR,
        height - height % LATENT_SCALE_FACTOR,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_size_rounds_down() {
        assert_eq!(working_size(512, 512).unwrap(), (512, 512));
        assert_eq!(working_size(275, 183).unwrap(), (272, 176));
        assert_eq!(working_size(8, 15).unwrap(), (8, 8));
    }

    #[test]
    fn test_working_size_too_small() {
        assert!(matches!(
            working_size(7, 100),
            Err(Error::UnsupportedDimensions { width: 7, .. })
        ));
        assert!(working_size(100, 0).is_err());
    }
}
