//! Image loading utilities.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{working_size, ImageTensor, RGB_CHANNELS};

/// Load an image from disk and convert to a normalized tensor.
///
/// The image is:
/// 1. Decoded from the specified path (format sniffed from the contents)
/// 2. Resized so both sides are multiples of 8
/// 3. Converted to RGB if necessary
/// 4. Normalized to [-1, 1] range
/// 5. Returned as NCHW tensor (1, 3, H, W) together with the original `(width, height)`
///
/// # Errors
///
/// Returns an error if the image cannot be loaded or is too small to process.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<(ImageTensor, (u32, u32))> {
    let path = path.as_ref();

    let img = image::ImageReader::open(path)
        .map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source: source.into(),
        })?
        .with_guessed_format()?
        .decode()
        .map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?;

    let original_dims = img.dimensions();
    let (width, height) = working_size(original_dims.0, original_dims.1)?;

    tracing::debug!(
        "Loaded {}x{} image, working at {width}x{height}",
        original_dims.0,
        original_dims.1
    );

    let tensor = image_to_tensor(&img, width, height);

    Ok((tensor, original_dims))
}

/// Convert a `DynamicImage` to a normalized NCHW tensor of the given size.
fn image_to_tensor(img: &DynamicImage, width: u32, height: u32) -> ImageTensor {
    let rgb = if img.dimensions() == (width, height) {
        img.to_rgb8()
    } else {
        img.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        // Normalize from [0, 255] to [-1, 1]
        tensor[[0, 0, y, x]] = (f32::from(pixel[0]) / 127.5) - 1.0;
        tensor[[0, 1, y, x]] = (f32::from(pixel[1]) / 127.5) - 1.0;
        tensor[[0, 2, y, x]] = (f32::from(pixel[2]) / 127.5) - 1.0;
    }

    tensor
}
