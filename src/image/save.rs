//! Image saving utilities.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageBuffer, ImageFormat, Rgb, RgbImage};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

use super::ImageTensor;

/// Save a tensor as an image file.
///
/// The tensor is:
/// 1. Denormalized from [-1, 1] to [0, 255]
/// 2. Resized to the original dimensions if provided
/// 3. Written to a temporary file next to `path`, flushed, then renamed over it
///
/// Overwriting the input image is therefore safe: a failed encode or write leaves
/// the original untouched and no temporary file behind.
///
/// # Arguments
///
/// * `tensor` - NCHW tensor with values in [-1, 1]
/// * `path` - Output file path (format inferred from extension, PNG if unknown)
/// * `original_dims` - Optional original dimensions to resize to
/// * `quality` - JPEG quality (1-100), ignored for other formats
///
/// # Errors
///
/// Returns an error if the tensor is malformed or the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(
    tensor: &ImageTensor,
    path: P,
    original_dims: Option<(u32, u32)>,
    quality: u8,
) -> Result<()> {
    let path = path.as_ref();

    let img = DynamicImage::ImageRgb8(tensor_to_image(tensor)?);

    let final_img = match original_dims {
        Some((width, height)) if (width, height) != (img.width(), img.height()) => {
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        _ => img,
    };

    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    // Dropped (and deleted) on any early return
    let mut temp = NamedTempFile::new_in(dir)?;
    write_image(&final_img, temp.as_file_mut(), path, format, quality)?;

    temp.persist(path).map_err(|err| Error::Io(err.error))?;

    Ok(())
}

/// Encode into `file`, flushing so that write errors surface here.
/// `path` is the final destination, used for error reporting.
fn write_image(
    img: &DynamicImage,
    file: &mut File,
    path: &Path,
    format: ImageFormat,
    quality: u8,
) -> Result<()> {
    let map_err = |source| Error::ImageSave {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(file);
    if format == ImageFormat::Jpeg {
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
            .map_err(map_err)?;
    } else {
        img.write_to(&mut writer, format).map_err(map_err)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Convert a normalized NCHW tensor to an RGB image.
#[allow(clippy::cast_possible_truncation)]
fn tensor_to_image(tensor: &ImageTensor) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();

    if batch < 1 || channels != 3 {
        return Err(Error::ShapeMismatch {
            expected: "(1, 3, H, W) image tensor".to_string(),
            actual: format!("{:?}", tensor.shape()),
        });
    }

    // Safe: dimensions originate from a decoded image, so they fit in u32
    Ok(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = ((value + 1.0) * 127.5).round();
    scaled.clamp(0.0, 255.0) as u8
}
