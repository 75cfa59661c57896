//! candle backend running the checkpoint's diffusers safetensors directly.

use candle_core::{DType, Device as CandleDevice, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use ndarray::{Array, Array3, Array4, Dimension};

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::{Device, ModelCache, ModelType};

use super::backend::EditModel;
use super::vae::{LatentTensor, VAE_SCALE};

/// Latent channels plus image-conditioning channels.
const UNET_IN_CHANNELS: usize = 8;

/// CLIP text model, VAE and 8-channel `UNet` built from SD 1.5 configs.
pub struct DiffusersModel {
    device: CandleDevice,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl DiffusersModel {
    /// Resolve the three weight files and build the networks on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be fetched, the weights do not match the
    /// SD 1.5 layout, or the device is unavailable.
    pub fn load(cache: &ModelCache, device: Device) -> Result<Self> {
        let clip_weights = cache.get_model_path(ModelType::TextEncoder)?;
        let vae_weights = cache.get_model_path(ModelType::VaeDecoder)?;
        let unet_weights = cache.get_model_path(ModelType::Unet)?;

        let device = device.candle_device()?;
        let config = StableDiffusionConfig::v1_5(None, None, None);
        let weights_err = |name: &str| {
            let name = name.to_string();
            move |source: candle_core::Error| Error::WeightsLoad { name, source }
        };

        tracing::info!("Loading text encoder...");
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, DType::F32)
                .map_err(weights_err("text_encoder"))?;

        tracing::info!("Loading VAE...");
        let vae = config
            .build_vae(vae_weights, &device, DType::F32)
            .map_err(weights_err("vae"))?;

        tracing::info!("Loading `UNet`...");
        let unet = config
            .build_unet(unet_weights, &device, UNET_IN_CHANNELS, false, DType::F32)
            .map_err(weights_err("unet"))?;

        Ok(Self {
            device,
            text_model,
            vae,
            unet,
        })
    }
}

impl EditModel for DiffusersModel {
    fn encode_text(&mut self, token_ids: &[u32]) -> Result<Array3<f32>> {
        let tokens = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;
        let hidden = self.text_model.forward(&tokens)?;
        to_array3(&hidden)
    }

    /// The VAE here only exposes a sample of its latent distribution. Its variance
    /// is tiny for this checkpoint, so the sample stands in for the mode.
    fn encode_image(&mut self, image: &ImageTensor) -> Result<LatentTensor> {
        let image = to_tensor(image, &self.device)?;
        let latents = self.vae.encode(&image)?.sample()?;
        to_array4(&latents)
    }

    fn predict_noise(
        &mut self,
        sample: Array4<f32>,
        timestep: f32,
        encoder_hidden_states: &Array3<f32>,
    ) -> Result<Array4<f32>> {
        let sample = to_tensor(&sample, &self.device)?;
        let hidden = to_tensor(encoder_hidden_states, &self.device)?;
        let noise_pred = self.unet.forward(&sample, f64::from(timestep), &hidden)?;
        to_array4(&noise_pred)
    }

    fn decode_latents(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
        let latents = to_tensor(latents, &self.device)?;
        let image = self.vae.decode(&(latents / f64::from(VAE_SCALE))?)?;
        to_array4(&image.clamp(-1f32, 1f32)?)
    }
}

/// Copy an ndarray array onto a candle device, keeping its logical shape.
fn to_tensor<D: Dimension>(array: &Array<f32, D>, device: &CandleDevice) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, array.shape(), device)?)
}

fn to_array3(tensor: &Tensor) -> Result<Array3<f32>> {
    let dims = tensor.dims3()?;
    Array3::from_shape_vec(dims, host_data(tensor)?).map_err(|err| Error::ShapeMismatch {
        expected: format!("{dims:?}"),
        actual: err.to_string(),
    })
}

fn to_array4(tensor: &Tensor) -> Result<Array4<f32>> {
    let dims = tensor.dims4()?;
    Array4::from_shape_vec(dims, host_data(tensor)?).map_err(|err| Error::ShapeMismatch {
        expected: format!("{dims:?}"),
        actual: err.to_string(),
    })
}

/// Row-major f32 copy of a tensor's contents on the host.
fn host_data(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_conversion_keeps_layout() {
        let array = Array::from_shape_fn((1, 2, 3, 4), |(n, c, h, w)| {
            (n * 100 + c * 12 + h * 4 + w) as f32
        });

        let tensor = to_tensor(&array, &CandleDevice::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 2, 3, 4]);
        assert_eq!(to_array4(&tensor).unwrap(), array);
    }

    #[test]
    fn test_conversion_from_transposed_view() {
        // Non-standard strides must come out in logical order
        let array = Array::from_shape_fn((2, 3, 4), |(a, b, c)| (a * 12 + b * 4 + c) as f32);
        let swapped = array.clone().permuted_axes([0, 2, 1]);

        let tensor = to_tensor(&swapped, &CandleDevice::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 4, 3]);
        assert_eq!(to_array3(&tensor).unwrap(), swapped);
    }

    #[test]
    fn test_rank_mismatch_is_an_error() {
        let tensor = Tensor::zeros((2, 3), DType::F32, &CandleDevice::Cpu).unwrap();
        assert!(matches!(to_array4(&tensor), Err(Error::Candle(_))));
    }
}
