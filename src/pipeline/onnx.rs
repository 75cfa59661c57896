//! ONNX Runtime backend for optimum exports of the checkpoint.

use ndarray::{Array1, Array2, Array3, Array4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::model::{Device, ModelCache, ModelType};

use super::backend::EditModel;
use super::tensor::{extract_array, missing_output};
use super::text::MAX_TOKENS;
use super::vae::{self, LatentTensor};

/// Element type an export declares for an integer-or-float input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Int32,
    Int64,
    Float32,
}

impl InputKind {
    const fn from_element(ty: TensorElementType) -> Option<Self> {
        match ty {
            TensorElementType::Int32 => Some(Self::Int32),
            TensorElementType::Int64 => Some(Self::Int64),
            TensorElementType::Float32 => Some(Self::Float32),
            _ => None,
        }
    }

    /// Declared type of the named session input, or `fallback` when the graph
    /// does not name it or uses a type we cannot feed.
    fn of_input(session: &Session, name: &str, fallback: Self) -> Self {
        session
            .inputs
            .iter()
            .find(|input| input.name == name)
            .and_then(|input| match &input.input_type {
                ValueType::Tensor { ty, .. } => Self::from_element(*ty),
                _ => None,
            })
            .unwrap_or(fallback)
    }

    /// One-element tensor holding `value`, rounded for integer inputs.
    #[allow(clippy::cast_possible_truncation)]
    fn scalar(self, value: f32) -> Result<DynValue> {
        let rounded = round_timestep(value);
        match self {
            Self::Int32 => Tensor::from_array(Array1::from_vec(vec![rounded as i32]))
                .map(|tensor| tensor.into_dyn()),
            Self::Int64 => {
                Tensor::from_array(Array1::from_vec(vec![rounded])).map(|tensor| tensor.into_dyn())
            }
            Self::Float32 => {
                Tensor::from_array(Array1::from_vec(vec![value])).map(|tensor| tensor.into_dyn())
            }
        }
        .map_err(|source| Error::Inference { source })
    }

    /// `(1, len)` tensor of token ids.
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    fn token_ids(self, ids: &[u32]) -> Result<DynValue> {
        let shape = (1, ids.len());
        let shape_err = |err: ndarray::ShapeError| Error::ShapeMismatch {
            expected: format!("{MAX_TOKENS} token ids"),
            actual: err.to_string(),
        };

        match self {
            Self::Int32 => {
                let ids = ids.iter().map(|&id| id as i32).collect();
                let array = Array2::from_shape_vec(shape, ids).map_err(shape_err)?;
                Tensor::from_array(array).map(|tensor| tensor.into_dyn())
            }
            Self::Int64 => {
                let ids = ids.iter().map(|&id| i64::from(id)).collect();
                let array = Array2::from_shape_vec(shape, ids).map_err(shape_err)?;
                Tensor::from_array(array).map(|tensor| tensor.into_dyn())
            }
            Self::Float32 => {
                let ids = ids.iter().map(|&id| id as f32).collect();
                let array = Array2::from_shape_vec(shape, ids).map_err(shape_err)?;
                Tensor::from_array(array).map(|tensor| tensor.into_dyn())
            }
        }
        .map_err(|source| Error::Inference { source })
    }
}

/// Integer timestep for exports traced with `int64` input.
#[allow(clippy::cast_possible_truncation)]
fn round_timestep(timestep: f32) -> i64 {
    timestep.round() as i64
}

/// Text encoder, VAE encoder/decoder and `UNet` sessions.
pub struct OnnxModel {
    text_encoder: Session,
    vae_encoder: Session,
    vae_decoder: Session,
    unet: Session,
    input_ids_kind: InputKind,
    timestep_kind: InputKind,
}

impl OnnxModel {
    /// Load all four sessions on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a graph cannot be fetched or loaded, or the device is unavailable.
    pub fn load(cache: &ModelCache, device: Device) -> Result<Self> {
        tracing::info!("Loading text encoder...");
        let text_encoder = cache.load_session(ModelType::TextEncoder, device)?;

        tracing::info!("Loading VAE encoder...");
        let vae_encoder = cache.load_session(ModelType::VaeEncoder, device)?;

        tracing::info!("Loading VAE decoder...");
        let vae_decoder = cache.load_session(ModelType::VaeDecoder, device)?;

        tracing::info!("Loading `UNet`...");
        let unet = cache.load_session(ModelType::Unet, device)?;

        let input_ids_kind = InputKind::of_input(&text_encoder, "input_ids", InputKind::Int32);
        let timestep_kind = InputKind::of_input(&unet, "timestep", InputKind::Int64);
        tracing::debug!("Export input types: input_ids {input_ids_kind:?}, timestep {timestep_kind:?}");

        Ok(Self {
            text_encoder,
            vae_encoder,
            vae_decoder,
            unet,
            input_ids_kind,
            timestep_kind,
        })
    }
}

impl EditModel for OnnxModel {
    fn encode_text(&mut self, token_ids: &[u32]) -> Result<Array3<f32>> {
        let input_value = self.input_ids_kind.token_ids(token_ids)?;

        let outputs = self
            .text_encoder
            .run(ort::inputs!["input_ids" => input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("last_hidden_state"))?;

        extract_array::<ndarray::Ix3>(&output)
    }

    fn encode_image(&mut self, image: &ImageTensor) -> Result<LatentTensor> {
        vae::encode(&mut self.vae_encoder, image)
    }

    fn predict_noise(
        &mut self,
        sample: Array4<f32>,
        timestep: f32,
        encoder_hidden_states: &Array3<f32>,
    ) -> Result<Array4<f32>> {
        let sample_value = Tensor::from_array(sample).map_err(|source| Error::Inference { source })?;
        let timestep_value = self.timestep_kind.scalar(timestep)?;
        let hidden_value = Tensor::from_array(encoder_hidden_states.clone())
            .map_err(|source| Error::Inference { source })?;

        let outputs = self
            .unet
            .run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("noise prediction"))?;

        extract_array::<ndarray::Ix4>(&output)
    }

    fn decode_latents(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
        vae::decode(&mut self.vae_decoder, latents)
    }
}
