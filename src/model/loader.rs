//! Model resolution and loading utilities.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use ort::session::Session;
use thiserror::Error;

use crate::error::{Error as CrateError, Result};

use super::Device;

/// Checkpoint the editor is built around.
pub const DEFAULT_MODEL_REPO: &str = "timbrooks/instruct-pix2pix";

/// Repository providing the CLIP BPE tokenizer in `tokenizers` JSON form.
/// Shares its vocabulary with the CLIP ViT-L/14 text encoder of SD 1.x checkpoints.
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Format string that is neither `diffusers` nor `onnx`.
#[derive(Error, Debug)]
#[error("unknown model format '{0}', expected diffusers or onnx")]
pub struct ParseFormatError(String);

/// On-disk layout of the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelFormat {
    /// The checkpoint's own diffusers safetensors, run with candle.
    #[default]
    Diffusers,
    /// An optimum ONNX export, run with ONNX Runtime.
    Onnx,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diffusers => f.write_str("diffusers"),
            Self::Onnx => f.write_str("onnx"),
        }
    }
}

impl FromStr for ModelFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "diffusers" | "safetensors" => Ok(Self::Diffusers),
            "onnx" => Ok(Self::Onnx),
            _ => Err(ParseFormatError(s.to_string())),
        }
    }
}

/// Files that make up the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// CLIP tokenizer definition.
    Tokenizer,
    /// CLIP text encoder - turns token ids into hidden states.
    TextEncoder,
    /// VAE Encoder - encodes images to latent space.
    VaeEncoder,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
    /// `UNet` - predicts noise from 8-channel (latent + image) input.
    Unet,
}

impl ModelType {
    /// Path of this file inside a checkpoint of the given format.
    ///
    /// The diffusers layout keeps encoder and decoder in one VAE file.
    #[must_use]
    pub const fn relative_path(&self, format: ModelFormat) -> &'static str {
        match (format, self) {
            (_, Self::Tokenizer) => "tokenizer.json",
            (ModelFormat::Diffusers, Self::TextEncoder) => "text_encoder/model.safetensors",
            (ModelFormat::Diffusers, Self::VaeEncoder | Self::VaeDecoder) => {
                "vae/diffusion_pytorch_model.safetensors"
            }
            (ModelFormat::Diffusers, Self::Unet) => "unet/diffusion_pytorch_model.safetensors",
            (ModelFormat::Onnx, Self::TextEncoder) => "text_encoder/model.onnx",
            (ModelFormat::Onnx, Self::VaeEncoder) => "vae_encoder/model.onnx",
            (ModelFormat::Onnx, Self::VaeDecoder) => "vae_decoder/model.onnx",
            (ModelFormat::Onnx, Self::Unet) => "unet/model.onnx",
        }
    }

    /// External weights file stored next to the graph, if any.
    /// Must match the reference inside the ONNX file.
    #[must_use]
    pub const fn data_path(&self, format: ModelFormat) -> Option<&'static str> {
        match (format, self) {
            (ModelFormat::Onnx, Self::Unet) => Some("unet/model.onnx_data"),
            _ => None,
        }
    }
}

/// Where the checkpoint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A Hugging Face Hub repository.
    Hub { repo: String, revision: String },
    /// A local directory in the selected format's layout. Nothing is downloaded,
    /// except the tokenizer when the directory lacks one.
    Local(PathBuf),
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::Hub {
            repo: DEFAULT_MODEL_REPO.to_string(),
            revision: "main".to_string(),
        }
    }
}

/// Resolves model files through the Hugging Face cache or a local directory.
pub struct ModelCache {
    api: Api,
    source: ModelSource,
    format: ModelFormat,
}

impl ModelCache {
    /// Create a new model cache.
    ///
    /// Unless `cache_dir` is given, files land in the standard Hugging Face cache
    /// (`$HF_HOME/hub`, `~/.cache/huggingface/hub` by default), shared with other
    /// tools. `HF_TOKEN` is forwarded for gated or private repositories.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub client cannot be built.
    pub fn new(
        source: ModelSource,
        format: ModelFormat,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }

        let api = builder.build().map_err(|source| CrateError::ModelDownload {
            name: "hub client".to_string(),
            repo: "huggingface.co".to_string(),
            source,
        })?;

        Ok(Self {
            api,
            source,
            format,
        })
    }

    /// Get the path to a model file, downloading if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be downloaded, or is missing from a local directory.
    pub fn get_model_path(&self, model_type: ModelType) -> Result<PathBuf> {
        let relative = model_type.relative_path(self.format);
        let data = model_type.data_path(self.format);

        match &self.source {
            ModelSource::Local(dir) if model_type == ModelType::Tokenizer => {
                let candidates = [
                    dir.join("tokenizer.json"),
                    dir.join("tokenizer").join("tokenizer.json"),
                ];
                match candidates.into_iter().find(|p| p.exists()) {
                    Some(path) => Ok(path),
                    None => self.fetch(CLIP_TOKENIZER_REPO, "main", relative),
                }
            }
            ModelSource::Local(dir) => {
                let path = dir.join(relative);
                if !path.exists() {
                    return Err(CrateError::MissingModelFile { path });
                }
                if let Some(data) = data {
                    let data_path = dir.join(data);
                    if !data_path.exists() {
                        return Err(CrateError::MissingModelFile { path: data_path });
                    }
                }
                Ok(path)
            }
            ModelSource::Hub { .. } if model_type == ModelType::Tokenizer => {
                self.fetch(CLIP_TOKENIZER_REPO, "main", relative)
            }
            ModelSource::Hub { repo, revision } => {
                let path = self.fetch(repo, revision, relative)?;

                // External weights must sit beside the graph; the hub cache keeps
                // one snapshot directory per revision, so both land together
                if let Some(data) = data {
                    self.fetch(repo, revision, data)?;
                }

                Ok(path)
            }
        }
    }

    /// Resolve one file of a hub repository, downloading it on a cache miss.
    fn fetch(&self, repo: &str, revision: &str, file: &str) -> Result<PathBuf> {
        tracing::debug!("Resolving {file} from {repo}@{revision}");

        self.api
            .repo(Repo::with_revision(
                repo.to_string(),
                RepoType::Model,
                revision.to_string(),
            ))
            .get(file)
            .map_err(|source| CrateError::ModelDownload {
                name: file.to_string(),
                repo: repo.to_string(),
                source,
            })
    }

    /// Load an ONNX model session on the given device.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be fetched or loaded, or the device is unavailable.
    pub fn load_session(&self, model_type: ModelType, device: Device) -> Result<Session> {
        if self.format != ModelFormat::Onnx || model_type == ModelType::Tokenizer {
            return Err(CrateError::invalid(
                "model",
                format!("{model_type:?} is not an ONNX graph in the {} layout", self.format),
            ));
        }

        let path = self.get_model_path(model_type)?;
        let name = model_type.relative_path(self.format).to_string();

        tracing::debug!("Creating session for {} on {device}", path.display());

        Session::builder()
            .map_err(|source| CrateError::ModelLoad {
                name: name.clone(),
                source,
            })?
            .with_execution_providers(device.execution_providers())
            .map_err(|source| CrateError::ModelLoad {
                name: name.clone(),
                source: source.into(),
            })?
            .commit_from_file(&path)
            .map_err(|source| CrateError::ModelLoad { name, source })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;

    const COMMIT: &str = "6f4b8c1e0d2a9b7c3e5f1a2b4c6d8e0f1a3b5c7d";

    /// Lay out files the way the hub cache stores a downloaded revision.
    fn seed_hub_cache(cache: &Path, repo: &str, files: &[&str]) -> PathBuf {
        let repo_dir = cache.join(format!("models--{}", repo.replace('/', "--")));
        fs::create_dir_all(repo_dir.join("refs")).unwrap();
        fs::write(repo_dir.join("refs").join("main"), COMMIT).unwrap();

        let snapshot = repo_dir.join("snapshots").join(COMMIT);
        for file in files {
            let path = snapshot.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        snapshot
    }

    fn hub_cache(dir: &Path, format: ModelFormat) -> ModelCache {
        ModelCache::new(ModelSource::default(), format, Some(dir.to_path_buf())).unwrap()
    }

    #[test]
    fn test_default_checkpoint_files_are_diffusers_weights() {
        let format = ModelFormat::default();
        assert_eq!(format, ModelFormat::Diffusers);
        assert_eq!(
            ModelType::Unet.relative_path(format),
            "unet/diffusion_pytorch_model.safetensors"
        );
        assert_eq!(
            ModelType::VaeEncoder.relative_path(format),
            ModelType::VaeDecoder.relative_path(format)
        );
        assert!(ModelType::Unet.data_path(format).is_none());
    }

    #[test]
    fn test_cached_hub_file_resolves_offline() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = seed_hub_cache(
            dir.path(),
            DEFAULT_MODEL_REPO,
            &["unet/diffusion_pytorch_model.safetensors"],
        );

        let cache = hub_cache(dir.path(), ModelFormat::Diffusers);
        assert_eq!(
            cache.get_model_path(ModelType::Unet).unwrap(),
            snapshot.join("unet/diffusion_pytorch_model.safetensors")
        );
    }

    #[test]
    fn test_onnx_unet_graph_and_weights_are_separate_files() {
        let graph = ModelType::Unet.relative_path(ModelFormat::Onnx);
        let data = ModelType::Unet.data_path(ModelFormat::Onnx).unwrap();
        assert_ne!(graph, data);

        let dir = tempfile::tempdir().unwrap();
        let snapshot = seed_hub_cache(dir.path(), DEFAULT_MODEL_REPO, &[graph, data]);

        let cache = hub_cache(dir.path(), ModelFormat::Onnx);
        let resolved = cache.get_model_path(ModelType::Unet).unwrap();
        assert_eq!(resolved, snapshot.join(graph));
        assert_eq!(fs::read(snapshot.join(data)).unwrap(), data.as_bytes());

        let names: Vec<_> = fs::read_dir(snapshot.join("unet"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
    }

    #[test]
    fn test_hub_tokenizer_comes_from_clip_repo() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = seed_hub_cache(dir.path(), CLIP_TOKENIZER_REPO, &["tokenizer.json"]);

        let cache = hub_cache(dir.path(), ModelFormat::Diffusers);
        assert_eq!(
            cache.get_model_path(ModelType::Tokenizer).unwrap(),
            snapshot.join("tokenizer.json")
        );
    }

    #[test]
    fn test_local_source_requires_files() {
        let export = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(
            ModelSource::Local(export.path().to_path_buf()),
            ModelFormat::Onnx,
            Some(cache_dir.path().to_path_buf()),
        )
        .unwrap();

        let missing = cache.get_model_path(ModelType::TextEncoder);
        assert!(matches!(missing, Err(CrateError::MissingModelFile { .. })));

        // Graph present but external weights absent
        let unet = export.path().join("unet/model.onnx");
        fs::create_dir_all(unet.parent().unwrap()).unwrap();
        fs::write(&unet, b"graph").unwrap();
        match cache.get_model_path(ModelType::Unet) {
            Err(CrateError::MissingModelFile { path }) => {
                assert!(path.ends_with("model.onnx_data"));
            }
            other => panic!("expected missing data file, got {other:?}"),
        }

        fs::write(export.path().join("unet/model.onnx_data"), b"weights").unwrap();
        assert_eq!(cache.get_model_path(ModelType::Unet).unwrap(), unet);
    }

    #[test]
    fn test_local_tokenizer_preferred() {
        let export = tempfile::tempdir().unwrap();
        let tokenizer = export.path().join("tokenizer").join("tokenizer.json");
        fs::create_dir_all(tokenizer.parent().unwrap()).unwrap();
        fs::write(&tokenizer, b"{}").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(
            ModelSource::Local(export.path().to_path_buf()),
            ModelFormat::Diffusers,
            Some(cache_dir.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(cache.get_model_path(ModelType::Tokenizer).unwrap(), tokenizer);
    }

    #[test]
    fn test_sessions_need_onnx_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = hub_cache(dir.path(), ModelFormat::Diffusers);
        assert!(matches!(
            cache.load_session(ModelType::Unet, Device::Cpu),
            Err(CrateError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!("diffusers".parse::<ModelFormat>().unwrap(), ModelFormat::Diffusers);
        assert_eq!("ONNX".parse::<ModelFormat>().unwrap(), ModelFormat::Onnx);
        assert!("gguf".parse::<ModelFormat>().is_err());
        for format in [ModelFormat::Diffusers, ModelFormat::Onnx] {
            assert_eq!(format.to_string().parse::<ModelFormat>().unwrap(), format);
        }
    }
}
