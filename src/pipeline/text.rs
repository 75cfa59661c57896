//! CLIP prompt tokenization and text encoding.

use std::path::Path;

use ndarray::{concatenate, Array3, Axis};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

use super::backend::EditModel;

/// CLIP context length.
pub const MAX_TOKENS: usize = 77;

const END_OF_TEXT: &str = "<|endoftext|>";

/// CLIP BPE tokenizer producing fixed-length id sequences.
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    eos_id: u32,
    pad_id: u32,
}

impl PromptTokenizer {
    /// Load the tokenizer definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be parsed or lacks an end-of-text token.
    pub fn new(tokenizer_path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|err| Error::Tokenizer {
            reason: format!("loading {}: {err}", tokenizer_path.display()),
        })?;

        let eos_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| Error::Tokenizer {
                reason: format!("vocabulary has no {END_OF_TEXT} token"),
            })?;
        let pad_id = tokenizer.get_padding().map_or(eos_id, |p| p.pad_id);

        Ok(Self {
            tokenizer,
            eos_id,
            pad_id,
        })
    }

    /// Token ids for a prompt, truncated and padded to [`MAX_TOKENS`].
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization fails.
    pub fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|err| Error::Tokenizer {
                reason: err.to_string(),
            })?;

        Ok(fit_to_context(encoding.get_ids(), self.eos_id, self.pad_id))
    }

    /// Guidance batch of hidden states for `prompt`: `[prompt, "", ""]`.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or encoding fails.
    pub fn prompt_embeddings(
        &self,
        model: &mut dyn EditModel,
        prompt: &str,
    ) -> Result<Array3<f32>> {
        guidance_embeddings(model, &self.token_ids(prompt)?, &self.token_ids("")?)
    }
}

/// Encode both sequences and stack them as `[text, uncond, uncond]`.
fn guidance_embeddings(
    model: &mut dyn EditModel,
    prompt_ids: &[u32],
    uncond_ids: &[u32],
) -> Result<Array3<f32>> {
    let text = model.encode_text(prompt_ids)?;
    let uncond = model.encode_text(uncond_ids)?;

    tracing::debug!("Text embeddings shape: {:?}", text.shape());

    concatenate(Axis(0), &[text.view(), uncond.view(), uncond.view()]).map_err(|err| {
        Error::ShapeMismatch {
            expected: "stackable text embeddings".to_string(),
            actual: err.to_string(),
        }
    })
}

/// Truncate to the context length (keeping the closing end-of-text token) and pad.
fn fit_to_context(ids: &[u32], eos_id: u32, pad_id: u32) -> Vec<u32> {
    let mut tokens: Vec<u32> = ids.iter().copied().take(MAX_TOKENS).collect();

    if ids.len() > MAX_TOKENS {
        tokens[MAX_TOKENS - 1] = eos_id;
    }

    tokens.resize(MAX_TOKENS, pad_id);
    tokens
}
