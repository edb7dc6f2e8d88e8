//! Tokenizer integration
//!
//! The pipeline only needs text ↔ id conversion and a few special-token lookups,
//! so it talks to tokenizers through the small [`TokenCodec`] trait.

use std::path::Path;

use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::prompt::{END_OF_TURN, EOS};

/// Text encoder/decoder used by training, inference and distillation
pub trait TokenCodec: Send + Sync {
    /// Encode text to token ids without adding special tokens
    ///
    /// Prompts already spell out their markers, so nothing is prepended here.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids, dropping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Look up the id of a token string
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Ids that end generation
    fn stop_token_ids(&self) -> Vec<u32> {
        [EOS, END_OF_TURN]
            .iter()
            .filter_map(|t| self.token_to_id(t))
            .collect()
    }
}

/// HuggingFace `tokenizer.json` backed codec
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    /// Wrap an already constructed tokenizer
    pub fn new(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Load from a `tokenizer.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            Error::artifact(format!("failed to load tokenizer {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Tokenizer loaded");
        Ok(Self::new(inner))
    }

    /// Load from a local model directory or a hub model id
    pub async fn from_pretrained(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id).join("tokenizer.json");
        if local.exists() {
            return Self::from_file(local);
        }

        info!("Loading tokenizer from HuggingFace Hub: {}", model_id);
        let api = Api::new()?;
        let path = api.model(model_id.to_string()).get("tokenizer.json").await?;
        Self::from_file(path)
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::tokenizer(format!("decode failed: {e}")))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}
