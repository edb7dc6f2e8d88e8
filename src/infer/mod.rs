//! Text generation from prompts

use std::fmt;

use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::tokenizer::TokenCodec;

/// Decoding strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sample from the distribution; greedy decoding when false
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: 0.7,
            top_k: Some(50),
            top_p: Some(0.9),
            max_new_tokens: 64,
            seed: 299792458,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding with the same length limit
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            do_sample: false,
            max_new_tokens,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::config("max_new_tokens must be positive"));
        }
        if self.do_sample && !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::config(format!(
                "temperature must be positive when sampling, got {}",
                self.temperature
            )));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::config(format!("top_p must be in (0, 1], got {p}")));
            }
        }
        if self.top_k == Some(0) {
            return Err(Error::config("top_k must be positive when set"));
        }
        Ok(())
    }

    fn sampling(&self) -> Sampling {
        if !self.do_sample {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match (self.top_k, self.top_p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token was produced
    Stop,
    /// `max_new_tokens` reached
    Length,
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    prompt: String,
    continuation: String,
    tokens: Vec<u32>,
    finish_reason: FinishReason,
}

impl Generation {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Text generated after the prompt
    pub fn continuation(&self) -> &str {
        &self.continuation
    }

    /// Prompt followed by the continuation
    pub fn full_text(&self) -> String {
        format!("{}{}", self.prompt, self.continuation)
    }

    /// Generated token ids, excluding the stop token
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.continuation)
    }
}

/// Generates continuations with one model and codec
pub struct InferenceRunner<'a, M> {
    model: M,
    codec: &'a dyn TokenCodec,
    processor: LogitsProcessor,
    config: SamplingConfig,
    stop_tokens: Vec<u32>,
}

impl<'a, M: LanguageModel> InferenceRunner<'a, M> {
    pub fn new(model: M, codec: &'a dyn TokenCodec, config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        let processor = LogitsProcessor::from_sampling(config.seed, config.sampling());
        let stop_tokens = codec.stop_token_ids();
        if stop_tokens.is_empty() {
            debug!("Codec defines no stop tokens, generation runs to max_new_tokens");
        }
        Ok(Self {
            model,
            codec,
            processor,
            config,
            stop_tokens,
        })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Generate up to `max_new_tokens` after `prompt`
    pub fn generate(&mut self, prompt: &str) -> Result<Generation> {
        let prompt_ids = self.codec.encode(prompt)?;
        if prompt_ids.is_empty() {
            return Err(Error::data("prompt tokenized to an empty sequence"));
        }

        self.model.reset();
        let device = self.model.device().clone();
        let mut input = Tensor::new(prompt_ids.as_slice(), &device)?.unsqueeze(0)?;
        let mut offset = 0;
        let mut tokens = Vec::new();
        let mut finish_reason = FinishReason::Length;

        for _ in 0..self.config.max_new_tokens {
            let logits = self.model.forward(&input, offset)?.squeeze(0)?;
            offset += input.dim(1)?;
            let next = self.processor.sample(&logits)?;
            trace!(token = next, "Sampled");
            if self.stop_tokens.contains(&next) {
                finish_reason = FinishReason::Stop;
                break;
            }
            tokens.push(next);
            input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
        }

        let continuation = self.codec.decode(&tokens)?;
        debug!(
            prompt_tokens = prompt_ids.len(),
            generated = tokens.len(),
            ?finish_reason,
            "Generation finished"
        );
        Ok(Generation {
            prompt: prompt.to_string(),
            continuation,
            tokens,
            finish_reason,
        })
    }
}
