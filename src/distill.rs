//! Logit-matching distillation from a teacher into a pruned student
//!
//! The teacher is frozen; each step runs both models on the same token batch
//! and minimises the mean squared error between their logits at every
//! position.

use std::time::Instant;

use candle_core::{Device, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::tokenizer::TokenCodec;
use crate::training::LoraModel;

/// Distillation hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistillConfig {
    /// Run the distill stage as part of a full pipeline run
    pub enabled: bool,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    /// Sequences are truncated to this many tokens
    pub max_seq_len: usize,
    /// Use only the first N training prompts
    pub num_samples: Option<usize>,
    pub logging_interval: usize,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            epochs: 3,
            learning_rate: 1e-5,
            weight_decay: 0.0,
            batch_size: 4,
            max_seq_len: 128,
            num_samples: Some(256),
            logging_interval: 10,
        }
    }
}

impl DistillConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("distill epochs must be positive"));
        }
        if self.batch_size == 0 || self.max_seq_len == 0 {
            return Err(Error::config(
                "distill batch_size and max_seq_len must be positive",
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config("distill learning_rate must be positive"));
        }
        if self.logging_interval == 0 {
            return Err(Error::config("distill logging_interval must be positive"));
        }
        Ok(())
    }
}

/// Loss trajectory of a distillation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillReport {
    pub steps: usize,
    pub epochs: usize,
    pub losses: Vec<f32>,
    pub elapsed_secs: f64,
}

impl DistillReport {
    pub fn first_loss(&self) -> Option<f32> {
        self.losses.first().copied()
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// Mean squared error between student and teacher logits
pub fn logits_mse(student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
    if student.dims() != teacher.dims() {
        return Err(Error::data(format!(
            "student logits {:?} and teacher logits {:?} differ in shape",
            student.dims(),
            teacher.dims()
        )));
    }
    Ok(candle_nn::loss::mse(student, teacher)?)
}

/// Logit MSE of `student` against `teacher` over every position of `batch`
///
/// The teacher's logits are detached, so gradients only reach the student.
pub fn batch_loss<S, T>(student: &mut S, teacher: &mut T, batch: &Tensor) -> Result<Tensor>
where
    S: LanguageModel,
    T: LanguageModel,
{
    teacher.reset();
    let target = teacher.forward_all(batch, 0)?.detach();
    student.reset();
    let predicted = student.forward_all(batch, 0)?;
    logits_mse(&predicted, &target)
}

/// Encode `texts` into `(batch, len)` id tensors
///
/// Each text is cut to `max_seq_len` tokens, then every batch is cut to its
/// shortest member so rows stack without padding.
pub fn token_batches(
    codec: &dyn TokenCodec,
    texts: &[String],
    batch_size: usize,
    max_seq_len: usize,
    device: &Device,
) -> Result<Vec<Tensor>> {
    if batch_size == 0 || max_seq_len == 0 {
        return Err(Error::config("batch_size and max_seq_len must be positive"));
    }
    let mut encoded = Vec::with_capacity(texts.len());
    for text in texts {
        let mut ids = codec.encode(text)?;
        if ids.is_empty() {
            return Err(Error::data(format!("text {text:?} tokenized to nothing")));
        }
        ids.truncate(max_seq_len);
        encoded.push(ids);
    }

    encoded
        .chunks(batch_size)
        .map(|chunk| {
            let len = chunk.iter().map(Vec::len).min().unwrap_or(0);
            let rows = chunk
                .iter()
                .map(|ids| Tensor::new(&ids[..len], device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::stack(&rows, 0)?)
        })
        .collect()
}

/// Runs logit-matching epochs over token batches
#[derive(Debug, Clone)]
pub struct Distiller {
    config: DistillConfig,
}

impl Distiller {
    pub fn new(config: DistillConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    /// AdamW over the student's factors with the configured rate
    pub fn optimizer(&self, student: &LoraModel) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        Ok(AdamW::new(student.vars(), params)?)
    }

    /// Adjust `student` toward `teacher` on `batches`
    ///
    /// Only the student's factors receive updates; teacher outputs are
    /// detached. Pruned entries are not re-masked, so they may become nonzero.
    #[instrument(skip_all, fields(batches = batches.len(), epochs = self.config.epochs))]
    pub fn distill<T: LanguageModel, O: Optimizer>(
        &self,
        student: &LoraModel,
        teacher: &mut T,
        batches: &[Tensor],
        optimizer: &mut O,
    ) -> Result<DistillReport> {
        if batches.is_empty() {
            return Err(Error::data("no batches to distill on"));
        }
        let started = Instant::now();
        let mut losses = Vec::new();
        let mut step = 0usize;

        for epoch in 0..self.config.epochs {
            let mut epoch_loss = 0f32;
            for batch in batches {
                let mut runnable = student.runnable(0.0)?;
                let loss = batch_loss(&mut runnable, teacher, batch)?;
                optimizer.backward_step(&loss)?;

                let value = loss.to_scalar::<f32>()?;
                losses.push(value);
                epoch_loss += value;
                step += 1;
                if step % self.config.logging_interval == 0 {
                    debug!(step, epoch = epoch + 1, loss = value, "Distill step");
                }
            }
            info!(
                epoch = epoch + 1,
                mean_loss = epoch_loss / batches.len() as f32,
                "Distill epoch complete"
            );
        }

        Ok(DistillReport {
            steps: step,
            epochs: self.config.epochs,
            losses,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }
}
