//! Supervised LoRA fine-tuning
//!
//! The trainer renders each labeled example into the chat template, then
//! minimises next-token cross-entropy over the completion (label plus closing
//! markers). Only the adapter factors are optimised; the base weights stay
//! frozen and may be quantized.
//!
//! Each example is scored in one teacher-forced pass over the prompt and all
//! but the last completion token.

pub mod lora_model;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::corpus::Example;
use crate::error::{Error, Result};
use crate::lora::{Adapter, LoraConfig};
use crate::model::{BaseModel, LanguageModel};
use crate::prompt::PromptFormatter;
use crate::tokenizer::TokenCodec;

pub use lora_model::LoraModel;
pub use scheduler::LinearScheduler;

/// Optimisation hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    /// Stop after this many optimizer steps, overriding `num_epochs`
    pub max_steps: Option<usize>,
    /// Examples per micro-batch
    pub batch_size: usize,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    pub warmup_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Run forward passes in f16 instead of f32
    pub use_fp16: bool,
    /// Log every N optimizer steps
    pub logging_interval: usize,
    /// Prompts longer than this keep only their trailing tokens
    pub max_seq_len: Option<usize>,
    pub seed: u64,
    /// Where `trainer_state.json` is written
    pub output_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            max_steps: None,
            batch_size: 8,
            gradient_accumulation_steps: 2,
            warmup_steps: 100,
            learning_rate: 2e-4,
            weight_decay: 0.0,
            use_fp16: true,
            logging_interval: 10,
            max_seq_len: None,
            seed: 42,
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Error::config("gradient_accumulation_steps must be positive"));
        }
        if self.num_epochs == 0 && self.max_steps.is_none() {
            return Err(Error::config("num_epochs must be positive"));
        }
        if self.max_steps == Some(0) {
            return Err(Error::config("max_steps must be positive when set"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must not be negative"));
        }
        if self.logging_interval == 0 {
            return Err(Error::config("logging_interval must be positive"));
        }
        Ok(())
    }

    pub fn compute_dtype(&self) -> DType {
        if self.use_fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    /// Optimizer steps for `num_examples` examples
    pub fn total_steps(&self, num_examples: usize) -> usize {
        let micro_batches = num_examples.div_ceil(self.batch_size);
        let per_epoch = micro_batches.div_ceil(self.gradient_accumulation_steps);
        let by_epochs = per_epoch * self.num_epochs.max(1);
        self.max_steps.unwrap_or(by_epochs)
    }
}

/// One logged point of the loss curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
}

/// Summary of a finished run, persisted as `trainer_state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub global_step: usize,
    pub epochs_completed: usize,
    pub num_examples: usize,
    pub trainable_parameters: usize,
    pub final_loss: Option<f64>,
    pub log_history: Vec<LogEntry>,
    pub elapsed_secs: f64,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl TrainingReport {
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join("trainer_state.json"),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

/// Token ids of a rendered training example
#[derive(Debug, Clone)]
struct TokenizedExample {
    prompt: Vec<u32>,
    completion: Vec<u32>,
}

/// Trains a fresh adapter on labeled examples
pub struct AdapterTrainer {
    lora: LoraConfig,
    config: TrainingConfig,
    formatter: PromptFormatter,
}

impl AdapterTrainer {
    /// Validates both configurations up front
    pub fn new(lora: LoraConfig, config: TrainingConfig) -> Result<Self> {
        lora.validate()?;
        config.validate()?;
        Ok(Self {
            lora,
            config,
            formatter: PromptFormatter::default(),
        })
    }

    pub fn with_formatter(mut self, formatter: PromptFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train an adapter on `examples` over the frozen `base`
    ///
    /// Every example must carry a label. The base model is not modified.
    #[instrument(skip_all, fields(base = base.id(), examples = examples.len()))]
    pub fn train(
        &self,
        base: &BaseModel,
        examples: &[Example],
        codec: &dyn TokenCodec,
    ) -> Result<(Adapter, TrainingReport)> {
        if examples.is_empty() {
            return Err(Error::data("training set is empty"));
        }
        let tokenized = examples
            .iter()
            .map(|ex| self.tokenize(ex, codec))
            .collect::<Result<Vec<_>>>()?;

        let dtype = self.config.compute_dtype();
        let model = LoraModel::init(base, &self.lora, dtype, self.config.seed)?;
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(model.vars(), params)?;

        let total_steps = self.config.total_steps(tokenized.len());
        let mut scheduler = LinearScheduler::new(
            self.config.learning_rate,
            0.0,
            total_steps,
            self.config.warmup_steps,
        );
        let accum = self.config.gradient_accumulation_steps;
        let micro_per_epoch = tokenized.len().div_ceil(self.config.batch_size);

        info!(
            trainable = model.num_trainable(),
            total_steps,
            batch_size = self.config.batch_size,
            accum,
            ?dtype,
            "Starting adapter training"
        );

        let started = Instant::now();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..tokenized.len()).collect();
        let mut log_history = Vec::new();
        let mut window_loss = 0.0;
        let mut window_micro = 0usize;
        let mut last_loss = None;
        let mut epochs_completed = 0;

        'epochs: for epoch in 0.. {
            if scheduler.is_done() {
                break;
            }
            order.shuffle(&mut rng);
            let mut pending: Option<GradStore> = None;
            let mut pending_micro = 0usize;

            for (i, chunk) in order.chunks(self.config.batch_size).enumerate() {
                let mut runnable = model.runnable(self.lora.dropout)?;
                let mut batch_loss: Option<Tensor> = None;
                for &idx in chunk {
                    let loss = completion_loss(&mut runnable, &tokenized[idx])?;
                    batch_loss = Some(match batch_loss {
                        Some(acc) => (acc + loss)?,
                        None => loss,
                    });
                }
                let Some(batch_loss) = batch_loss else {
                    continue;
                };
                let mean = (batch_loss / chunk.len() as f64)?;
                let loss_value = f64::from(mean.to_dtype(DType::F32)?.to_scalar::<f32>()?);
                if !loss_value.is_finite() {
                    warn!(epoch, micro_batch = i, "Non-finite training loss");
                }
                window_loss += loss_value;
                window_micro += 1;

                let grads = (mean / accum as f64)?.backward().map_err(device_error)?;
                pending = Some(match pending {
                    Some(acc) => sum_grads(acc, grads, &model)?,
                    None => grads,
                });
                pending_micro += 1;

                let last_in_epoch = i + 1 == micro_per_epoch;
                if pending_micro < accum && !last_in_epoch {
                    continue;
                }
                if let Some(grads) = pending.take() {
                    optimizer.set_learning_rate(scheduler.lr());
                    optimizer.step(&grads)?;
                }
                pending_micro = 0;
                scheduler.step();

                let step = scheduler.current_step();
                let avg = window_loss / window_micro.max(1) as f64;
                last_loss = Some(avg);
                if step % self.config.logging_interval == 0 || scheduler.is_done() {
                    let entry = LogEntry {
                        step,
                        epoch: epoch as f64 + (i + 1) as f64 / micro_per_epoch as f64,
                        loss: avg,
                        learning_rate: optimizer.learning_rate(),
                    };
                    info!(
                        step,
                        epoch = entry.epoch,
                        loss = format!("{avg:.4}"),
                        lr = format!("{:.2e}", entry.learning_rate),
                        "Training progress"
                    );
                    log_history.push(entry);
                    window_loss = 0.0;
                    window_micro = 0;
                }
                if scheduler.is_done() {
                    epochs_completed = epoch + usize::from(last_in_epoch);
                    break 'epochs;
                }
            }
            epochs_completed = epoch + 1;
            debug!(epoch = epoch + 1, "Epoch finished");
        }

        let report = TrainingReport {
            global_step: scheduler.current_step(),
            epochs_completed,
            num_examples: tokenized.len(),
            trainable_parameters: model.num_trainable(),
            final_loss: last_loss,
            log_history,
            elapsed_secs: started.elapsed().as_secs_f64(),
            finished_at: chrono::Utc::now(),
        };
        report.save(&self.config.output_dir)?;
        info!(
            steps = report.global_step,
            final_loss = ?report.final_loss,
            elapsed = format!("{:.1}s", report.elapsed_secs),
            "Training completed"
        );

        Ok((model.to_adapter()?, report))
    }

    fn tokenize(&self, example: &Example, codec: &dyn TokenCodec) -> Result<TokenizedExample> {
        let label = example.require_label()?;
        let mut prompt = codec.encode(&self.formatter.render_inference(example.sentence()))?;
        let completion = codec.encode(&PromptFormatter::completion(label))?;
        if prompt.is_empty() || completion.is_empty() {
            return Err(Error::data(format!(
                "example {:?} tokenized to an empty sequence",
                example.sentence()
            )));
        }
        if let Some(max) = self.config.max_seq_len {
            let budget = max.saturating_sub(completion.len()).max(1);
            if prompt.len() > budget {
                prompt.drain(..prompt.len() - budget);
            }
        }
        Ok(TokenizedExample { prompt, completion })
    }
}

/// Mean cross-entropy of the completion tokens given the prompt
///
/// One teacher-forced pass over `prompt ++ completion[..n-1]`; position `p`
/// predicts token `p + 1`, so the completion is scored by the last `n` rows.
fn completion_loss(model: &mut impl LanguageModel, example: &TokenizedExample) -> Result<Tensor> {
    model.reset();
    let device = model.device().clone();
    let n = example.completion.len();

    let mut ids = example.prompt.clone();
    ids.extend_from_slice(&example.completion[..n - 1]);
    let input = Tensor::new(ids.as_slice(), &device)?.unsqueeze(0)?;
    let logits = model.forward_all(&input, 0).map_err(device_error)?;
    let logits = logits.squeeze(0)?.narrow(0, example.prompt.len() - 1, n)?;

    let targets = Tensor::new(example.completion.as_slice(), &device)?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}

fn sum_grads(mut acc: GradStore, grads: GradStore, model: &LoraModel) -> Result<GradStore> {
    for var in model.vars() {
        let tensor = var.as_tensor();
        if let Some(g) = grads.get(tensor) {
            let summed = match acc.get(tensor) {
                Some(prev) => (prev + g)?,
                None => g.clone(),
            };
            acc.insert(tensor, summed);
        }
    }
    Ok(acc)
}

/// Surface device allocation failures as resource errors
fn device_error(err: impl Into<Error>) -> Error {
    let err = err.into();
    let message = err.to_string();
    if message.to_lowercase().contains("out of memory") || message.contains("OUT_OF_MEMORY") {
        Error::resource(message)
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Label;
    use crate::model::Precision;
    use crate::testing::{self, ByteCodec};
    use tempfile::TempDir;

    fn quick_config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            num_epochs: 1,
            batch_size: 2,
            gradient_accumulation_steps: 1,
            warmup_steps: 0,
            learning_rate: 1e-2,
            use_fp16: false,
            logging_interval: 1,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_total_steps() {
        let config = TrainingConfig::default();
        // 100 examples, batch 8 -> 13 micro-batches -> 7 steps
        assert_eq!(config.total_steps(100), 7);
        let capped = TrainingConfig {
            max_steps: Some(3),
            ..Default::default()
        };
        assert_eq!(capped.total_steps(100), 3);
    }

    #[test]
    fn test_invalid_training_config() {
        let config = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(AdapterTrainer::new(
            LoraConfig {
                target_modules: vec![],
                ..Default::default()
            },
            TrainingConfig::default()
        )
        .is_err());
    }

    #[test]
    fn test_unlabeled_example_fails_before_training() {
        let dir = TempDir::new().unwrap();
        let base = testing::tiny_base_model(Precision::full());
        let trainer = AdapterTrainer::new(LoraConfig::default(), quick_config(dir.path())).unwrap();
        let examples = vec![
            Example::labeled("fine", Label::Positive),
            Example::unlabeled("who knows"),
        ];
        let err = trainer.train(&base, &examples, &ByteCodec).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
        assert!(!dir.path().join("trainer_state.json").exists());
    }

    #[test]
    fn test_training_produces_adapter_and_state() {
        let dir = TempDir::new().unwrap();
        let base = testing::tiny_base_model(Precision::full());
        let trainer = AdapterTrainer::new(
            LoraConfig {
                rank: 2,
                ..Default::default()
            },
            quick_config(dir.path()),
        )
        .unwrap();
        let examples = testing::labeled_examples();

        let (adapter, report) = trainer.train(&base, &examples, &ByteCodec).unwrap();
        assert_eq!(report.global_step, 2);
        assert_eq!(report.epochs_completed, 1);
        assert!(report.final_loss.unwrap().is_finite());
        assert_eq!(adapter.layers().len(), 14);
        assert_eq!(adapter.config().rank, 2);
        assert!(dir.path().join("trainer_state.json").exists());

        // B moved away from zero in every targeted layer
        for (path, pair) in adapter.layers() {
            let norm = pair.b.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(norm > 0.0, "B of {path} never left zero");
        }
    }

    #[test]
    fn test_training_lowers_loss_on_repeated_example() {
        let dir = TempDir::new().unwrap();
        let base = testing::tiny_base_model(Precision::full());
        let lora = LoraConfig {
            rank: 4,
            dropout: 0.0,
            ..Default::default()
        };
        let config = TrainingConfig {
            num_epochs: 10,
            batch_size: 1,
            ..quick_config(dir.path())
        };
        let trainer = AdapterTrainer::new(lora, config).unwrap();
        let examples = vec![Example::labeled("a joy to watch", Label::Positive)];

        let (_, report) = trainer.train(&base, &examples, &ByteCodec).unwrap();
        let first = report.log_history.first().unwrap().loss;
        let last = report.log_history.last().unwrap().loss;
        assert_eq!(report.global_step, 10);
        assert!(last < first, "loss went from {first} to {last}");
    }
}
