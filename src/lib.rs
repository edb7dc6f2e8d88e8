//! SST2-LoRA - adapter lifecycle for sentiment classification with causal LMs
//!
//! Fine-tunes a low-rank adapter on a quantized Gemma base, merges it into a
//! dense model, scores the result on held-out sentences, then prunes and
//! optionally distills the adapter before exporting a second merged model.
//!
//! ```no_run
//! use sst2_lora::{Pipeline, PipelineConfig};
//!
//! # async fn demo() -> sst2_lora::Result<()> {
//! let config = PipelineConfig::load("pipeline.yaml".as_ref())?;
//! let pipeline = Pipeline::with_pretrained_tokenizer(config).await?;
//! let summary = pipeline.run().await?;
//! if let Some(report) = summary.evaluation {
//!     println!("{report}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::broken_intra_doc_links)]

pub mod cli;
pub mod config;
pub mod corpus;
pub mod distill;
pub mod error;
pub mod eval;
pub mod infer;
pub mod lora;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod prune;
pub mod tokenizer;
pub mod training;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use config::PipelineConfig;
pub use corpus::{Corpus, CorpusLoader, Example, Label, Split};
pub use error::{Error, Result};
pub use eval::{EvaluationReport, Evaluator, Prediction};
pub use lora::{Adapter, LoraConfig};
pub use merge::{ComposedModel, MergedModel, Merger};
pub use model::{BaseModel, ModelLoader, Precision};
pub use pipeline::{Pipeline, PipelineSummary, Stage};
pub use prune::{PruneReport, Pruner, Sparsity};
pub use tokenizer::{HfTokenizer, TokenCodec};
pub use training::{AdapterTrainer, TrainingConfig, TrainingReport};
