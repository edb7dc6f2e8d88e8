//! Stage orchestration over artifact directories
//!
//! Each stage reads its inputs from and writes its outputs to the directories
//! named in [`ArtifactLayout`](crate::config::ArtifactLayout), so stages can be
//! run one at a time from the command line or in sequence by [`Pipeline::run`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{CorpusSource, PipelineConfig};
use crate::corpus::{Corpus, CorpusLoader, DatasetSource, HubCorpus, LocalCorpus};
use crate::distill::{token_batches, DistillReport, Distiller};
use crate::error::{Error, Result};
use crate::eval::{EvaluationReport, Evaluator};
use crate::infer::{Generation, InferenceRunner};
use crate::lora::peft::{load_adapter, save_adapter};
use crate::lora::Adapter;
use crate::merge::{MergedModel, Merger};
use crate::model::{BaseModel, ModelLoader, Precision};
use crate::prompt::PromptFormatter;
use crate::prune::{PruneReport, Pruner};
use crate::tokenizer::{HfTokenizer, TokenCodec};
use crate::training::{AdapterTrainer, LoraModel, TrainingReport};

/// A unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Fine-tune an adapter on the training split
    Train,
    /// Fold the adapter into the base and persist the merged model
    Merge,
    /// Score the merged model on the held-out split
    Evaluate,
    /// Prune the adapter attached to the base
    Prune,
    /// Distill the unpruned composition into the pruned adapter
    Distill,
    /// Merge the pruned (or distilled) adapter and persist it
    ExportPruned,
}

impl Stage {
    /// Train, merge, evaluate, prune, distill, export
    pub fn default_sequence() -> Vec<Self> {
        vec![
            Self::Train,
            Self::Merge,
            Self::Evaluate,
            Self::Prune,
            Self::Distill,
            Self::ExportPruned,
        ]
    }

    fn needs_corpus(self) -> bool {
        matches!(self, Self::Train | Self::Evaluate | Self::Distill)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Merge => "merge",
            Self::Evaluate => "evaluate",
            Self::Prune => "prune",
            Self::Distill => "distill",
            Self::ExportPruned => "export-pruned",
        };
        f.write_str(name)
    }
}

/// Reports gathered over a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub completed: Vec<Stage>,
    pub training: Option<TrainingReport>,
    pub evaluation: Option<EvaluationReport>,
    pub prune: Option<PruneReport>,
    pub distill: Option<DistillReport>,
}

/// Runs pipeline stages for one configuration
pub struct Pipeline {
    config: PipelineConfig,
    codec: Arc<dyn TokenCodec>,
    formatter: PromptFormatter,
}

impl Pipeline {
    /// Validates the configuration before anything is loaded
    pub fn new(config: PipelineConfig, codec: Arc<dyn TokenCodec>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codec,
            formatter: PromptFormatter::default(),
        })
    }

    /// Build a pipeline with the configured HuggingFace tokenizer
    pub async fn with_pretrained_tokenizer(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let tokenizer = HfTokenizer::from_pretrained(config.tokenizer_source()).await?;
        Self::new(config, Arc::new(tokenizer))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fetch and validate the training and held-out splits
    pub async fn load_corpus(&self) -> Result<Corpus> {
        let fields = self.config.corpus.fields.clone();
        let source: Box<dyn DatasetSource> = match &self.config.corpus.source {
            CorpusSource::Local { dir } => Box::new(LocalCorpus::new(dir.clone(), fields)),
            CorpusSource::Hub {
                repo_id,
                revision,
                files,
            } => Box::new(HubCorpus::new(
                repo_id.clone(),
                revision.clone(),
                files.clone(),
                fields,
            )),
        };
        CorpusLoader::new(source, self.config.evaluation.split).load().await
    }

    async fn load_model(&self, id: &str, precision: Precision) -> Result<BaseModel> {
        ModelLoader::new(precision, self.config.device).load(id).await
    }

    async fn load_base(&self, precision: Precision) -> Result<BaseModel> {
        self.load_model(&self.config.base_model, precision).await
    }

    fn read_adapter(&self, dir: &Path, base: &BaseModel) -> Result<Adapter> {
        let adapter = load_adapter(dir, base.device())?;
        if adapter.base_model() != base.id() {
            warn!(
                adapter_base = adapter.base_model(),
                base = base.id(),
                "Adapter was trained on a different base identifier"
            );
        }
        Ok(adapter)
    }

    /// Fine-tune an adapter and save it to the adapter directory
    #[instrument(skip_all)]
    pub async fn train(&self, corpus: &Corpus) -> Result<(Adapter, TrainingReport)> {
        let base = self.load_base(self.config.train_precision).await?;
        let mut training = self.config.training.clone();
        training.output_dir = self.config.output_root.join(&training.output_dir);

        let trainer = AdapterTrainer::new(self.config.lora.clone(), training)?
            .with_formatter(self.formatter.clone());
        let (adapter, report) = trainer.train(&base, &corpus.train, self.codec.as_ref())?;
        save_adapter(&adapter, &self.config.adapter_path())?;
        Ok((adapter, report))
    }

    /// Merge the saved adapter into the base and save the merged model
    #[instrument(skip_all)]
    pub async fn merge(&self) -> Result<MergedModel> {
        let base = self.load_base(self.config.merge_precision).await?;
        let adapter = self.read_adapter(&self.config.adapter_path(), &base)?;
        let merged = Merger::merge(&base, &adapter)?;
        merged.save(&self.config.merged_path())?;
        Ok(merged)
    }

    async fn load_merged(&self) -> Result<MergedModel> {
        let path = self.config.merged_path();
        if !path.is_dir() {
            return Err(Error::artifact(format!(
                "merged model not found at {}; run the merge stage first",
                path.display()
            )));
        }
        let loaded = self
            .load_model(&path.to_string_lossy(), self.config.merge_precision)
            .await?;
        MergedModel::from_base(&loaded)
    }

    /// Score the merged model on the held-out split
    #[instrument(skip_all)]
    pub async fn evaluate(&self, corpus: &Corpus) -> Result<EvaluationReport> {
        let merged = self.load_merged().await?;
        let mut runner = InferenceRunner::new(
            merged.runnable()?,
            self.codec.as_ref(),
            self.config.sampling.clone(),
        )?;
        let report = Evaluator::new(self.config.evaluation.limit)
            .with_formatter(self.formatter.clone())
            .evaluate(&mut runner, &corpus.test)?;

        std::fs::create_dir_all(&self.config.output_root)?;
        std::fs::write(
            self.config.output_root.join("evaluation.json"),
            serde_json::to_string_pretty(&report)?,
        )?;
        Ok(report)
    }

    /// Generate the merged model's answer for one sentence
    pub async fn generate(&self, sentence: &str) -> Result<Generation> {
        let merged = self.load_merged().await?;
        let mut runner = InferenceRunner::new(
            merged.runnable()?,
            self.codec.as_ref(),
            self.config.sampling.clone(),
        )?;
        runner.generate(&self.formatter.render_inference(sentence))
    }

    /// Prune the adapter attached to the base and save the pruned adapter
    #[instrument(skip_all)]
    pub async fn prune(&self) -> Result<PruneReport> {
        let base = self.load_base(self.config.train_precision).await?;
        let adapter = self.read_adapter(&self.config.adapter_path(), &base)?;
        let composed = Merger::compose(&base, &adapter)?;

        let pruner = Pruner::new(self.config.prune.sparsity.value())?;
        let (pruned, report) = pruner.prune(&composed)?;
        save_adapter(pruned.adapter(), &self.config.pruned_adapter_path())?;

        // A distilled adapter descends from the previous pruned one
        let distilled = self.config.distilled_adapter_path();
        if distilled.exists() {
            warn!(
                path = %distilled.display(),
                "Discarding distilled adapter from an earlier prune"
            );
            std::fs::remove_dir_all(&distilled)?;
        }
        Ok(report)
    }

    /// Recover the pruned adapter toward the unpruned one
    #[instrument(skip_all)]
    pub async fn distill(&self, corpus: &Corpus) -> Result<DistillReport> {
        let distiller = Distiller::new(self.config.distill.clone())?;
        let base = self.load_base(self.config.train_precision).await?;
        let teacher_adapter = self.read_adapter(&self.config.adapter_path(), &base)?;
        let pruned = self.read_adapter(&self.config.pruned_adapter_path(), &base)?;

        let mut teacher = Merger::compose(&base, &teacher_adapter)?.runnable()?;
        let student = LoraModel::from_adapter(&base, &pruned, base.compute_dtype())?;

        let limit = self.config.distill.num_samples.unwrap_or(corpus.train.len());
        let texts = corpus
            .train
            .iter()
            .take(limit)
            .map(|ex| self.formatter.render_training(ex))
            .collect::<Result<Vec<_>>>()?;
        let batches = token_batches(
            self.codec.as_ref(),
            &texts,
            self.config.distill.batch_size,
            self.config.distill.max_seq_len,
            base.device(),
        )?;

        let mut optimizer = distiller.optimizer(&student)?;
        let report = distiller.distill(&student, &mut teacher, &batches, &mut optimizer)?;
        save_adapter(&student.to_adapter()?, &self.config.distilled_adapter_path())?;
        Ok(report)
    }

    /// Merge the pruned adapter, or its distilled successor, and save the result
    #[instrument(skip_all)]
    pub async fn export_pruned(&self) -> Result<MergedModel> {
        let distilled = self.config.distilled_adapter_path();
        let source = if self.config.distill.enabled && distilled.is_dir() {
            distilled
        } else {
            self.config.pruned_adapter_path()
        };
        info!(adapter = %source.display(), "Exporting pruned model");

        let base = self.load_base(self.config.merge_precision).await?;
        let adapter = self.read_adapter(&source, &base)?;
        let merged = Merger::merge(&base, &adapter)?;
        merged.save(&self.config.pruned_merged_path())?;
        Ok(merged)
    }

    /// Execute the configured stages in order
    pub async fn run(&self) -> Result<PipelineSummary> {
        let needs_corpus = self.config.stages.iter().any(|s| s.needs_corpus());
        let corpus = if needs_corpus {
            Some(self.load_corpus().await?)
        } else {
            None
        };
        let corpus_ref = || {
            corpus
                .as_ref()
                .ok_or_else(|| Error::data("corpus was not loaded"))
        };

        let mut summary = PipelineSummary::default();
        for &stage in &self.config.stages {
            info!(%stage, "Running stage");
            match stage {
                Stage::Train => {
                    let (_, report) = self.train(corpus_ref()?).await?;
                    summary.training = Some(report);
                }
                Stage::Merge => {
                    self.merge().await?;
                }
                Stage::Evaluate => {
                    let report = self.evaluate(corpus_ref()?).await?;
                    info!("{report}");
                    summary.evaluation = Some(report);
                }
                Stage::Prune => {
                    summary.prune = Some(self.prune().await?);
                }
                Stage::Distill if !self.config.distill.enabled => {
                    warn!("Distill stage requested but distill.enabled is false, skipping");
                    continue;
                }
                Stage::Distill => {
                    summary.distill = Some(self.distill(corpus_ref()?).await?);
                }
                Stage::ExportPruned => {
                    self.export_pruned().await?;
                }
            }
            summary.completed.push(stage);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ByteCodec;

    #[test]
    fn test_stage_serde_names() {
        let stages: Vec<Stage> = serde_yaml::from_str("[train, export-pruned]").unwrap();
        assert_eq!(stages, vec![Stage::Train, Stage::ExportPruned]);
        assert_eq!(Stage::ExportPruned.to_string(), "export-pruned");
    }

    #[test]
    fn test_invalid_config_rejected_before_loading() {
        let mut config = PipelineConfig::default();
        config.lora.rank = 0;
        assert!(matches!(
            Pipeline::new(config, Arc::new(ByteCodec)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_without_adapter_is_artifact_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let (model_config, weights) = crate::testing::tiny_model_parts();
        let model_dir = dir.path().join("base");
        crate::model::saver::save_dense(&model_dir, &model_config, &weights).unwrap();

        let config = PipelineConfig {
            base_model: model_dir.to_string_lossy().into_owned(),
            output_root: dir.path().join("out"),
            merge_precision: Precision::full(),
            ..Default::default()
        };
        let pipeline = Pipeline::new(config, Arc::new(ByteCodec)).unwrap();
        assert!(matches!(pipeline.merge().await, Err(Error::Artifact(_))));
    }
}
