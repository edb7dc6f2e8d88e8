//! Pipeline configuration
//!
//! Loaded through the `config` crate from a YAML, TOML or JSON file, with
//! `SST2_LORA__<SECTION>__<KEY>` environment variables taking precedence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::corpus::{FieldNames, SplitFiles, Split};
use crate::distill::DistillConfig;
use crate::error::{Error, Result};
use crate::infer::SamplingConfig;
use crate::lora::LoraConfig;
use crate::model::{DevicePlacement, Precision};
use crate::pipeline::Stage;
use crate::prune::Sparsity;
use crate::training::TrainingConfig;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SST2_LORA";

/// Where the corpus comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorpusSource {
    /// Directory with `<split>.jsonl` or GLUE `.tsv` files
    Local { dir: PathBuf },
    /// Dataset repository on the HuggingFace Hub
    Hub {
        repo_id: String,
        #[serde(default)]
        revision: Option<String>,
        #[serde(default)]
        files: SplitFiles,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    pub source: CorpusSource,
    pub fields: FieldNames,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            source: CorpusSource::Local {
                dir: PathBuf::from("data/sst2"),
            },
            fields: FieldNames::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Held-out split; GLUE's test split is unlabeled, so validation is the default
    pub split: Split,
    /// Evaluate only the first N examples
    pub limit: Option<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            split: Split::Validation,
            limit: Some(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub sparsity: Sparsity,
}

/// Artifact directory names, relative to `output_root`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactLayout {
    pub adapter_dir: String,
    pub merged_dir: String,
    pub pruned_adapter_dir: String,
    pub distilled_adapter_dir: String,
    pub pruned_merged_dir: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            adapter_dir: "lora_adapter".to_string(),
            merged_dir: "gemma-2b-it-sst2".to_string(),
            pruned_adapter_dir: "pruned_lora_adapter".to_string(),
            distilled_adapter_dir: "distilled_lora_adapter".to_string(),
            pruned_merged_dir: "gemma-2b-it-sst2-pruned".to_string(),
        }
    }
}

impl ArtifactLayout {
    fn names(&self) -> [&str; 5] {
        [
            &self.adapter_dir,
            &self.merged_dir,
            &self.pruned_adapter_dir,
            &self.distilled_adapter_dir,
            &self.pruned_merged_dir,
        ]
    }
}

/// Complete configuration of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base model directory or hub id
    pub base_model: String,
    /// Tokenizer location; the base model's when unset
    pub tokenizer: Option<String>,
    pub device: DevicePlacement,
    pub output_root: PathBuf,
    pub corpus: CorpusConfig,
    /// Precision the base is loaded at for training, pruning and distillation
    pub train_precision: Precision,
    /// Precision the base is loaded at for merging and evaluation
    pub merge_precision: Precision,
    pub lora: LoraConfig,
    pub training: TrainingConfig,
    pub sampling: SamplingConfig,
    pub evaluation: EvaluationConfig,
    pub prune: PruneConfig,
    pub distill: DistillConfig,
    pub artifacts: ArtifactLayout,
    /// Stages executed by a full run, in order
    pub stages: Vec<Stage>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_model: "google/gemma-2b-it".to_string(),
            tokenizer: None,
            device: DevicePlacement::Cpu,
            output_root: PathBuf::from("."),
            corpus: CorpusConfig::default(),
            train_precision: Precision::four_bit(),
            merge_precision: Precision::half(),
            lora: LoraConfig::default(),
            training: TrainingConfig::default(),
            sampling: SamplingConfig::default(),
            evaluation: EvaluationConfig::default(),
            prune: PruneConfig::default(),
            distill: DistillConfig::default(),
            artifacts: ArtifactLayout::default(),
            stages: Stage::default_sequence(),
        }
    }
}

impl PipelineConfig {
    /// Load from `path` with environment overrides, then validate
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        debug!(path = %path.display(), "Configuration loaded");
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration, choosing the format from the extension
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => self.to_yaml()?,
            Some("toml") => toml::to_string(self)
                .map_err(|e| Error::config(format!("TOML serialization error: {e}")))?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::config(format!("YAML serialization error: {e}")))
    }

    /// Reject invalid settings before any expensive work starts
    pub fn validate(&self) -> Result<()> {
        if self.base_model.trim().is_empty() {
            return Err(Error::config("base_model must be set"));
        }
        self.train_precision.validate()?;
        self.merge_precision.validate()?;
        self.lora.validate()?;
        self.training.validate()?;
        self.sampling.validate()?;
        if self.distill.enabled || self.stages.contains(&Stage::Distill) {
            self.distill.validate()?;
        }
        if self.evaluation.limit == Some(0) {
            return Err(Error::config("evaluation limit must be positive when set"));
        }
        if self.stages.is_empty() {
            return Err(Error::config("at least one stage must be configured"));
        }

        let names = self.artifacts.names();
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::config("artifact directory names must not be empty"));
        }
        for (i, name) in names.iter().enumerate() {
            if names[i + 1..].contains(name) {
                return Err(Error::config(format!(
                    "artifact directory {name} is used for more than one artifact"
                )));
            }
        }
        Ok(())
    }

    /// Tokenizer location, falling back to the base model
    pub fn tokenizer_source(&self) -> &str {
        self.tokenizer.as_deref().unwrap_or(&self.base_model)
    }

    pub fn adapter_path(&self) -> PathBuf {
        self.output_root.join(&self.artifacts.adapter_dir)
    }

    pub fn merged_path(&self) -> PathBuf {
        self.output_root.join(&self.artifacts.merged_dir)
    }

    pub fn pruned_adapter_path(&self) -> PathBuf {
        self.output_root.join(&self.artifacts.pruned_adapter_dir)
    }

    pub fn distilled_adapter_path(&self) -> PathBuf {
        self.output_root.join(&self.artifacts.distilled_adapter_dir)
    }

    pub fn pruned_merged_path(&self) -> PathBuf {
        self.output_root.join(&self.artifacts.pruned_merged_dir)
    }
}
