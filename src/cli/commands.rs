//! Subcommand arguments and their handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tracing::info;

use super::logging;
use crate::config::PipelineConfig;
use crate::pipeline::{Pipeline, Stage};
use crate::prune::Sparsity;

#[derive(Args, Debug)]
pub struct RunCommand {
    /// Stages to run instead of the configured sequence
    #[arg(long, value_enum, value_delimiter = ',')]
    pub stages: Vec<Stage>,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TrainCommand {
    /// Override the number of epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Stop after this many optimizer steps
    #[arg(long)]
    pub max_steps: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EvaluateCommand {
    /// Evaluate only the first N held-out examples
    #[arg(long)]
    pub limit: Option<usize>,

    /// Decode greedily instead of sampling
    #[arg(long)]
    pub greedy: bool,
}

#[derive(Args, Debug)]
pub struct GenerateCommand {
    /// Sentence to classify
    #[arg(short, long)]
    pub sentence: String,

    /// Override the generation budget
    #[arg(long)]
    pub max_new_tokens: Option<usize>,
}

#[derive(Args, Debug)]
pub struct PruneCommand {
    /// Fraction of weights to zero, in [0, 1)
    #[arg(long)]
    pub sparsity: Option<f64>,
}

#[derive(Args, Debug)]
pub struct DistillCommand {
    /// Override the number of distillation epochs
    #[arg(long)]
    pub epochs: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective configuration as YAML
    Show,

    /// Write the default configuration to a file
    Init {
        /// Destination; the extension picks yaml, toml or json
        #[arg(default_value = "sst2-lora.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print one value by dotted key, e.g. `lora.rank`
    Get { key: String },
}

async fn pipeline(config: PipelineConfig) -> Result<Pipeline> {
    Pipeline::with_pretrained_tokenizer(config)
        .await
        .context("Failed to initialise pipeline")
}

/// Replace the configured stage sequence with an explicit one
///
/// Listing `distill` on the command line counts as asking for it, so the
/// stage is enabled rather than silently skipped.
pub fn apply_stage_override(config: &mut PipelineConfig, stages: Vec<Stage>) {
    if stages.is_empty() {
        return;
    }
    if stages.contains(&Stage::Distill) && !config.distill.enabled {
        info!("Enabling distillation for the requested stages");
        config.distill.enabled = true;
    }
    config.stages = stages;
}

pub async fn run(cmd: RunCommand, mut config: PipelineConfig) -> Result<()> {
    apply_stage_override(&mut config, cmd.stages);
    let summary = pipeline(config).await?.run().await?;

    if let Some(report) = &summary.evaluation {
        logging::success(&report.to_string());
    }
    if let Some(path) = cmd.summary {
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    }
    let completed: Vec<String> = summary.completed.iter().map(Stage::to_string).collect();
    logging::success(&format!("Completed stages: {}", completed.join(", ")));
    Ok(())
}

pub async fn train(cmd: TrainCommand, mut config: PipelineConfig) -> Result<()> {
    if let Some(epochs) = cmd.epochs {
        config.training.num_epochs = epochs;
    }
    if cmd.max_steps.is_some() {
        config.training.max_steps = cmd.max_steps;
    }
    let pipeline = pipeline(config).await?;
    let corpus = pipeline.load_corpus().await?;
    let (_, report) = pipeline.train(&corpus).await?;

    info!(steps = report.global_step, "Training finished");
    logging::success(&format!(
        "Adapter saved to {}",
        pipeline.config().adapter_path().display()
    ));
    Ok(())
}

pub async fn merge(config: PipelineConfig) -> Result<()> {
    let pipeline = pipeline(config).await?;
    let merged = pipeline.merge().await?;
    logging::success(&format!(
        "Merged {} saved to {}",
        merged.id(),
        pipeline.config().merged_path().display()
    ));
    Ok(())
}

pub async fn evaluate(cmd: EvaluateCommand, mut config: PipelineConfig) -> Result<()> {
    if cmd.limit.is_some() {
        config.evaluation.limit = cmd.limit;
    }
    if cmd.greedy {
        config.sampling = crate::infer::SamplingConfig::greedy(config.sampling.max_new_tokens);
    }
    let pipeline = pipeline(config).await?;
    let corpus = pipeline.load_corpus().await?;
    let report = pipeline.evaluate(&corpus).await?;
    if report.accuracy().is_some() {
        logging::success(&report.to_string());
    } else {
        logging::warning(&report.to_string());
    }
    Ok(())
}

pub async fn generate(cmd: GenerateCommand, mut config: PipelineConfig) -> Result<()> {
    if let Some(max_new_tokens) = cmd.max_new_tokens {
        config.sampling.max_new_tokens = max_new_tokens;
    }
    let generation = pipeline(config).await?.generate(&cmd.sentence).await?;
    println!("{generation}");
    Ok(())
}

pub async fn prune(cmd: PruneCommand, mut config: PipelineConfig) -> Result<()> {
    if let Some(sparsity) = cmd.sparsity {
        config.prune.sparsity = Sparsity::new(sparsity)?;
    }
    let pipeline = pipeline(config).await?;
    let report = pipeline.prune().await?;
    logging::success(&format!(
        "Pruned {} of {} adapter weights ({:.2}% sparse), saved to {}",
        report.total_pruned(),
        report.total_parameters(),
        report.achieved_sparsity() * 100.0,
        pipeline.config().pruned_adapter_path().display()
    ));
    Ok(())
}

pub async fn distill(cmd: DistillCommand, mut config: PipelineConfig) -> Result<()> {
    if let Some(epochs) = cmd.epochs {
        config.distill.epochs = epochs;
    }
    let pipeline = pipeline(config).await?;
    let corpus = pipeline.load_corpus().await?;
    let report = pipeline.distill(&corpus).await?;
    logging::success(&format!(
        "Distilled over {} steps, loss {:?} -> {:?}",
        report.steps,
        report.first_loss(),
        report.final_loss()
    ));
    Ok(())
}

pub async fn export_pruned(config: PipelineConfig) -> Result<()> {
    let pipeline = pipeline(config).await?;
    pipeline.export_pruned().await?;
    logging::success(&format!(
        "Pruned model saved to {}",
        pipeline.config().pruned_merged_path().display()
    ));
    Ok(())
}

pub fn handle_config(subcommand: ConfigSubcommand, config: &PipelineConfig) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            println!("{}", config.to_yaml()?);
            Ok(())
        }
        ConfigSubcommand::Init { path, force } => init_config(&path, force),
        ConfigSubcommand::Get { key } => {
            println!("{}", config_value(config, &key)?);
            Ok(())
        }
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            path.display()
        );
    }
    PipelineConfig::default().save(path)?;
    logging::success(&format!("Configuration file created: {}", path.display()));
    Ok(())
}

/// Look up a dotted key in the serialized configuration
pub fn config_value(config: &PipelineConfig, key: &str) -> Result<String> {
    let root = serde_json::to_value(config)?;
    let value = key
        .split('.')
        .try_fold(&root, |current, part| current.get(part))
        .with_context(|| format!("Unknown configuration key: {key}"))?;
    Ok(match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_distill_stage_enables_distillation() {
        let mut config = PipelineConfig::default();
        assert!(!config.distill.enabled);
        apply_stage_override(&mut config, vec![Stage::Prune, Stage::Distill]);
        assert!(config.distill.enabled);
        assert_eq!(config.stages, vec![Stage::Prune, Stage::Distill]);

        let mut config = PipelineConfig::default();
        let configured = config.stages.clone();
        apply_stage_override(&mut config, vec![]);
        assert_eq!(config.stages, configured);
        assert!(!config.distill.enabled);

        let mut config = PipelineConfig::default();
        apply_stage_override(&mut config, vec![Stage::Train, Stage::Merge]);
        assert!(!config.distill.enabled);
    }

    #[test]
    fn test_config_value_lookup() {
        let config = PipelineConfig::default();
        assert_eq!(config_value(&config, "lora.rank").unwrap(), "6");
        assert_eq!(config_value(&config, "base_model").unwrap(), "google/gemma-2b-it");
        assert!(config_value(&config, "lora.missing").is_err());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        let defaults = PipelineConfig::default();
        assert_eq!(loaded.lora.target_modules, defaults.lora.target_modules);
        assert_eq!(loaded.stages, defaults.stages);
        assert_eq!(loaded.train_precision, defaults.train_precision);
    }
}
