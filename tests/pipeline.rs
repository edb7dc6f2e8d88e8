use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use sst2_lora::config::CorpusSource;
use sst2_lora::distill::DistillConfig;
use sst2_lora::infer::SamplingConfig;
use sst2_lora::lora::peft;
use sst2_lora::testing::{self, ByteCodec};
use sst2_lora::training::TrainingConfig;
use sst2_lora::{Error, Merger, ModelLoader, Pipeline, PipelineConfig, Precision, Sparsity, Stage};
use tempfile::TempDir;

fn tiny_pipeline_config(root: &Path) -> PipelineConfig {
    let model_dir = testing::write_tiny_model(root);
    let corpus_dir = testing::write_corpus(root);

    let mut config = PipelineConfig {
        base_model: model_dir.to_string_lossy().into_owned(),
        output_root: root.join("out"),
        train_precision: Precision::full(),
        merge_precision: Precision::full(),
        training: TrainingConfig {
            max_steps: Some(2),
            batch_size: 2,
            gradient_accumulation_steps: 1,
            warmup_steps: 0,
            learning_rate: 1e-3,
            use_fp16: false,
            logging_interval: 1,
            ..Default::default()
        },
        sampling: SamplingConfig::greedy(4),
        distill: DistillConfig {
            enabled: true,
            epochs: 1,
            learning_rate: 1e-3,
            batch_size: 2,
            max_seq_len: 32,
            logging_interval: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    config.corpus.source = CorpusSource::Local { dir: corpus_dir };
    config.evaluation.limit = Some(2);
    config
}

#[tokio::test]
async fn test_full_run_writes_every_artifact() {
    let root = TempDir::new().unwrap();
    let config = tiny_pipeline_config(root.path());
    let pipeline = Pipeline::new(config.clone(), Arc::new(ByteCodec)).unwrap();

    let summary = pipeline.run().await.unwrap();
    assert_eq!(summary.completed, Stage::default_sequence());

    let training = summary.training.unwrap();
    assert_eq!(training.global_step, 2);
    assert!(config.adapter_path().join(peft::CONFIG_FILE).is_file());
    assert!(config.adapter_path().join(peft::WEIGHTS_FILE).is_file());

    for dir in [config.merged_path(), config.pruned_merged_path()] {
        assert!(dir.join("config.json").is_file());
        assert!(dir.join("model.safetensors").is_file());
    }

    let evaluation = summary.evaluation.unwrap();
    assert_eq!(evaluation.total(), 2);
    assert!(config.output_root.join("evaluation.json").is_file());

    let prune = summary.prune.unwrap();
    assert!((prune.achieved_sparsity() - 0.5).abs() < 1e-9);
    assert!(config.pruned_adapter_path().join(peft::WEIGHTS_FILE).is_file());

    let distill = summary.distill.unwrap();
    assert_eq!(distill.steps, 2);
    assert!(config.distilled_adapter_path().join(peft::WEIGHTS_FILE).is_file());
}

#[tokio::test]
async fn test_disabled_distillation_is_skipped() {
    let root = TempDir::new().unwrap();
    let mut config = tiny_pipeline_config(root.path());
    config.distill.enabled = false;
    config.stages = vec![Stage::Train, Stage::Prune, Stage::Distill, Stage::ExportPruned];

    let pipeline = Pipeline::new(config.clone(), Arc::new(ByteCodec)).unwrap();
    let summary = pipeline.run().await.unwrap();

    assert_eq!(
        summary.completed,
        vec![Stage::Train, Stage::Prune, Stage::ExportPruned]
    );
    assert!(summary.distill.is_none());
    assert!(!config.distilled_adapter_path().exists());
    assert!(config.pruned_merged_path().join("model.safetensors").is_file());
}

#[tokio::test]
async fn test_evaluate_before_merge_fails() {
    let root = TempDir::new().unwrap();
    let config = tiny_pipeline_config(root.path());
    let pipeline = Pipeline::new(config, Arc::new(ByteCodec)).unwrap();

    let corpus = pipeline.load_corpus().await.unwrap();
    assert_eq!(corpus.train.len(), 4);
    assert_eq!(corpus.test.len(), 3);
    assert!(matches!(
        pipeline.evaluate(&corpus).await,
        Err(Error::Artifact(_))
    ));
}

#[tokio::test]
async fn test_generate_after_merge() {
    let root = TempDir::new().unwrap();
    let mut config = tiny_pipeline_config(root.path());
    config.stages = vec![Stage::Train, Stage::Merge];

    let pipeline = Pipeline::new(config, Arc::new(ByteCodec)).unwrap();
    pipeline.run().await.unwrap();

    let generation = pipeline.generate("a sharp, witty script").await.unwrap();
    assert!(generation.tokens().len() <= 4);
    assert!(generation.prompt().ends_with("<start_of_turn>model\n"));
}

#[tokio::test]
async fn test_reprune_discards_stale_distilled_adapter() {
    let root = TempDir::new().unwrap();
    let config = tiny_pipeline_config(root.path());
    Pipeline::new(config.clone(), Arc::new(ByteCodec))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert!(config.distilled_adapter_path().is_dir());

    let mut reprune = config.clone();
    reprune.prune.sparsity = Sparsity::new(0.9).unwrap();
    reprune.stages = vec![Stage::Prune, Stage::ExportPruned];
    let pipeline = Pipeline::new(reprune.clone(), Arc::new(ByteCodec)).unwrap();
    let summary = pipeline.run().await.unwrap();

    assert!((summary.prune.unwrap().achieved_sparsity() - 0.9).abs() < 0.01);
    assert!(!reprune.distilled_adapter_path().exists());

    // The export reflects the new 0.9 adapter, not the old distilled one
    let loader = ModelLoader::new(reprune.merge_precision, reprune.device);
    let base = loader.load(&reprune.base_model).await.unwrap();
    let pruned = peft::load_adapter(&reprune.pruned_adapter_path(), base.device()).unwrap();
    let expected = Merger::merge(&base, &pruned).unwrap();
    let exported = loader
        .load(&reprune.pruned_merged_path().to_string_lossy())
        .await
        .unwrap();

    let name = "model.layers.0.self_attn.q_proj.weight";
    let exported = exported
        .stored(name)
        .unwrap()
        .dense(DType::F32, &Device::Cpu)
        .unwrap();
    let diff = (exported - expected.weights()[name].to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-6, "diff = {diff}");
}
