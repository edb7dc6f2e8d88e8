//! Base model representation and the runnable Gemma wrapper
//!
//! A [`BaseModel`] is the frozen, possibly quantized set of weights loaded from
//! an artifact. Everything that runs a forward pass builds a [`Runnable`] over
//! the stored weights plus optional per-module [`LoraDelta`]s. Quantized
//! weights are never expanded into a resident dense copy.

pub mod gemma;
pub mod loader;
pub mod quant;
pub mod saver;

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};

pub use self::gemma::{GemmaDecoder, LoraDelta};
pub use loader::{ComputeDtype, DevicePlacement, ModelLoader, Precision, QuantType};
pub use quant::StoredWeight;

/// Dense named weights, keyed by their artifact name
pub type WeightMap = BTreeMap<String, Tensor>;

/// Whether a weight is a linear projection that adapters and pruning may target
///
/// Embeddings (tied to the output head) and norm scales are excluded.
pub fn is_linear_weight(name: &str, dims: &[usize]) -> bool {
    dims.len() == 2
        && name.ends_with(".weight")
        && !name.contains("embed_tokens")
        && !name.contains("norm")
}

/// Module path of a weight, e.g. `model.layers.0.self_attn.q_proj`
pub fn module_path(weight_name: &str) -> &str {
    weight_name.strip_suffix(".weight").unwrap_or(weight_name)
}

/// Last segment of a module path, e.g. `q_proj`
pub fn module_leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Architecture configuration as stored in `config.json`
#[derive(Debug, Clone)]
pub struct ModelConfig {
    raw: serde_json::Value,
    gemma: candle_transformers::models::gemma::Config,
}

impl ModelConfig {
    /// Parse a `config.json` value
    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let gemma = serde_json::from_value(raw.clone())
            .map_err(|e| Error::artifact(format!("unsupported model config: {e}")))?;
        Ok(Self { raw, gemma })
    }

    /// Parse `config.json` text
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::artifact(format!("malformed model config: {e}")))?;
        Self::from_value(raw)
    }

    /// The original JSON, preserved for re-export
    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    pub fn gemma(&self) -> &candle_transformers::models::gemma::Config {
        &self.gemma
    }

    pub fn vocab_size(&self) -> usize {
        self.gemma.vocab_size
    }
}

/// Frozen pretrained weights plus their load-time precision
#[derive(Debug, Clone)]
pub struct BaseModel {
    id: String,
    config: ModelConfig,
    weights: BTreeMap<String, StoredWeight>,
    precision: Precision,
    device: Device,
}

impl BaseModel {
    /// Build a base model from dense weights, applying the storage precision
    ///
    /// Linear weights are quantized when the precision asks for it; every other
    /// tensor is cast to the dense storage dtype and moved to `device`.
    pub fn from_dense(
        id: impl Into<String>,
        config: ModelConfig,
        weights: WeightMap,
        precision: Precision,
        device: Device,
    ) -> Result<Self> {
        precision.validate()?;
        let id = id.into();
        let storage_dtype = precision.storage_dtype();
        let mut stored = BTreeMap::new();
        let mut quantized = 0usize;

        for (name, tensor) in weights {
            let weight = match precision.quant_type() {
                Some(qtype) if is_linear_weight(&name, tensor.dims()) => {
                    let weight = quant::quantize(&name, &tensor, qtype)?;
                    if weight.is_quantized() {
                        quantized += 1;
                    }
                    weight
                }
                _ => StoredWeight::Dense(tensor.to_dtype(storage_dtype)?.to_device(&device)?),
            };
            stored.insert(name, weight);
        }

        debug!(
            model = %id,
            tensors = stored.len(),
            quantized,
            bits = precision.bits,
            "Base model assembled"
        );

        Ok(Self {
            id,
            config,
            weights: stored,
            precision,
            device,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn precision(&self) -> &Precision {
        &self.precision
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dtype forward passes run in
    pub fn compute_dtype(&self) -> DType {
        self.precision.compute_dtype.dtype()
    }

    pub fn stored(&self, name: &str) -> Option<&StoredWeight> {
        self.weights.get(name)
    }

    pub fn weight_names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Linear sublayers as `(module path, (out_features, in_features))`
    pub fn linear_modules(&self) -> Vec<(String, (usize, usize))> {
        self.weights
            .iter()
            .filter(|(name, w)| is_linear_weight(name, w.dims()))
            .filter_map(|(name, w)| match w.dims() {
                [out, inp] => Some((module_path(name).to_string(), (*out, *inp))),
                _ => None,
            })
            .collect()
    }

    /// Dense copy of every weight in the compute dtype, dequantizing where needed
    ///
    /// Only merging needs this; forward passes read the stored weights.
    pub fn dense_weights(&self) -> Result<WeightMap> {
        let dtype = self.compute_dtype();
        self.weights
            .iter()
            .map(|(name, w)| Ok((name.clone(), w.dense(dtype, &self.device)?)))
            .collect()
    }

    /// Stored weights by name, quantized where the precision asked for it
    pub fn stored_weights(&self) -> &BTreeMap<String, StoredWeight> {
        &self.weights
    }

    /// Runnable model over the frozen weights alone
    pub fn runnable(&self) -> Result<Runnable> {
        Runnable::build(
            &self.config,
            &self.weights,
            &BTreeMap::new(),
            self.compute_dtype(),
            &self.device,
        )
    }
}

/// Anything that maps token ids to next-token logits
pub trait LanguageModel {
    /// Logits for the last position of every sequence, shape `(batch, vocab)`, in f32
    ///
    /// `seqlen_offset` is the number of positions already held in the cache.
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor>;

    /// Logits for every position, shape `(batch, seq, vocab)`, in f32
    fn forward_all(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor>;

    /// Drop any cached key/value state
    fn reset(&mut self);

    fn device(&self) -> &Device;
}

/// Gemma decoder over stored weights and optional adapter updates
pub struct Runnable {
    model: GemmaDecoder,
    device: Device,
}

impl Runnable {
    /// Build the architecture over `weights`, attaching `deltas` by module path
    ///
    /// Delta factors that are tracked (trainable `Var`s) keep their graph, so
    /// gradients flow back through the forward pass.
    pub fn build(
        config: &ModelConfig,
        weights: &BTreeMap<String, StoredWeight>,
        deltas: &BTreeMap<String, LoraDelta>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let model = GemmaDecoder::new(config, weights, deltas, dtype, device)?;
        Ok(Self {
            model,
            device: device.clone(),
        })
    }

    /// Build the architecture over a plain dense weight map
    pub fn from_dense(
        config: &ModelConfig,
        weights: &WeightMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let stored: BTreeMap<String, StoredWeight> = weights
            .iter()
            .map(|(name, t)| (name.clone(), StoredWeight::Dense(t.clone())))
            .collect();
        Self::build(config, &stored, &BTreeMap::new(), dtype, device)
    }
}

impl LanguageModel for Runnable {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let logits = self.model.forward(input_ids, seqlen_offset)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn forward_all(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let logits = self.model.forward_all(input_ids, seqlen_offset)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn reset(&mut self) {
        self.model.clear_kv_cache();
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_linear_weight_filter() {
        assert!(is_linear_weight("model.layers.0.self_attn.q_proj.weight", &[32, 32]));
        assert!(!is_linear_weight("model.embed_tokens.weight", &[260, 32]));
        assert!(!is_linear_weight("model.layers.0.input_layernorm.weight", &[32]));
        assert!(!is_linear_weight("model.norm.weight", &[32]));
    }

    #[test]
    fn test_module_path_helpers() {
        let path = module_path("model.layers.1.mlp.down_proj.weight");
        assert_eq!(path, "model.layers.1.mlp.down_proj");
        assert_eq!(module_leaf(path), "down_proj");
    }

    #[test]
    fn test_linear_modules_cover_all_projections() {
        let base = testing::tiny_base_model(Precision::full());
        let modules = base.linear_modules();
        // 7 projections per layer, 2 layers
        assert_eq!(modules.len(), 14);
        assert!(modules
            .iter()
            .any(|(p, dims)| p == "model.layers.0.mlp.down_proj" && *dims == (32, 64)));
    }

    #[test]
    fn test_runnable_forward_shape() {
        let base = testing::tiny_base_model(Precision::full());
        let mut model = base.runnable().unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, 0).unwrap();
        assert_eq!(logits.dims(), &[1, testing::VOCAB_SIZE]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_incremental_forward_matches_full_pass() {
        let base = testing::tiny_base_model(Precision::full());
        let mut model = base.runnable().unwrap();
        let full = Tensor::new(&[[5u32, 6, 7]], &Device::Cpu).unwrap();
        let expected = model.forward(&full, 0).unwrap();

        model.reset();
        let prefix = Tensor::new(&[[5u32, 6]], &Device::Cpu).unwrap();
        model.forward(&prefix, 0).unwrap();
        let last = Tensor::new(&[[7u32]], &Device::Cpu).unwrap();
        let incremental = model.forward(&last, 2).unwrap();

        let diff = (expected - incremental)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "diff = {diff}");
    }

    #[test]
    fn test_forward_all_ends_with_last_position() {
        let base = testing::tiny_base_model(Precision::full());
        let mut model = base.runnable().unwrap();
        let ids = Tensor::new(&[[9u32, 8, 7, 6]], &Device::Cpu).unwrap();
        let all = model.forward_all(&ids, 0).unwrap();
        assert_eq!(all.dims(), &[1, 4, testing::VOCAB_SIZE]);

        model.reset();
        let last = model.forward(&ids, 0).unwrap();
        let diff = (all.get(0).unwrap().get(3).unwrap() - last.get(0).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "diff = {diff}");
    }

    #[test]
    fn test_quantized_base_runs_without_dense_copy() {
        let base = testing::tiny_base_model(Precision::four_bit());
        let q_proj = base
            .stored("model.layers.0.self_attn.q_proj.weight")
            .unwrap();
        assert!(q_proj.is_quantized());

        let mut model = base.runnable().unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, 0).unwrap();
        assert_eq!(logits.dims(), &[1, testing::VOCAB_SIZE]);
    }

    #[test]
    fn test_delta_on_unknown_module_is_rejected() {
        let base = testing::tiny_base_model(Precision::full());
        let mut deltas = BTreeMap::new();
        deltas.insert(
            "model.layers.9.self_attn.q_proj".to_string(),
            LoraDelta {
                a: Tensor::zeros((2, 32), DType::F32, &Device::Cpu).unwrap(),
                b: Tensor::zeros((32, 2), DType::F32, &Device::Cpu).unwrap(),
                scale: 1.0,
                dropout: 0.0,
            },
        );
        let err = Runnable::build(
            base.config(),
            base.stored_weights(),
            &deltas,
            DType::F32,
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Artifact(_)));
    }

    #[test]
    fn test_invalid_config_is_artifact_error() {
        let err = ModelConfig::from_json("{\"hidden_size\": 4}").unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }
}
