//! Combining a base model with an adapter
//!
//! [`Merger::compose`] keeps the two separate and applies the adapter on the
//! activation path whenever a runnable model is built; [`Merger::merge`] folds
//! it once into a standalone dense model.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device};
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::lora::{fold, Adapter};
use crate::model::{saver, BaseModel, LoraDelta, ModelConfig, Runnable, WeightMap};

/// Fold adapter factors into a copy of `weights`
///
/// `layers` yields `(module path, A, B)`; every path must name a weight in the map.
pub fn fold_layers<'a, I>(weights: &WeightMap, layers: I, scale: f64) -> Result<WeightMap>
where
    I: IntoIterator<Item = (&'a str, &'a candle_core::Tensor, &'a candle_core::Tensor)>,
{
    let mut folded = weights.clone();
    for (path, a, b) in layers {
        let name = format!("{path}.weight");
        let weight = weights
            .get(&name)
            .ok_or_else(|| Error::artifact(format!("no weight {name} to adapt")))?;
        let (out, inp) = weight.dims2()?;
        if b.dims()[0] != out || a.dims()[1] != inp {
            return Err(Error::artifact(format!(
                "adapter for {path} has shape ({}, {}) but the weight is ({out}, {inp})",
                b.dims()[0],
                a.dims()[1]
            )));
        }
        folded.insert(name, fold(weight, a, b, scale)?);
    }
    Ok(folded)
}

/// A base model with an adapter attached but not folded in
#[derive(Debug, Clone)]
pub struct ComposedModel {
    base: BaseModel,
    adapter: Adapter,
}

impl ComposedModel {
    pub fn base(&self) -> &BaseModel {
        &self.base
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub(crate) fn adapter_mut(&mut self) -> &mut Adapter {
        &mut self.adapter
    }

    pub fn into_parts(self) -> (BaseModel, Adapter) {
        (self.base, self.adapter)
    }

    /// Dense weights with the adapter applied
    pub fn effective_weights(&self) -> Result<WeightMap> {
        let layers = self
            .adapter
            .layers()
            .iter()
            .map(|(path, pair)| (path.as_str(), &pair.a, &pair.b));
        fold_layers(&self.base.dense_weights()?, layers, self.adapter.scale())
    }

    /// Runnable model over the stored base weights plus the unfolded adapter
    pub fn runnable(&self) -> Result<Runnable> {
        let deltas: BTreeMap<String, LoraDelta> = self
            .adapter
            .layers()
            .iter()
            .map(|(path, pair)| {
                let delta = LoraDelta {
                    a: pair.a.clone(),
                    b: pair.b.clone(),
                    scale: self.adapter.scale(),
                    dropout: 0.0,
                };
                (path.clone(), delta)
            })
            .collect();
        Runnable::build(
            self.base.config(),
            self.base.stored_weights(),
            &deltas,
            self.base.compute_dtype(),
            self.base.device(),
        )
    }
}

/// A standalone dense model with an adapter folded in
#[derive(Debug, Clone)]
pub struct MergedModel {
    id: String,
    config: ModelConfig,
    weights: WeightMap,
    dtype: DType,
    device: Device,
}

impl MergedModel {
    /// Wrap a dense base model, e.g. one reloaded from a merged artifact
    pub fn from_base(base: &BaseModel) -> Result<Self> {
        Ok(Self {
            id: base.id().to_string(),
            config: base.config().clone(),
            weights: base.dense_weights()?,
            dtype: base.compute_dtype(),
            device: base.device().clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightMap {
        &self.weights
    }

    pub(crate) fn weights_mut(&mut self) -> &mut WeightMap {
        &mut self.weights
    }

    pub fn runnable(&self) -> Result<Runnable> {
        Runnable::from_dense(&self.config, &self.weights, self.dtype, &self.device)
    }

    /// Persist as a loadable model directory
    pub fn save(&self, dir: &Path) -> Result<()> {
        saver::save_dense(dir, &self.config, &self.weights)
    }
}

/// Attaches and folds adapters
pub struct Merger;

impl Merger {
    /// Attach `adapter` to `base` without changing either
    pub fn compose(base: &BaseModel, adapter: &Adapter) -> Result<ComposedModel> {
        adapter.check_compatible(base)?;
        let adapter = adapter.to_device(base.device())?;
        Ok(ComposedModel {
            base: base.clone(),
            adapter,
        })
    }

    /// Fold `adapter` into a dense copy of `base`
    ///
    /// The base model is left untouched; merging twice gives identical weights.
    #[instrument(skip_all, fields(base = base.id(), layers = adapter.layers().len()))]
    pub fn merge(base: &BaseModel, adapter: &Adapter) -> Result<MergedModel> {
        let composed = Self::compose(base, adapter)?;
        let weights = composed.effective_weights()?;
        info!(tensors = weights.len(), "Adapter merged into base weights");
        Ok(MergedModel {
            id: base.id().to_string(),
            config: base.config().clone(),
            weights,
            dtype: base.compute_dtype(),
            device: base.device().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{LoraConfig, LoraPair};
    use crate::model::{LanguageModel, Precision};
    use crate::testing;
    use candle_core::Tensor;

    fn random_adapter(base: &BaseModel) -> Adapter {
        let config = LoraConfig {
            rank: 2,
            ..Default::default()
        };
        let mut layers = BTreeMap::new();
        for (path, (out, inp)) in config.resolve_targets(base).unwrap() {
            let a = Tensor::randn(0f32, 0.1, (2, inp), &Device::Cpu).unwrap();
            let b = Tensor::randn(0f32, 0.1, (out, 2), &Device::Cpu).unwrap();
            layers.insert(path, LoraPair::new(a, b).unwrap());
        }
        Adapter::new(config, base.id(), layers).unwrap()
    }

    fn max_diff(x: &Tensor, y: &Tensor) -> f32 {
        (x - y)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_merge_is_deterministic_and_leaves_base_untouched() {
        let base = testing::tiny_base_model(Precision::full());
        let before = base.dense_weights().unwrap();
        let adapter = random_adapter(&base);

        let first = Merger::merge(&base, &adapter).unwrap();
        let second = Merger::merge(&base, &adapter).unwrap();
        for (name, w) in first.weights() {
            assert_eq!(max_diff(w, &second.weights()[name]), 0.0);
        }
        for (name, w) in base.dense_weights().unwrap() {
            assert_eq!(max_diff(&w, &before[&name]), 0.0);
        }
    }

    #[test]
    fn test_merged_matches_composed_outputs() {
        let base = testing::tiny_base_model(Precision::full());
        let adapter = random_adapter(&base);
        let ids = Tensor::new(&[[256u32, 10, 20, 30]], &Device::Cpu).unwrap();

        let mut composed = Merger::compose(&base, &adapter).unwrap().runnable().unwrap();
        let mut merged = Merger::merge(&base, &adapter).unwrap().runnable().unwrap();
        let a = composed.forward(&ids, 0).unwrap();
        let b = merged.forward(&ids, 0).unwrap();
        assert!(max_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn test_merge_changes_targeted_weights_only() {
        let base = testing::tiny_base_model(Precision::full());
        let adapter = random_adapter(&base);
        let merged = Merger::merge(&base, &adapter).unwrap();
        let dense = base.dense_weights().unwrap();

        let q = "model.layers.0.self_attn.q_proj.weight";
        assert!(max_diff(&merged.weights()[q], &dense[q]) > 0.0);
        let embed = "model.embed_tokens.weight";
        assert_eq!(max_diff(&merged.weights()[embed], &dense[embed]), 0.0);
    }

    #[test]
    fn test_incompatible_adapter_is_artifact_error() {
        let base = testing::tiny_base_model(Precision::full());
        let mut layers = BTreeMap::new();
        layers.insert(
            "model.layers.0.self_attn.q_proj".to_string(),
            LoraPair::new(
                Tensor::zeros((6, 48), DType::F32, &Device::Cpu).unwrap(),
                Tensor::zeros((32, 6), DType::F32, &Device::Cpu).unwrap(),
            )
            .unwrap(),
        );
        let adapter = Adapter::new(LoraConfig::default(), "other", layers).unwrap();
        assert!(matches!(
            Merger::merge(&base, &adapter),
            Err(Error::Artifact(_))
        ));
    }

    #[test]
    fn test_merge_over_quantized_base() {
        let base = testing::tiny_base_model(Precision {
            compute_dtype: crate::model::ComputeDtype::F32,
            ..Precision::four_bit()
        });
        let adapter = random_adapter(&base);
        let merged = Merger::merge(&base, &adapter).unwrap();
        let ids = Tensor::new(&[[256u32, 1, 2]], &Device::Cpu).unwrap();
        let logits = merged.runnable().unwrap().forward(&ids, 0).unwrap();
        assert_eq!(logits.dims(), &[1, testing::VOCAB_SIZE]);
    }
}
