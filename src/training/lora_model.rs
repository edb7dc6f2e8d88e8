//! Trainable LoRA factors over a frozen base

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::Result;
use crate::lora::{Adapter, LoraConfig, LoraPair};
use crate::model::{BaseModel, LoraDelta, ModelConfig, Runnable, StoredWeight};

struct TrainablePair {
    a: Var,
    b: Var,
}

/// Base weights frozen in their stored form, adapter factors held as [`Var`]s
///
/// The frozen weights are shared with the base (quantized ones stay
/// quantized). Each [`LoraModel::runnable`] attaches the factors on the
/// activation path, so a backward pass over its output reaches the factors
/// and nothing else.
pub struct LoraModel {
    config: ModelConfig,
    frozen: BTreeMap<String, StoredWeight>,
    dtype: DType,
    device: Device,
    lora: LoraConfig,
    base_model: String,
    layers: BTreeMap<String, TrainablePair>,
}

impl LoraModel {
    /// Fresh factors for every targeted sublayer
    ///
    /// `A` is Kaiming-uniform with bound `1/sqrt(in_features)`, `B` is zero, so
    /// the initial model reproduces the base exactly.
    pub fn init(base: &BaseModel, lora: &LoraConfig, dtype: DType, seed: u64) -> Result<Self> {
        lora.validate()?;
        let device = base.device().clone();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = BTreeMap::new();

        for (path, (out, inp)) in lora.resolve_targets(base)? {
            let bound = 1.0 / (inp as f32).sqrt();
            let values: Vec<f32> = (0..lora.rank * inp)
                .map(|_| rng.random_range(-bound..bound))
                .collect();
            let a = Tensor::from_vec(values, (lora.rank, inp), &device)?;
            let b = Tensor::zeros((out, lora.rank), DType::F32, &device)?;
            layers.insert(
                path,
                TrainablePair {
                    a: Var::from_tensor(&a)?,
                    b: Var::from_tensor(&b)?,
                },
            );
        }

        debug!(layers = layers.len(), rank = lora.rank, "Initialized LoRA factors");
        Self::assemble(base, lora.clone(), dtype, layers)
    }

    /// Trainable copy of an existing adapter
    pub fn from_adapter(base: &BaseModel, adapter: &Adapter, dtype: DType) -> Result<Self> {
        adapter.check_compatible(base)?;
        let device = base.device();
        let layers = adapter
            .layers()
            .iter()
            .map(|(path, pair)| {
                let a = pair.a.to_device(device)?.to_dtype(DType::F32)?;
                let b = pair.b.to_device(device)?.to_dtype(DType::F32)?;
                Ok((
                    path.clone(),
                    TrainablePair {
                        a: Var::from_tensor(&a)?,
                        b: Var::from_tensor(&b)?,
                    },
                ))
            })
            .collect::<Result<_>>()?;
        Self::assemble(base, adapter.config().clone(), dtype, layers)
    }

    fn assemble(
        base: &BaseModel,
        lora: LoraConfig,
        dtype: DType,
        layers: BTreeMap<String, TrainablePair>,
    ) -> Result<Self> {
        Ok(Self {
            config: base.config().clone(),
            frozen: base.stored_weights().clone(),
            dtype,
            device: base.device().clone(),
            lora,
            base_model: base.id().to_string(),
            layers,
        })
    }

    /// Every trainable variable, `A` then `B` per layer
    pub fn vars(&self) -> Vec<Var> {
        self.layers
            .values()
            .flat_map(|p| [p.a.clone(), p.b.clone()])
            .collect()
    }

    pub fn num_trainable(&self) -> usize {
        self.layers
            .values()
            .map(|p| p.a.elem_count() + p.b.elem_count())
            .sum()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Build a forward-capable model from the current factor values
    ///
    /// With `dropout > 0` the inputs of every low-rank path go through
    /// dropout, with a fresh mask on each forward.
    pub fn runnable(&self, dropout: f32) -> Result<Runnable> {
        let deltas = self
            .layers
            .iter()
            .map(|(path, pair)| {
                let delta = LoraDelta {
                    a: pair.a.as_tensor().clone(),
                    b: pair.b.as_tensor().clone(),
                    scale: self.lora.scale(),
                    dropout,
                };
                (path.clone(), delta)
            })
            .collect();
        Runnable::build(&self.config, &self.frozen, &deltas, self.dtype, &self.device)
    }

    /// Whether any frozen weight is held block-quantized
    pub fn has_quantized_weights(&self) -> bool {
        self.frozen.values().any(StoredWeight::is_quantized)
    }

    /// Snapshot the factors as an immutable adapter
    pub fn to_adapter(&self) -> Result<Adapter> {
        let layers = self
            .layers
            .iter()
            .map(|(path, pair)| {
                let a = pair.a.as_tensor().copy()?.detach();
                let b = pair.b.as_tensor().copy()?.detach();
                Ok((path.clone(), LoraPair::new(a, b)?))
            })
            .collect::<Result<_>>()?;
        Adapter::new(self.lora.clone(), self.base_model.clone(), layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Merger;
    use crate::model::{LanguageModel, Precision};
    use crate::testing;

    #[test]
    fn test_fresh_adapter_reproduces_base() {
        let base = testing::tiny_base_model(Precision::full());
        let model = LoraModel::init(&base, &LoraConfig::default(), DType::F32, 7).unwrap();
        let ids = Tensor::new(&[[256u32, 40, 41]], &Device::Cpu).unwrap();

        let with_adapter = model.runnable(0.0).unwrap().forward(&ids, 0).unwrap();
        let plain = base.runnable().unwrap().forward(&ids, 0).unwrap();
        let diff = (with_adapter - plain)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_same_seed_same_init() {
        let base = testing::tiny_base_model(Precision::full());
        let config = LoraConfig::default();
        let x = LoraModel::init(&base, &config, DType::F32, 3).unwrap().to_adapter().unwrap();
        let y = LoraModel::init(&base, &config, DType::F32, 3).unwrap().to_adapter().unwrap();
        for (path, pair) in x.layers() {
            assert_eq!(
                pair.a.to_vec2::<f32>().unwrap(),
                y.layer(path).unwrap().a.to_vec2::<f32>().unwrap()
            );
        }
        assert_eq!(x.layers().len(), 14);
        let trainable = LoraModel::init(&base, &config, DType::F32, 3).unwrap();
        assert_eq!(x.num_parameters(), trainable.num_trainable());
    }

    #[test]
    fn test_gradients_reach_factors() {
        let base = testing::tiny_base_model(Precision::full());
        let model = LoraModel::init(&base, &LoraConfig::default(), DType::F32, 1).unwrap();
        let ids = Tensor::new(&[[256u32, 1, 2, 3]], &Device::Cpu).unwrap();
        let logits = model.runnable(0.0).unwrap().forward_all(&ids, 0).unwrap();
        let grads = logits.sqr().unwrap().sum_all().unwrap().backward().unwrap();

        // A gets an all-zero gradient while B is zero, but both must be tracked
        for var in model.vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        // B needs a nonzero gradient in every layer, attention projections included
        for (path, pair) in &model.layers {
            let grad = grads.get(pair.b.as_tensor()).unwrap();
            let norm = grad.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(norm > 0.0, "no gradient reaches B of {path}");
        }
    }

    #[test]
    fn test_quantized_base_stays_quantized_under_training() {
        let base = testing::tiny_base_model(Precision::four_bit());
        let model = LoraModel::init(&base, &LoraConfig::default(), DType::F32, 2).unwrap();
        assert!(model.has_quantized_weights());

        let ids = Tensor::new(&[[256u32, 5, 6]], &Device::Cpu).unwrap();
        let logits = model.runnable(0.0).unwrap().forward_all(&ids, 0).unwrap();
        assert_eq!(logits.dims(), &[1, 3, testing::VOCAB_SIZE]);
        let grads = logits.sum_all().unwrap().backward().unwrap();
        assert!(model.vars().iter().all(|v| grads.get(v.as_tensor()).is_some()));
    }

    #[test]
    fn test_snapshot_is_detached_from_vars() {
        let base = testing::tiny_base_model(Precision::full());
        let model = LoraModel::init(&base, &LoraConfig::default(), DType::F32, 1).unwrap();
        let snapshot = model.to_adapter().unwrap();
        let var = &model.vars()[1];
        var.set(&Tensor::ones(var.shape(), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let first = snapshot.layers().values().next().unwrap();
        assert_eq!(first.b.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_from_adapter_matches_composed() {
        let base = testing::tiny_base_model(Precision::full());
        let mut trained = LoraModel::init(&base, &LoraConfig::default(), DType::F32, 5).unwrap();
        for var in trained.vars() {
            let noise = Tensor::randn(0f32, 0.1, var.shape(), &Device::Cpu).unwrap();
            var.set(&noise).unwrap();
        }
        let adapter = trained.to_adapter().unwrap();
        trained = LoraModel::from_adapter(&base, &adapter, DType::F32).unwrap();

        let ids = Tensor::new(&[[256u32, 9, 8, 7]], &Device::Cpu).unwrap();
        let student = trained.runnable(0.0).unwrap().forward(&ids, 0).unwrap();
        let composed = Merger::compose(&base, &adapter)
            .unwrap()
            .runnable()
            .unwrap()
            .forward(&ids, 0)
            .unwrap();
        let diff = (student - composed)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "diff = {diff}");
    }
}
