//! LoRA adapter configuration and parameters
//!
//! An adapter stores one low-rank pair per targeted linear sublayer:
//! `A` with shape `(rank, in_features)` and `B` with shape `(out_features, rank)`.
//! The sublayer's effective weight is `W + (alpha / rank) * B @ A`.

pub mod peft;

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{module_leaf, BaseModel};

/// Task the adapter is trained for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Next-token prediction
    #[default]
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CausalLm => "CAUSAL_LM",
        }
    }
}

/// LoRA hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoraConfig {
    /// Rank of the low-rank factors
    pub rank: usize,
    /// Scaling numerator; the applied scale is `alpha / rank`
    pub alpha: f32,
    /// Dropout probability on the adapter path during training
    pub dropout: f32,
    /// Sublayer names (last path segment) the adapter attaches to
    pub target_modules: Vec<String>,
    pub task_type: TaskType,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 6,
            alpha: 8.0,
            dropout: 0.05,
            target_modules: [
                "q_proj",
                "o_proj",
                "k_proj",
                "v_proj",
                "gate_proj",
                "up_proj",
                "down_proj",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            task_type: TaskType::CausalLm,
        }
    }
}

impl LoraConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::config("LoRA rank must be positive"));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(Error::config(format!(
                "LoRA alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!(
                "LoRA dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(Error::config("LoRA target_modules must not be empty"));
        }
        if self.target_modules.iter().any(|m| m.trim().is_empty()) {
            return Err(Error::config("LoRA target_modules contains an empty name"));
        }
        Ok(())
    }

    pub fn scale(&self) -> f64 {
        f64::from(self.alpha) / self.rank as f64
    }

    /// Linear sublayers of `base` selected by `target_modules`
    ///
    /// Returns `(module path, (out_features, in_features))`; matching none is a
    /// configuration error.
    pub fn resolve_targets(&self, base: &BaseModel) -> Result<Vec<(String, (usize, usize))>> {
        let targets: Vec<_> = base
            .linear_modules()
            .into_iter()
            .filter(|(path, _)| {
                let leaf = module_leaf(path);
                self.target_modules.iter().any(|t| t == leaf)
            })
            .collect();
        if targets.is_empty() {
            return Err(Error::config(format!(
                "no sublayer of {} matches target modules {:?}",
                base.id(),
                self.target_modules
            )));
        }
        Ok(targets)
    }
}

/// Low-rank factors for one sublayer
#[derive(Debug, Clone)]
pub struct LoraPair {
    /// Down projection, `(rank, in_features)`
    pub a: Tensor,
    /// Up projection, `(out_features, rank)`
    pub b: Tensor,
}

impl LoraPair {
    pub fn new(a: Tensor, b: Tensor) -> Result<Self> {
        let (rank, _) = a.dims2()?;
        let (_, rank_b) = b.dims2()?;
        if rank != rank_b {
            return Err(Error::artifact(format!(
                "LoRA factor ranks disagree: A has {rank}, B has {rank_b}"
            )));
        }
        Ok(Self { a, b })
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    /// `(out_features, in_features)` of the sublayer this pair adapts
    pub fn target_dims(&self) -> (usize, usize) {
        (self.b.dims()[0], self.a.dims()[1])
    }

    pub fn num_parameters(&self) -> usize {
        self.a.elem_count() + self.b.elem_count()
    }
}

/// `scale * B @ A`, computed in f32
pub fn delta(a: &Tensor, b: &Tensor, scale: f64) -> Result<Tensor> {
    let a = a.to_dtype(DType::F32)?;
    let b = b.to_dtype(DType::F32)?;
    Ok((b.matmul(&a)? * scale)?)
}

/// `W + scale * B @ A`, returned in the dtype of `weight`
pub fn fold(weight: &Tensor, a: &Tensor, b: &Tensor, scale: f64) -> Result<Tensor> {
    let dtype = weight.dtype();
    let update = delta(a, b, scale)?.to_device(weight.device())?;
    Ok((weight.to_dtype(DType::F32)? + update)?.to_dtype(dtype)?)
}

/// A trained (or loaded) LoRA adapter
#[derive(Debug, Clone)]
pub struct Adapter {
    config: LoraConfig,
    base_model: String,
    layers: BTreeMap<String, LoraPair>,
}

impl Adapter {
    pub fn new(
        config: LoraConfig,
        base_model: impl Into<String>,
        layers: BTreeMap<String, LoraPair>,
    ) -> Result<Self> {
        if let Some((name, pair)) = layers.iter().find(|(_, p)| p.rank() != config.rank) {
            return Err(Error::artifact(format!(
                "layer {name} has rank {} but the adapter declares {}",
                pair.rank(),
                config.rank
            )));
        }
        Ok(Self {
            config,
            base_model: base_model.into(),
            layers,
        })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Identifier of the base model the adapter was trained on
    pub fn base_model(&self) -> &str {
        &self.base_model
    }

    pub fn layers(&self) -> &BTreeMap<String, LoraPair> {
        &self.layers
    }

    pub fn layer(&self, path: &str) -> Option<&LoraPair> {
        self.layers.get(path)
    }

    pub(crate) fn layer_mut(&mut self, path: &str) -> Option<&mut LoraPair> {
        self.layers.get_mut(path)
    }

    pub fn scale(&self) -> f64 {
        self.config.scale()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.values().map(LoraPair::num_parameters).sum()
    }

    /// Copy every factor to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .map(|(name, p)| {
                Ok((
                    name.clone(),
                    LoraPair {
                        a: p.a.to_device(device)?,
                        b: p.b.to_device(device)?,
                    },
                ))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            config: self.config.clone(),
            base_model: self.base_model.clone(),
            layers,
        })
    }

    /// Check every adapted layer exists in `base` with matching dimensions
    pub fn check_compatible(&self, base: &BaseModel) -> Result<()> {
        for (path, pair) in &self.layers {
            let name = format!("{path}.weight");
            let stored = base.stored(&name).ok_or_else(|| {
                Error::artifact(format!(
                    "adapter layer {path} has no counterpart in {}",
                    base.id()
                ))
            })?;
            let (out, inp) = pair.target_dims();
            if stored.dims() != [out, inp] {
                return Err(Error::artifact(format!(
                    "adapter layer {path} expects ({out}, {inp}) but {} has {:?}",
                    base.id(),
                    stored.dims()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Precision;
    use crate::testing;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config_matches_reference_run() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 6);
        assert_relative_eq!(config.scale(), 8.0 / 6.0);
        assert_eq!(config.target_modules.len(), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_targets_rejected() {
        let config = LoraConfig {
            target_modules: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_rank_and_dropout_rejected() {
        let zero_rank = LoraConfig {
            rank: 0,
            ..Default::default()
        };
        assert!(zero_rank.validate().is_err());
        let dropout = LoraConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(dropout.validate().is_err());
    }

    #[test]
    fn test_resolve_targets_filters_by_leaf() {
        let base = testing::tiny_base_model(Precision::full());
        let config = LoraConfig {
            target_modules: vec!["q_proj".into(), "down_proj".into()],
            ..Default::default()
        };
        let targets = config.resolve_targets(&base).unwrap();
        assert_eq!(targets.len(), 4);

        let none = LoraConfig {
            target_modules: vec!["not_a_layer".into()],
            ..Default::default()
        };
        assert!(matches!(none.resolve_targets(&base), Err(Error::Config(_))));
    }

    #[test]
    fn test_fold_with_zero_b_is_identity() {
        let device = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (4, 6), &device).unwrap();
        let a = Tensor::randn(0f32, 1.0, (2, 6), &device).unwrap();
        let b = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let folded = fold(&w, &a, &b, 2.0).unwrap();
        assert_eq!(
            folded.to_vec2::<f32>().unwrap(),
            w.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_fold_known_values() {
        let device = Device::Cpu;
        let w = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let a = Tensor::new(&[[1f32, 2.0]], &device).unwrap();
        let b = Tensor::new(&[[1f32], [3.0]], &device).unwrap();
        let folded = fold(&w, &a, &b, 0.5).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(folded, vec![vec![0.5, 1.0], vec![1.5, 3.0]]);
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let device = Device::Cpu;
        let a = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let b = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        assert!(LoraPair::new(a, b).is_err());
    }
}
