//! Unstructured L1 magnitude pruning
//!
//! Each prunable weight independently loses its smallest-magnitude entries:
//! with `n` entries and sparsity `s`, the `n - round((1 - s) * n)` entries of
//! smallest absolute value are set to zero, so at most `round((1 - s) * n)`
//! nonzero entries remain.

use std::cmp::Ordering;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::lora::Adapter;
use crate::merge::{ComposedModel, MergedModel};
use crate::model::is_linear_weight;

/// Fraction of entries to zero, in `[0, 1)`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Sparsity(f64);

impl Sparsity {
    pub fn new(value: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&value) {
            return Err(Error::config(format!(
                "sparsity must be in [0, 1), got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Entries kept out of `n`
    pub fn keep_count(self, n: usize) -> usize {
        (((1.0 - self.0) * n as f64).round() as usize).min(n)
    }
}

impl Default for Sparsity {
    fn default() -> Self {
        Self(0.5)
    }
}

impl TryFrom<f64> for Sparsity {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Sparsity> for f64 {
    fn from(s: Sparsity) -> Self {
        s.0
    }
}

/// Models whose linear weights can be pruned
pub trait Prunable {
    /// `(name, weight)` for every weight subject to pruning
    fn prunable_weights(&self) -> Vec<(String, Tensor)>;

    /// Replace a weight returned by [`Prunable::prunable_weights`]
    fn set_weight(&mut self, name: &str, weight: Tensor) -> Result<()>;
}

impl Prunable for Adapter {
    fn prunable_weights(&self) -> Vec<(String, Tensor)> {
        self.layers()
            .iter()
            .flat_map(|(path, pair)| {
                [
                    (format!("{path}.lora_A"), pair.a.clone()),
                    (format!("{path}.lora_B"), pair.b.clone()),
                ]
            })
            .collect()
    }

    fn set_weight(&mut self, name: &str, weight: Tensor) -> Result<()> {
        let unknown = || Error::artifact(format!("adapter has no factor {name}"));
        let (path, factor) = name.rsplit_once('.').ok_or_else(unknown)?;
        let pair = self.layer_mut(path).ok_or_else(unknown)?;
        match factor {
            "lora_A" => pair.a = weight,
            "lora_B" => pair.b = weight,
            _ => return Err(unknown()),
        }
        Ok(())
    }
}

/// Only the adapter factors are pruned; the shared base stays read-only
impl Prunable for ComposedModel {
    fn prunable_weights(&self) -> Vec<(String, Tensor)> {
        self.adapter().prunable_weights()
    }

    fn set_weight(&mut self, name: &str, weight: Tensor) -> Result<()> {
        self.adapter_mut().set_weight(name, weight)
    }
}

impl Prunable for MergedModel {
    fn prunable_weights(&self) -> Vec<(String, Tensor)> {
        self.weights()
            .iter()
            .filter(|(name, w)| is_linear_weight(name, w.dims()))
            .map(|(name, w)| (name.clone(), w.clone()))
            .collect()
    }

    fn set_weight(&mut self, name: &str, weight: Tensor) -> Result<()> {
        match self.weights_mut().get_mut(name) {
            Some(slot) => {
                *slot = weight;
                Ok(())
            }
            None => Err(Error::artifact(format!("merged model has no weight {name}"))),
        }
    }
}

/// Per-weight outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerPruneStats {
    pub name: String,
    pub total: usize,
    pub pruned: usize,
}

/// Outcome of a pruning pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub sparsity: Sparsity,
    pub layers: Vec<LayerPruneStats>,
}

impl PruneReport {
    pub fn total_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.total).sum()
    }

    pub fn total_pruned(&self) -> usize {
        self.layers.iter().map(|l| l.pruned).sum()
    }

    /// Fraction of prunable entries that were zeroed
    pub fn achieved_sparsity(&self) -> f64 {
        match self.total_parameters() {
            0 => 0.0,
            total => self.total_pruned() as f64 / total as f64,
        }
    }
}

/// Zero the `n - keep` smallest-magnitude entries of `weight`
///
/// Returns the pruned tensor (same shape, dtype and device) and the number of
/// entries zeroed. Ties are broken by position, lower index pruned first.
pub fn l1_unstructured(weight: &Tensor, sparsity: Sparsity) -> Result<(Tensor, usize)> {
    let n = weight.elem_count();
    let prune = n - sparsity.keep_count(n);
    if prune == 0 {
        return Ok((weight.clone(), 0));
    }

    let magnitudes: Vec<f32> = weight
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .abs()?
        .to_vec1()?;
    let mut order: Vec<usize> = (0..n).collect();
    let by_magnitude = |&i: &usize, &j: &usize| {
        magnitudes[i]
            .partial_cmp(&magnitudes[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    };
    if prune < n {
        order.select_nth_unstable_by(prune, by_magnitude);
    }

    let mut mask = vec![1f32; n];
    for &i in &order[..prune] {
        mask[i] = 0.0;
    }
    let mask = Tensor::from_vec(mask, weight.shape(), weight.device())?.to_dtype(weight.dtype())?;
    Ok((weight.mul(&mask)?, prune))
}

/// Applies L1 unstructured pruning at a fixed sparsity
#[derive(Debug, Clone, Copy)]
pub struct Pruner {
    sparsity: Sparsity,
}

impl Pruner {
    /// Rejects sparsity outside `[0, 1)` as a configuration error
    pub fn new(sparsity: f64) -> Result<Self> {
        Ok(Self {
            sparsity: Sparsity::new(sparsity)?,
        })
    }

    pub fn sparsity(&self) -> Sparsity {
        self.sparsity
    }

    /// Pruned copy of `model`; the input is left unchanged
    #[instrument(skip_all, fields(sparsity = self.sparsity.value()))]
    pub fn prune<P: Prunable + Clone>(&self, model: &P) -> Result<(P, PruneReport)> {
        let mut pruned = model.clone();
        let report = self.prune_in_place(&mut pruned)?;
        Ok((pruned, report))
    }

    /// Prune `model` in place, replacing each prunable weight
    pub fn prune_in_place<P: Prunable>(&self, model: &mut P) -> Result<PruneReport> {
        let mut layers = Vec::new();
        for (name, weight) in model.prunable_weights() {
            let (masked, pruned) = l1_unstructured(&weight, self.sparsity)?;
            debug!(weight = %name, total = weight.elem_count(), pruned, "Pruned");
            model.set_weight(&name, masked)?;
            layers.push(LayerPruneStats {
                total: weight.elem_count(),
                name,
                pruned,
            });
        }

        let report = PruneReport {
            sparsity: self.sparsity,
            layers,
        };
        info!(
            weights = report.layers.len(),
            pruned = report.total_pruned(),
            achieved = format!("{:.4}", report.achieved_sparsity()),
            "Pruning complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{LoraConfig, LoraPair};
    use crate::merge::Merger;
    use crate::model::Precision;
    use crate::testing;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn count_nonzero(t: &Tensor) -> usize {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .filter(|v| **v != 0.0)
            .count()
    }

    fn adapter_for(base: &crate::model::BaseModel) -> Adapter {
        let config = LoraConfig {
            rank: 2,
            ..Default::default()
        };
        let mut layers = BTreeMap::new();
        for (path, (out, inp)) in config.resolve_targets(base).unwrap() {
            let a = Tensor::randn(0f32, 1.0, (2, inp), &Device::Cpu).unwrap();
            let b = Tensor::randn(0f32, 1.0, (out, 2), &Device::Cpu).unwrap();
            layers.insert(path, LoraPair::new(a, b).unwrap());
        }
        Adapter::new(config, base.id(), layers).unwrap()
    }

    #[test]
    fn test_sparsity_bounds() {
        assert!(Sparsity::new(0.0).is_ok());
        assert!(Sparsity::new(0.99).is_ok());
        assert!(matches!(Sparsity::new(1.0), Err(Error::Config(_))));
        assert!(Sparsity::new(-0.1).is_err());
        assert!(Pruner::new(1.5).is_err());
    }

    #[test]
    fn test_smallest_magnitudes_zeroed() {
        let w = Tensor::new(&[[0.1f32, -3.0, 0.2], [2.0, -0.05, 1.0]], &Device::Cpu).unwrap();
        let (pruned, count) = l1_unstructured(&w, Sparsity::new(0.5).unwrap()).unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            pruned.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, -3.0, 0.0], vec![2.0, 0.0, 1.0]]
        );
    }

    #[test]
    fn test_zero_sparsity_is_identity() {
        let w = Tensor::randn(0f32, 1.0, (4, 4), &Device::Cpu).unwrap();
        let (pruned, count) = l1_unstructured(&w, Sparsity::new(0.0).unwrap()).unwrap();
        assert_eq!(count, 0);
        assert_eq!(pruned.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_prune_returns_new_value() {
        let base = testing::tiny_base_model(Precision::full());
        let adapter = adapter_for(&base);
        let before = count_nonzero(&adapter.layers().values().next().unwrap().b);

        let (pruned, report) = Pruner::new(0.5).unwrap().prune(&adapter).unwrap();
        let after_original = count_nonzero(&adapter.layers().values().next().unwrap().b);
        assert_eq!(before, after_original);
        assert_eq!(report.layers.len(), 28);
        for pair in pruned.layers().values() {
            assert!(count_nonzero(&pair.a) <= pair.a.elem_count() / 2);
            assert!(count_nonzero(&pair.b) <= pair.b.elem_count() / 2);
        }
    }

    #[test]
    fn test_composed_prunes_adapter_only() {
        let base = testing::tiny_base_model(Precision::full());
        let composed = Merger::compose(&base, &adapter_for(&base)).unwrap();
        let (pruned, report) = Pruner::new(0.5).unwrap().prune(&composed).unwrap();
        assert!(report.layers.iter().all(|l| l.name.contains(".lora_")));
        let (base_after, _) = pruned.into_parts();
        let q = base_after
            .stored("model.layers.0.self_attn.q_proj.weight")
            .unwrap()
            .dense(DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(count_nonzero(&q), q.elem_count());
    }

    #[test]
    fn test_merged_in_place() {
        let base = testing::tiny_base_model(Precision::full());
        let mut merged = Merger::merge(&base, &adapter_for(&base)).unwrap();
        let report = Pruner::new(0.25).unwrap().prune_in_place(&mut merged).unwrap();
        assert_eq!(report.layers.len(), 14);
        let down = &merged.weights()["model.layers.1.mlp.down_proj.weight"];
        assert_eq!(count_nonzero(down), down.elem_count() * 3 / 4);
        let embed = &merged.weights()["model.embed_tokens.weight"];
        assert_eq!(count_nonzero(embed), embed.elem_count());
    }

    #[test]
    fn test_unknown_factor_rejected() {
        let base = testing::tiny_base_model(Precision::full());
        let mut adapter = adapter_for(&base);
        let w = Tensor::zeros((1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(adapter.set_weight("model.layers.9.self_attn.q_proj.lora_A", w.clone()).is_err());
        assert!(adapter.set_weight("nonsense", w).is_err());
    }

    proptest! {
        #[test]
        fn prop_nonzero_bounded_by_keep(
            values in prop::collection::vec(-10.0f32..10.0, 1..200),
            sparsity in 0.0f64..0.99,
        ) {
            let n = values.len();
            let w = Tensor::from_vec(values, n, &Device::Cpu).unwrap();
            let s = Sparsity::new(sparsity).unwrap();
            let (pruned, count) = l1_unstructured(&w, s).unwrap();
            let nonzero = pruned
                .to_vec1::<f32>()
                .unwrap()
                .iter()
                .filter(|v| **v != 0.0)
                .count();
            prop_assert!(nonzero <= s.keep_count(n));
            prop_assert_eq!(count, n - s.keep_count(n));
        }
    }
}
