//! Loading base models from local directories or the HuggingFace Hub

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{BaseModel, ModelConfig, WeightMap};
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.json";
const SINGLE_FILE: &str = "model.safetensors";
const INDEX_FILE: &str = "model.safetensors.index.json";

/// Where tensors live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlacement {
    #[default]
    Cpu,
    Cuda {
        ordinal: usize,
    },
    Metal {
        ordinal: usize,
    },
}

impl DevicePlacement {
    /// Acquire the device
    ///
    /// Fails with a resource error when the backend is unavailable, e.g. the
    /// binary was built without the matching feature.
    pub fn device(&self) -> Result<Device> {
        let device = match *self {
            Self::Cpu => Device::Cpu,
            Self::Cuda { ordinal } => Device::new_cuda(ordinal)
                .map_err(|e| Error::resource(format!("CUDA device {ordinal} unavailable: {e}")))?,
            Self::Metal { ordinal } => Device::new_metal(ordinal)
                .map_err(|e| Error::resource(format!("Metal device {ordinal} unavailable: {e}")))?,
        };
        info!(device = ?self, "Using device");
        Ok(device)
    }
}

/// Floating-point dtype forward passes run in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    #[default]
    F16,
    Bf16,
    F32,
}

impl ComputeDtype {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

/// Block quantization format for linear weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(non_camel_case_types)]
pub enum QuantType {
    Q4_0,
    Q4k,
    Q8_0,
    /// Normal-float 4-bit; accepted in configs so it can be rejected clearly
    Nf4,
}

/// Storage precision of a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precision {
    /// Storage bit width: 4, 8, 16 or 32
    pub bits: u8,
    /// Block format for 4/8-bit storage; defaults per bit width
    #[serde(default)]
    pub quant_type: Option<QuantType>,
    #[serde(default)]
    pub compute_dtype: ComputeDtype,
}

impl Default for Precision {
    fn default() -> Self {
        Self::half()
    }
}

impl Precision {
    /// 4-bit block quantized linear weights, f16 compute
    pub fn four_bit() -> Self {
        Self {
            bits: 4,
            quant_type: Some(QuantType::Q4_0),
            compute_dtype: ComputeDtype::F16,
        }
    }

    /// Dense f16 storage and compute
    pub fn half() -> Self {
        Self {
            bits: 16,
            quant_type: None,
            compute_dtype: ComputeDtype::F16,
        }
    }

    /// Dense f32 storage and compute
    pub fn full() -> Self {
        Self {
            bits: 32,
            quant_type: None,
            compute_dtype: ComputeDtype::F32,
        }
    }

    /// Reject unsupported bit width / format combinations
    pub fn validate(&self) -> Result<()> {
        match (self.bits, self.quant_type) {
            (_, Some(QuantType::Nf4)) => Err(Error::config(
                "quantization type nf4 is not supported, use q4_0 or q4k",
            )),
            (4, None | Some(QuantType::Q4_0) | Some(QuantType::Q4k)) => Ok(()),
            (8, None | Some(QuantType::Q8_0)) => Ok(()),
            (16 | 32, None) => Ok(()),
            (bits @ (4 | 8 | 16 | 32), Some(q)) => Err(Error::config(format!(
                "quantization type {q:?} does not match {bits}-bit storage"
            ))),
            (bits, _) => Err(Error::config(format!(
                "unsupported storage precision: {bits} bits (expected 4, 8, 16 or 32)"
            ))),
        }
    }

    /// Effective block format, if linear weights are quantized
    pub fn quant_type(&self) -> Option<QuantType> {
        match self.bits {
            4 => Some(self.quant_type.unwrap_or(QuantType::Q4_0)),
            8 => Some(self.quant_type.unwrap_or(QuantType::Q8_0)),
            _ => None,
        }
    }

    /// Dtype for tensors kept dense
    pub fn storage_dtype(&self) -> DType {
        match (self.bits, self.compute_dtype) {
            (32, _) => DType::F32,
            (16, ComputeDtype::Bf16) => DType::BF16,
            (16, _) => DType::F16,
            (_, compute) => compute.dtype(),
        }
    }
}

/// Resolved artifact files for one model
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    shards: Vec<PathBuf>,
}

/// Loads base models at a fixed precision and device
#[derive(Debug, Clone)]
pub struct ModelLoader {
    precision: Precision,
    placement: DevicePlacement,
}

impl ModelLoader {
    pub fn new(precision: Precision, placement: DevicePlacement) -> Self {
        Self {
            precision,
            placement,
        }
    }

    pub fn precision(&self) -> &Precision {
        &self.precision
    }

    /// Load a model from a local directory or a hub model id
    #[instrument(skip(self), fields(bits = self.precision.bits))]
    pub async fn load(&self, model_id: &str) -> Result<BaseModel> {
        self.precision.validate()?;
        let device = self.placement.device()?;

        let local = Path::new(model_id);
        let files = if local.is_dir() {
            Self::resolve_local(local)?
        } else {
            Self::resolve_hub(model_id).await?
        };

        let config_text = tokio::fs::read_to_string(&files.config).await?;
        let config = ModelConfig::from_json(&config_text)?;

        let mut weights = WeightMap::new();
        for shard in &files.shards {
            let tensors = candle_core::safetensors::load(shard, &Device::Cpu).map_err(|e| {
                Error::artifact(format!("failed to read {}: {e}", shard.display()))
            })?;
            debug!(shard = %shard.display(), tensors = tensors.len(), "Shard loaded");
            weights.extend(tensors);
        }
        if weights.is_empty() {
            return Err(Error::artifact(format!("model {model_id} contains no tensors")));
        }

        info!(model = model_id, tensors = weights.len(), "Model weights loaded");
        BaseModel::from_dense(model_id, config, weights, self.precision, device)
    }

    fn resolve_local(dir: &Path) -> Result<ModelFiles> {
        let config = dir.join(CONFIG_FILE);
        if !config.exists() {
            return Err(Error::artifact(format!(
                "missing {CONFIG_FILE} in {}",
                dir.display()
            )));
        }

        let index = dir.join(INDEX_FILE);
        let shards = if index.exists() {
            let text = std::fs::read_to_string(&index)?;
            shard_names(&text)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            let single = dir.join(SINGLE_FILE);
            if !single.exists() {
                return Err(Error::artifact(format!(
                    "missing {SINGLE_FILE} in {}",
                    dir.display()
                )));
            }
            vec![single]
        };

        Ok(ModelFiles { config, shards })
    }

    async fn resolve_hub(model_id: &str) -> Result<ModelFiles> {
        info!("Fetching model from HuggingFace Hub: {}", model_id);
        let api = Api::new()?;
        let repo = api.model(model_id.to_string());
        let config = repo.get(CONFIG_FILE).await?;

        let shards = match repo.get(INDEX_FILE).await {
            Ok(index) => {
                let text = tokio::fs::read_to_string(&index).await?;
                let mut shards = Vec::new();
                for name in shard_names(&text)? {
                    shards.push(repo.get(&name).await?);
                }
                shards
            }
            Err(e) => {
                warn!(error = %e, "No shard index, falling back to a single weights file");
                vec![repo.get(SINGLE_FILE).await?]
            }
        };

        Ok(ModelFiles { config, shards })
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Unique shard file names referenced by a safetensors index, in stable order
fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: ShardIndex = serde_json::from_str(index_json)
        .map_err(|e| Error::artifact(format!("malformed shard index: {e}")))?;
    let names: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(names.into_iter().collect())
}
