//! PEFT-compatible adapter artifacts
//!
//! An adapter directory holds `adapter_config.json` and
//! `adapter_model.safetensors` with keys of the form
//! `base_model.model.<module path>.lora_A.weight` / `lora_B.weight`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Adapter, LoraConfig, LoraPair, TaskType};
use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "adapter_config.json";
pub const WEIGHTS_FILE: &str = "adapter_model.safetensors";

const KEY_PREFIX: &str = "base_model.model.";

/// `adapter_config.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeftConfig {
    pub peft_type: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub inference_mode: bool,
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    pub base_model_name_or_path: String,
    #[serde(default)]
    pub revision: Option<String>,
}

fn default_bias() -> String {
    "none".to_string()
}

impl PeftConfig {
    fn from_adapter(adapter: &Adapter) -> Self {
        let config = adapter.config();
        Self {
            peft_type: "LORA".to_string(),
            task_type: config.task_type,
            inference_mode: true,
            r: config.rank,
            lora_alpha: config.alpha,
            lora_dropout: config.dropout,
            target_modules: config.target_modules.clone(),
            bias: default_bias(),
            modules_to_save: None,
            base_model_name_or_path: adapter.base_model().to_string(),
            revision: None,
        }
    }

    fn into_lora_config(self) -> Result<LoraConfig> {
        if self.peft_type != "LORA" {
            return Err(Error::artifact(format!(
                "unsupported adapter type {}",
                self.peft_type
            )));
        }
        let config = LoraConfig {
            rank: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules,
            task_type: self.task_type,
        };
        config
            .validate()
            .map_err(|e| Error::artifact(format!("invalid adapter config: {e}")))?;
        Ok(config)
    }
}

/// Write an adapter directory
pub fn save_adapter(adapter: &Adapter, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let config = PeftConfig::from_adapter(adapter);
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (path, pair) in adapter.layers() {
        tensors.insert(
            format!("{KEY_PREFIX}{path}.lora_A.weight"),
            pair.a.to_device(&Device::Cpu)?.contiguous()?,
        );
        tensors.insert(
            format!("{KEY_PREFIX}{path}.lora_B.weight"),
            pair.b.to_device(&Device::Cpu)?.contiguous()?,
        );
    }
    candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILE))?;

    info!(
        path = %dir.display(),
        layers = adapter.layers().len(),
        parameters = adapter.num_parameters(),
        "Adapter saved"
    );
    Ok(())
}

/// Read an adapter directory onto `device`
pub fn load_adapter(dir: &Path, device: &Device) -> Result<Adapter> {
    let config_path = dir.join(CONFIG_FILE);
    let weights_path = dir.join(WEIGHTS_FILE);
    if !config_path.exists() || !weights_path.exists() {
        return Err(Error::artifact(format!(
            "no adapter found in {} (expected {CONFIG_FILE} and {WEIGHTS_FILE})",
            dir.display()
        )));
    }

    let peft: PeftConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
        .map_err(|e| Error::artifact(format!("malformed {CONFIG_FILE}: {e}")))?;
    let base_model = peft.base_model_name_or_path.clone();
    let config = peft.into_lora_config()?;

    let tensors = candle_core::safetensors::load(&weights_path, device)
        .map_err(|e| Error::artifact(format!("failed to read {WEIGHTS_FILE}: {e}")))?;

    let mut a_factors = BTreeMap::new();
    let mut b_factors = BTreeMap::new();
    for (key, tensor) in tensors {
        let path = key.strip_prefix(KEY_PREFIX).unwrap_or(&key);
        if let Some(module) = path.strip_suffix(".lora_A.weight") {
            a_factors.insert(module.to_string(), tensor);
        } else if let Some(module) = path.strip_suffix(".lora_B.weight") {
            b_factors.insert(module.to_string(), tensor);
        } else {
            debug!(key = %key, "Ignoring non-LoRA tensor");
        }
    }

    let mut layers = BTreeMap::new();
    for (module, a) in a_factors {
        let b = b_factors
            .remove(&module)
            .ok_or_else(|| Error::artifact(format!("layer {module} has lora_A but no lora_B")))?;
        layers.insert(module, LoraPair::new(a, b)?);
    }
    if let Some(module) = b_factors.keys().next() {
        return Err(Error::artifact(format!(
            "layer {module} has lora_B but no lora_A"
        )));
    }
    if layers.is_empty() {
        return Err(Error::artifact(format!(
            "adapter in {} has no LoRA layers",
            dir.display()
        )));
    }

    info!(path = %dir.display(), layers = layers.len(), "Adapter loaded");
    Adapter::new(config, base_model, layers)
}
