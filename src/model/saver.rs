//! Persisting dense models

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::info;

use super::{ModelConfig, WeightMap};
use crate::error::Result;

/// Write `config.json` and `model.safetensors` into `dir`
///
/// The directory is created if needed; existing files are overwritten.
pub fn save_dense(dir: &Path, config: &ModelConfig, weights: &WeightMap) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut raw = config.raw().clone();
    if let (Some(obj), Some(first)) = (raw.as_object_mut(), weights.values().next()) {
        obj.insert(
            "torch_dtype".to_string(),
            serde_json::Value::String(torch_dtype_name(first)),
        );
    }
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&raw)?)?;

    let tensors = weights
        .iter()
        .map(|(name, t)| Ok((name.clone(), t.to_device(&Device::Cpu)?.contiguous()?)))
        .collect::<Result<HashMap<String, Tensor>>>()?;
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;

    info!(path = %dir.display(), tensors = tensors.len(), "Model saved");
    Ok(())
}

fn torch_dtype_name(tensor: &Tensor) -> String {
    match tensor.dtype() {
        candle_core::DType::F16 => "float16",
        candle_core::DType::BF16 => "bfloat16",
        _ => "float32",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::TempDir;

    #[test]
    fn test_save_writes_both_files() {
        let dir = TempDir::new().unwrap();
        let (config, weights) = testing::tiny_model_parts();
        save_dense(dir.path(), &config, &weights).unwrap();

        assert!(dir.path().join("config.json").exists());
        let loaded =
            candle_core::safetensors::load(dir.path().join("model.safetensors"), &Device::Cpu)
                .unwrap();
        assert_eq!(loaded.len(), weights.len());

        let text = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        let reparsed = ModelConfig::from_json(&text).unwrap();
        assert_eq!(reparsed.vocab_size(), config.vocab_size());
    }
}
