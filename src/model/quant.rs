//! Block quantization of linear weights

use std::sync::Arc;

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use tracing::warn;

use super::loader::QuantType;
use crate::error::{Error, Result};

/// A stored weight, either dense or block quantized
#[derive(Debug, Clone)]
pub enum StoredWeight {
    Dense(Tensor),
    Quantized(Arc<QTensor>),
}

impl StoredWeight {
    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Dense(t) => t.dims(),
            Self::Quantized(q) => q.shape().dims(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Dense tensor in `dtype` on `device`
    pub fn dense(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let tensor = match self {
            Self::Dense(t) => t.to_device(device)?.to_dtype(dtype)?,
            Self::Quantized(q) => q.dequantize(device)?.to_dtype(dtype)?,
        };
        Ok(tensor)
    }
}

impl QuantType {
    /// GGML block format backing this quantization type
    pub fn ggml(self) -> Result<GgmlDType> {
        match self {
            Self::Q4_0 => Ok(GgmlDType::Q4_0),
            Self::Q4k => Ok(GgmlDType::Q4K),
            Self::Q8_0 => Ok(GgmlDType::Q8_0),
            Self::Nf4 => Err(Error::config("quantization type nf4 is not supported")),
        }
    }
}

/// Quantize one weight
///
/// The row length must be a multiple of the block size; weights that are not
/// block-aligned are kept dense (f32) with a warning.
pub fn quantize(name: &str, tensor: &Tensor, qtype: QuantType) -> Result<StoredWeight> {
    let ggml = qtype.ggml()?;
    let block = ggml.block_size();
    let row = tensor.dims().last().copied().unwrap_or(0);

    if row == 0 || row % block != 0 {
        warn!(
            weight = name,
            row,
            block,
            "Weight not block-aligned, keeping it dense"
        );
        return Ok(StoredWeight::Dense(tensor.to_dtype(DType::F32)?));
    }

    let source = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let qtensor = QTensor::quantize(&source, ggml)?;
    Ok(StoredWeight::Quantized(Arc::new(qtensor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_roundtrip_error_is_small() {
        let weight = Tensor::randn(0f32, 0.02, (16, 64), &Device::Cpu).unwrap();
        let stored = quantize("w", &weight, QuantType::Q8_0).unwrap();
        assert!(stored.is_quantized());
        assert_eq!(stored.dims(), &[16, 64]);

        let restored = stored.dense(DType::F32, &Device::Cpu).unwrap();
        let err = (weight - restored)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(err < 1e-3, "max error {err}");
    }

    #[test]
    fn test_unaligned_weight_stays_dense() {
        let weight = Tensor::ones((4, 20), DType::F32, &Device::Cpu).unwrap();
        let stored = quantize("w", &weight, QuantType::Q4_0).unwrap();
        assert!(!stored.is_quantized());
    }

    #[test]
    fn test_nf4_rejected() {
        assert!(QuantType::Nf4.ggml().is_err());
    }
}
