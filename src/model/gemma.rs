//! Gemma decoder with adapter hooks on every linear projection
//!
//! The layout follows `candle_transformers::models::gemma`, but every op on
//! the path from the projections to the logits has a backward pass: rotary
//! embeddings go through `rope_slow` and attention through `ops::softmax`.
//! Linear weights stay in their stored form and are dequantized per forward,
//! while low-rank updates are applied on the input activations.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::rotary_emb::rope_slow;
use candle_nn::Activation;
use candle_transformers::utils::repeat_kv;

use super::{ModelConfig, StoredWeight};
use crate::error::{Error, Result};

/// Low-rank update `scale · B · A` attached to one linear module
#[derive(Debug, Clone)]
pub struct LoraDelta {
    /// Down projection, shape `(r, in_features)`
    pub a: Tensor,
    /// Up projection, shape `(out_features, r)`
    pub b: Tensor,
    pub scale: f64,
    /// Dropout on the inputs of the low-rank path
    pub dropout: f32,
}

fn missing(name: &str) -> Error {
    Error::artifact(format!("weights do not fit the architecture: missing {name}"))
}

/// Pulls named tensors out of the stored map and tracks adapter use
struct WeightSource<'a> {
    weights: &'a BTreeMap<String, StoredWeight>,
    deltas: &'a BTreeMap<String, LoraDelta>,
    dtype: DType,
    device: &'a Device,
    attached: usize,
}

impl WeightSource<'_> {
    fn dense(&self, name: &str) -> Result<Tensor> {
        self.weights
            .get(name)
            .ok_or_else(|| missing(name))?
            .dense(self.dtype, self.device)
    }

    fn linear(&mut self, path: &str, in_features: usize, out_features: usize) -> Result<Linear> {
        let name = format!("{path}.weight");
        let stored = self.weights.get(&name).ok_or_else(|| missing(&name))?;
        if stored.dims() != [out_features, in_features] {
            return Err(Error::artifact(format!(
                "weights do not fit the architecture: {name} has shape {:?}, expected {:?}",
                stored.dims(),
                [out_features, in_features]
            )));
        }

        let weight = match stored {
            StoredWeight::Dense(t) => {
                StoredWeight::Dense(t.to_device(self.device)?.to_dtype(self.dtype)?)
            }
            quantized => quantized.clone(),
        };

        let delta = match self.deltas.get(path) {
            Some(delta) => {
                let (r, a_in) = delta.a.dims2()?;
                let (b_out, b_r) = delta.b.dims2()?;
                if a_in != in_features || b_out != out_features || b_r != r {
                    return Err(Error::artifact(format!(
                        "adapter factors for {path} do not fit a ({out_features}, {in_features}) weight"
                    )));
                }
                self.attached += 1;
                Some(delta.clone())
            }
            None => None,
        };

        Ok(Linear {
            weight,
            delta,
            dtype: self.dtype,
            device: self.device.clone(),
        })
    }
}

/// Frozen linear projection, optionally carrying a low-rank update
#[derive(Debug, Clone)]
struct Linear {
    weight: StoredWeight,
    delta: Option<LoraDelta>,
    dtype: DType,
    device: Device,
}

impl Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = self.weight.dense(self.dtype, &self.device)?;
        let ys = xs.broadcast_matmul(&w.t()?)?;
        let Some(delta) = &self.delta else {
            return Ok(ys);
        };

        let h = if delta.dropout > 0.0 {
            candle_nn::ops::dropout(xs, delta.dropout)?
        } else {
            xs.clone()
        };
        let a = delta.a.to_dtype(self.dtype)?;
        let b = delta.b.to_dtype(self.dtype)?;
        let update = h.broadcast_matmul(&a.t()?)?.broadcast_matmul(&b.t()?)?;
        Ok((ys + (update * delta.scale)?)?)
    }
}

/// Gemma RMS norm; the stored scale is an offset from one
#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(weight: Tensor, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: (weight + 1.0)?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(normed.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(dim: usize, max_positions: usize, theta: f64, dtype: DType, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let q = rope_slow(&q.contiguous()?, &cos, &sin)?;
        let k = rope_slow(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.act.forward(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn forward(
        &mut self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        rotary: &RotaryEmbedding,
    ) -> Result<Tensor> {
        let (b, q_len, _) = xs.dims3()?;
        let dtype = xs.dtype();

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, offset)?;

        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let groups = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, groups)?.contiguous()?;
        let v = repeat_kv(v, groups)?.contiguous()?;

        let scale = 1f64 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.to_dtype(DType::F32)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, q_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn forward(
        &mut self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        rotary: &RotaryEmbedding,
    ) -> Result<Tensor> {
        let residual = xs;
        let h = self.input_layernorm.forward(xs)?;
        let h = self.self_attn.forward(&h, mask, offset, rotary)?;
        let xs = (h + residual)?;
        let residual = &xs;
        let h = self.post_attention_layernorm.forward(&xs)?;
        let h = self.mlp.forward(&h)?;
        Ok((h + residual)?)
    }
}

/// Gemma causal LM with a tied output head
#[derive(Debug, Clone)]
pub struct GemmaDecoder {
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    hidden_size: usize,
    device: Device,
}

impl GemmaDecoder {
    /// Assemble the decoder from stored weights and per-module adapter updates
    ///
    /// `deltas` is keyed by module path (`model.layers.0.self_attn.q_proj`).
    /// An update whose path matches no linear module is an artifact error.
    pub fn new(
        config: &ModelConfig,
        weights: &BTreeMap<String, StoredWeight>,
        deltas: &BTreeMap<String, LoraDelta>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let cfg = config.gemma();
        let act = match (cfg.hidden_act, cfg.hidden_activation) {
            (Some(act), None) | (None, Some(act)) => act,
            (Some(_), Some(_)) => {
                return Err(Error::artifact(
                    "both hidden_act and hidden_activation are set",
                ))
            }
            (None, None) => {
                return Err(Error::artifact(
                    "none of hidden_act and hidden_activation are set",
                ))
            }
        };
        if cfg.num_key_value_heads == 0 || cfg.num_attention_heads % cfg.num_key_value_heads != 0 {
            return Err(Error::artifact(format!(
                "{} attention heads cannot be grouped over {} key/value heads",
                cfg.num_attention_heads, cfg.num_key_value_heads
            )));
        }

        let mut source = WeightSource {
            weights,
            deltas,
            dtype,
            device,
            attached: 0,
        };

        let hidden = cfg.hidden_size;
        let q_out = cfg.num_attention_heads * cfg.head_dim;
        let kv_out = cfg.num_key_value_heads * cfg.head_dim;

        let embed_tokens = source.dense("model.embed_tokens.weight")?;
        if embed_tokens.dims() != [cfg.vocab_size, hidden] {
            return Err(Error::artifact(format!(
                "weights do not fit the architecture: embeddings have shape {:?}",
                embed_tokens.dims()
            )));
        }

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            let p = format!("model.layers.{i}");
            let self_attn = Attention {
                q_proj: source.linear(&format!("{p}.self_attn.q_proj"), hidden, q_out)?,
                k_proj: source.linear(&format!("{p}.self_attn.k_proj"), hidden, kv_out)?,
                v_proj: source.linear(&format!("{p}.self_attn.v_proj"), hidden, kv_out)?,
                o_proj: source.linear(&format!("{p}.self_attn.o_proj"), q_out, hidden)?,
                num_heads: cfg.num_attention_heads,
                num_kv_heads: cfg.num_key_value_heads,
                head_dim: cfg.head_dim,
                kv_cache: None,
            };
            let inter = cfg.intermediate_size;
            let mlp = Mlp {
                gate_proj: source.linear(&format!("{p}.mlp.gate_proj"), hidden, inter)?,
                up_proj: source.linear(&format!("{p}.mlp.up_proj"), hidden, inter)?,
                down_proj: source.linear(&format!("{p}.mlp.down_proj"), inter, hidden)?,
                act,
            };
            layers.push(DecoderLayer {
                self_attn,
                mlp,
                input_layernorm: RmsNorm::new(
                    source.dense(&format!("{p}.input_layernorm.weight"))?,
                    cfg.rms_norm_eps,
                )?,
                post_attention_layernorm: RmsNorm::new(
                    source.dense(&format!("{p}.post_attention_layernorm.weight"))?,
                    cfg.rms_norm_eps,
                )?,
            });
        }

        if source.attached != deltas.len() {
            let unknown: Vec<&str> = deltas
                .keys()
                .filter(|path| !weights.contains_key(&format!("{path}.weight")))
                .map(String::as_str)
                .collect();
            return Err(Error::artifact(format!(
                "adapter targets modules the model does not have: {unknown:?}"
            )));
        }

        let norm = RmsNorm::new(source.dense("model.norm.weight")?, cfg.rms_norm_eps)?;
        let rotary = RotaryEmbedding::new(
            cfg.head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            dtype,
            device,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            hidden_size: hidden,
            device: device.clone(),
        })
    }

    fn causal_mask(&self, tgt_len: usize, offset: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..tgt_len)
            .flat_map(|i| (0..tgt_len).map(move |j| if i < j { f32::NEG_INFINITY } else { 0. }))
            .collect();
        let mask = Tensor::from_slice(&mask, (tgt_len, tgt_len), &self.device)?;
        if offset == 0 {
            return Ok(mask);
        }
        let prefix = Tensor::zeros((tgt_len, offset), DType::F32, &self.device)?;
        Ok(Tensor::cat(&[&prefix, &mask], D::Minus1)?)
    }

    /// Final hidden states, shape `(batch, seq, hidden)`
    fn hidden_states(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let (b, seq_len) = input_ids.dims2()?;
        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len, offset)?)
        } else {
            None
        };

        let mut xs = self
            .embed_tokens
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, seq_len, self.hidden_size))?;
        xs = (xs * (self.hidden_size as f64).sqrt())?;

        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref(), offset, &self.rotary)?;
        }
        self.norm.forward(&xs)
    }

    /// Logits for every position, shape `(batch, seq, vocab)`
    pub fn forward_all(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let xs = self.hidden_states(input_ids, offset)?;
        Ok(xs.broadcast_matmul(&self.embed_tokens.t()?)?)
    }

    /// Logits for the last position, shape `(batch, vocab)`
    pub fn forward(&mut self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let xs = self.hidden_states(input_ids, offset)?;
        let last = xs.dim(1)? - 1;
        let xs = xs.narrow(1, last, 1)?.squeeze(1)?;
        Ok(xs.matmul(&self.embed_tokens.t()?)?)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.kv_cache = None;
        }
    }
}
