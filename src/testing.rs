//! Shared test fixtures: a tiny random Gemma, a corpus and a byte-level codec
//!
//! Compiled for unit tests and, behind the `testing` feature, for the
//! integration tests under `tests/`.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::corpus::{Example, Label};
use crate::error::Result;
use crate::model::{saver, BaseModel, ModelConfig, Precision, WeightMap};
use crate::prompt::{BOS, END_OF_TURN, EOS, START_OF_TURN};
use crate::tokenizer::TokenCodec;

pub const VOCAB_SIZE: usize = 260;
pub const HIDDEN: usize = 32;
pub const INTERMEDIATE: usize = 64;
pub const LAYERS: usize = 2;

const SPECIALS: [&str; 4] = [BOS, EOS, START_OF_TURN, END_OF_TURN];

pub fn tiny_config_json() -> serde_json::Value {
    serde_json::json!({
        "architectures": ["GemmaForCausalLM"],
        "attention_bias": false,
        "head_dim": 8,
        "hidden_act": "gelu",
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_attention_heads": 4,
        "num_hidden_layers": LAYERS,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-6,
        "rope_theta": 10000.0,
        "vocab_size": VOCAB_SIZE,
        "max_position_embeddings": 512
    })
}

/// Config plus random weights for the tiny model
pub fn tiny_model_parts() -> (ModelConfig, WeightMap) {
    let config = ModelConfig::from_value(tiny_config_json()).unwrap();
    let device = Device::Cpu;
    let rand = |dims: (usize, usize)| Tensor::randn(0f32, 0.05, dims, &device).unwrap();
    let zeros = |n: usize| Tensor::zeros(n, DType::F32, &device).unwrap();

    let mut weights = WeightMap::new();
    weights.insert("model.embed_tokens.weight".into(), rand((VOCAB_SIZE, HIDDEN)));
    weights.insert("model.norm.weight".into(), zeros(HIDDEN));
    for i in 0..LAYERS {
        let p = format!("model.layers.{i}");
        weights.insert(format!("{p}.self_attn.q_proj.weight"), rand((32, HIDDEN)));
        weights.insert(format!("{p}.self_attn.k_proj.weight"), rand((16, HIDDEN)));
        weights.insert(format!("{p}.self_attn.v_proj.weight"), rand((16, HIDDEN)));
        weights.insert(format!("{p}.self_attn.o_proj.weight"), rand((HIDDEN, 32)));
        weights.insert(format!("{p}.mlp.gate_proj.weight"), rand((INTERMEDIATE, HIDDEN)));
        weights.insert(format!("{p}.mlp.up_proj.weight"), rand((INTERMEDIATE, HIDDEN)));
        weights.insert(format!("{p}.mlp.down_proj.weight"), rand((HIDDEN, INTERMEDIATE)));
        weights.insert(format!("{p}.input_layernorm.weight"), zeros(HIDDEN));
        weights.insert(format!("{p}.post_attention_layernorm.weight"), zeros(HIDDEN));
    }
    (config, weights)
}

pub fn tiny_base_model(precision: Precision) -> BaseModel {
    let (config, weights) = tiny_model_parts();
    BaseModel::from_dense("tiny-gemma", config, weights, precision, Device::Cpu).unwrap()
}

/// Write the tiny model to `dir/tiny-gemma` as a loadable model directory
pub fn write_tiny_model(dir: &Path) -> PathBuf {
    let (config, weights) = tiny_model_parts();
    let model_dir = dir.join("tiny-gemma");
    saver::save_dense(&model_dir, &config, &weights).unwrap();
    model_dir
}

/// Write train and validation JSONL splits to `dir/sst2`
pub fn write_corpus(dir: &Path) -> PathBuf {
    let corpus_dir = dir.join("sst2");
    std::fs::create_dir_all(&corpus_dir).unwrap();
    let train = [
        ("a gripping, beautifully acted story", 1),
        ("dull and lifeless", 0),
        ("a joy to watch", 1),
        ("painfully slow and predictable", 0),
    ];
    let validation = [("warm and funny", 1), ("a tedious mess", 0), ("forgettable", 0)];

    let render = |rows: &[(&str, i64)]| {
        rows.iter()
            .map(|(s, l)| serde_json::json!({ "sentence": s, "label": l }).to_string())
            .collect::<Vec<_>>()
            .join("\n")
    };
    std::fs::write(corpus_dir.join("train.jsonl"), render(&train)).unwrap();
    std::fs::write(corpus_dir.join("validation.jsonl"), render(&validation)).unwrap();
    corpus_dir
}

pub fn labeled_examples() -> Vec<Example> {
    vec![
        Example::labeled("a gripping story", Label::Positive),
        Example::labeled("dull and lifeless", Label::Negative),
        Example::labeled("a joy to watch", Label::Positive),
        Example::labeled("painfully slow", Label::Negative),
    ]
}

/// Bytes map to ids 0..256; chat markers get the ids after that
pub struct ByteCodec;

impl TokenCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let mut rest = text;
        'outer: while !rest.is_empty() {
            for (i, special) in SPECIALS.iter().enumerate() {
                if let Some(tail) = rest.strip_prefix(special) {
                    ids.push(256 + i as u32);
                    rest = tail;
                    continue 'outer;
                }
            }
            let ch = rest.chars().next().unwrap_or_default();
            let mut buf = [0u8; 4];
            ids.extend(ch.encode_utf8(&mut buf).bytes().map(u32::from));
            rest = &rest[ch.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < 256)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        SPECIALS
            .iter()
            .position(|s| *s == token)
            .map(|i| 256 + i as u32)
    }
}

#[test]
fn test_byte_codec_markers() {
    let codec = ByteCodec;
    let ids = codec.encode("<bos>hi<eos>").unwrap();
    assert_eq!(ids, vec![256, 104, 105, 257]);
    assert_eq!(codec.decode(&ids).unwrap(), "hi");
    assert_eq!(codec.stop_token_ids(), vec![257, 259]);
}
