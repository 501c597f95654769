//! Small synthetic checkpoints.
//!
//! Used by tests, benches and examples that need a real model directory
//! without downloading one. Two weight sets are available:
//!
//! - [`SyntheticCheckpoint::counting`]: hand-built weights whose greedy
//!   continuation of token `t` is `t + 1 (mod vocab)`
//! - [`SyntheticCheckpoint::random`]: seeded uniform weights
//!
//! Gemma checkpoints use separate Q/K/V and gate/up matrices; Phi-3 ones
//! use the fused `qkv_proj` and `gate_up_proj` layout, as the real exports do.

use super::sentencepiece::{
    encode_model_proto, Piece, PieceKind, SegmentationKind, SentencePieceModel,
    SENTENCEPIECE_FILE,
};
use super::{Architecture, ConfigDefaults, ModelConfig, ModelOptions, WeightTable};
use crate::error::Result;
use crate::quantization::{expand_columns, BIASES_SUFFIX, SCALES_SUFFIX};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::f32::consts::PI;
use std::fs;
use std::path::Path;

/// An in-memory checkpoint: `config.json` contents plus tensors.
#[derive(Debug, Clone)]
pub struct SyntheticCheckpoint {
    /// Architecture written to `architectures[0]`.
    pub architecture: Architecture,
    /// `config.json` contents.
    pub config_json: Value,
    /// Tensors by checkpoint name.
    pub tensors: HashMap<String, Tensor>,
}

impl SyntheticCheckpoint {
    /// Vocabulary size.
    pub const VOCAB: usize = 16;
    /// Hidden width.
    pub const HIDDEN: usize = 8;
    /// Transformer layers.
    pub const LAYERS: usize = 2;
    /// Query heads.
    pub const HEADS: usize = 2;
    /// Key/value heads.
    pub const KV_HEADS: usize = 1;
    /// Per-head width.
    pub const HEAD_DIM: usize = 4;
    /// MLP width.
    pub const INTERMEDIATE: usize = 16;
    /// End-of-sequence id.
    pub const EOS: u32 = 0;

    /// Weights that make greedy decoding count upwards.
    ///
    /// Token `t` embeds to `[cos a, cos a, sin a, sin a, -cos a, -cos a,
    /// -sin a, -sin a]` with `a = 2πt / vocab`. The MLP down projections are zero and the
    /// attention output projections are scaled to 1e-4, so the residual
    /// stream leaving the last block is the embedding of the last token
    /// up to a small perturbation. Row `v` of the output head is the
    /// embedding of `v - 1`, so the highest logit is the successor.
    pub fn counting(architecture: Architecture) -> Result<Self> {
        let device = Device::Cpu;
        let embed = counting_embeddings(&device)?;
        let head_rows: Vec<Tensor> = (0..Self::VOCAB)
            .map(|v| embed.get((v + Self::VOCAB - 1) % Self::VOCAB))
            .collect::<candle_core::Result<_>>()?;
        let lm_head = Tensor::stack(&head_rows, 0)?;

        let mut builder = Builder::new(architecture);
        builder.insert("model.embed_tokens.weight", embed);
        builder.insert("lm_head.weight", lm_head);
        builder.norm("model.norm")?;

        let q_width = Self::HEADS * Self::HEAD_DIM;
        let kv_width = Self::KV_HEADS * Self::HEAD_DIM;
        for i in 0..Self::LAYERS {
            let salt = i as f32 * 10.0;
            let q = pattern(q_width, Self::HIDDEN, 0.1, salt)?;
            let k = pattern(kv_width, Self::HIDDEN, 0.1, salt + 1.0)?;
            let v = pattern(kv_width, Self::HIDDEN, 0.1, salt + 2.0)?;
            let o = pattern(Self::HIDDEN, q_width, 1e-4, salt + 3.0)?;
            let gate = pattern(Self::INTERMEDIATE, Self::HIDDEN, 0.1, salt + 4.0)?;
            let up = pattern(Self::INTERMEDIATE, Self::HIDDEN, 0.1, salt + 5.0)?;
            let down = Tensor::zeros((Self::HIDDEN, Self::INTERMEDIATE), DType::F32, &device)?;
            builder.layer(i, [q, k, v, o], [gate, up, down])?;
        }
        Ok(builder.finish())
    }

    /// Seeded random weights; the same seed gives the same checkpoint.
    pub fn random(architecture: Architecture, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |rows: usize, cols: usize, scale: f32| -> Result<Tensor> {
            let data: Vec<f32> = (0..rows * cols)
                .map(|_| rng.gen_range(-scale..scale))
                .collect();
            Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
        };

        let mut builder = Builder::new(architecture);
        builder.insert("model.embed_tokens.weight", uniform(Self::VOCAB, Self::HIDDEN, 1.0)?);
        builder.insert("lm_head.weight", uniform(Self::VOCAB, Self::HIDDEN, 0.5)?);
        builder.norm("model.norm")?;

        let q_width = Self::HEADS * Self::HEAD_DIM;
        let kv_width = Self::KV_HEADS * Self::HEAD_DIM;
        for i in 0..Self::LAYERS {
            let attn = [
                uniform(q_width, Self::HIDDEN, 0.5)?,
                uniform(kv_width, Self::HIDDEN, 0.5)?,
                uniform(kv_width, Self::HIDDEN, 0.5)?,
                uniform(Self::HIDDEN, q_width, 0.3)?,
            ];
            let mlp = [
                uniform(Self::INTERMEDIATE, Self::HIDDEN, 0.3)?,
                uniform(Self::INTERMEDIATE, Self::HIDDEN, 0.3)?,
                uniform(Self::HIDDEN, Self::INTERMEDIATE, 0.3)?,
            ];
            builder.layer(i, attn, mlp)?;
        }
        Ok(builder.finish())
    }

    /// Replace every projection matrix with an affine-quantized triple
    /// (`.weight`, `.scales`, `.biases`) that dequantizes back to it.
    ///
    /// Groups are `group_size` columns wide with scale 2 and offset 0.5.
    /// The embedding table and output head are packed at half column width
    /// when their columns repeat in adjacent pairs (as in
    /// [`SyntheticCheckpoint::counting`]); loading expands them back to
    /// the hidden width.
    pub fn affine_quantized(mut self, group_size: usize) -> Result<Self> {
        let names: Vec<String> = self
            .tensors
            .keys()
            .filter(|n| n.ends_with("_proj.weight") || is_vocab_table(n))
            .cloned()
            .collect();
        for name in names {
            let mut weight = self.tensors[&name].clone();
            if is_vocab_table(&name) {
                if let Some(narrow) = halve_columns(&weight)? {
                    weight = narrow;
                }
            }
            let (rows, cols) = weight.dims2()?;
            if cols % group_size != 0 {
                continue;
            }
            let groups = cols / group_size;
            let packed = ((weight - 0.5)? / 2.0)?;
            let base = name.trim_end_matches(".weight").to_string();
            let scales = Tensor::full(2f32, (rows, groups), &Device::Cpu)?;
            let biases = Tensor::full(0.5f32, (rows, groups), &Device::Cpu)?;
            self.tensors.insert(name, packed);
            self.tensors.insert(format!("{}{}", base, SCALES_SUFFIX), scales);
            self.tensors.insert(format!("{}{}", base, BIASES_SUFFIX), biases);
        }
        Ok(self)
    }

    /// Parsed config.
    pub fn config(&self) -> Result<ModelConfig> {
        ModelConfig::from_value(
            &self.config_json,
            &ConfigDefaults::for_architecture(self.architecture),
        )
    }

    /// Loader options for this checkpoint's architecture.
    pub fn options(&self) -> ModelOptions {
        ModelOptions::for_architecture(self.architecture)
    }

    /// The tensors as a weight table.
    pub fn table(&self) -> WeightTable {
        WeightTable::from_tensors(self.tensors.clone())
    }

    /// Write `config.json` and a single `model.safetensors`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.write_config(dir)?;
        candle_core::safetensors::save(&self.tensors, dir.join("model.safetensors"))?;
        Ok(())
    }

    /// Write `config.json` and `shards` files named `model-XXXXX-of-YYYYY.safetensors`.
    pub fn write_sharded(&self, dir: &Path, shards: usize) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.write_config(dir)?;
        let shards = shards.max(1);
        let mut names: Vec<&String> = self.tensors.keys().collect();
        names.sort();
        for shard in 0..shards {
            let part: HashMap<String, Tensor> = names
                .iter()
                .enumerate()
                .filter(|(i, _)| i % shards == shard)
                .map(|(_, n)| ((*n).clone(), self.tensors[*n].clone()))
                .collect();
            let file = format!("model-{:05}-of-{:05}.safetensors", shard + 1, shards);
            candle_core::safetensors::save(&part, dir.join(file))?;
        }
        Ok(())
    }

    fn write_config(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.config_json)?;
        fs::write(dir.join("config.json"), json)?;
        Ok(())
    }
}

struct Builder {
    architecture: Architecture,
    tensors: HashMap<String, Tensor>,
}

impl Builder {
    fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            tensors: HashMap::new(),
        }
    }

    fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Unit weight, plus a zero bias for LayerNorm architectures.
    fn norm(&mut self, stem: &str) -> Result<()> {
        let hidden = SyntheticCheckpoint::HIDDEN;
        self.insert(
            format!("{}.weight", stem),
            Tensor::ones(hidden, DType::F32, &Device::Cpu)?,
        );
        if self.architecture == Architecture::GemmaSmall {
            self.insert(
                format!("{}.bias", stem),
                Tensor::zeros(hidden, DType::F32, &Device::Cpu)?,
            );
        }
        Ok(())
    }

    fn layer(&mut self, i: usize, attn: [Tensor; 4], mlp: [Tensor; 3]) -> Result<()> {
        let prefix = format!("model.layers.{}", i);
        let [q, k, v, o] = attn;
        let [gate, up, down] = mlp;

        match self.architecture {
            Architecture::GemmaSmall => {
                self.insert(format!("{}.self_attn.q_proj.weight", prefix), q);
                self.insert(format!("{}.self_attn.k_proj.weight", prefix), k);
                self.insert(format!("{}.self_attn.v_proj.weight", prefix), v);
                self.insert(format!("{}.mlp.gate_proj.weight", prefix), gate);
                self.insert(format!("{}.mlp.up_proj.weight", prefix), up);
            }
            Architecture::Phi3Mini => {
                self.insert(
                    format!("{}.self_attn.qkv_proj.weight", prefix),
                    Tensor::cat(&[q, k, v], 0)?,
                );
                self.insert(
                    format!("{}.mlp.gate_up_proj.weight", prefix),
                    Tensor::cat(&[gate, up], 0)?,
                );
            }
        }
        self.insert(format!("{}.self_attn.o_proj.weight", prefix), o);
        self.insert(format!("{}.mlp.down_proj.weight", prefix), down);
        self.norm(&format!("{}.input_layernorm", prefix))?;
        self.norm(&format!("{}.post_attention_layernorm", prefix))?;
        Ok(())
    }

    fn finish(self) -> SyntheticCheckpoint {
        let config_json = json!({
            "architectures": [self.architecture.identifier()],
            "vocab_size": SyntheticCheckpoint::VOCAB,
            "hidden_size": SyntheticCheckpoint::HIDDEN,
            "intermediate_size": SyntheticCheckpoint::INTERMEDIATE,
            "num_hidden_layers": SyntheticCheckpoint::LAYERS,
            "num_attention_heads": SyntheticCheckpoint::HEADS,
            "num_key_value_heads": SyntheticCheckpoint::KV_HEADS,
            "head_dim": SyntheticCheckpoint::HEAD_DIM,
            "max_position_embeddings": 64,
            "bos_token_id": 1,
            "eos_token_id": [SyntheticCheckpoint::EOS],
            "pad_token_id": 0,
            "rope_theta": 10000.0,
            "rms_norm_eps": 1e-6,
        });
        SyntheticCheckpoint {
            architecture: self.architecture,
            config_json,
            tensors: self.tensors,
        }
    }
}

/// Surface forms of the synthetic vocabulary, indexed by token id.
pub const WORDS: [&str; SyntheticCheckpoint::VOCAB] = [
    "<eos>", "<bos>", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen",
];

/// Write a whitespace word-level `tokenizer.json` over [`WORDS`].
///
/// Paired with [`SyntheticCheckpoint::counting`], the prompt `"five six"`
/// continues as `"seven eight nine .."`.
pub fn write_word_level_tokenizer(dir: &Path) -> Result<()> {
    let vocab: serde_json::Map<String, Value> = WORDS
        .iter()
        .enumerate()
        .map(|(id, word)| ((*word).to_string(), json!(id)))
        .collect();
    let added_tokens: Vec<Value> = WORDS[..2]
        .iter()
        .enumerate()
        .map(|(id, word)| {
            json!({
                "id": id,
                "content": word,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        })
        .collect();
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<eos>" },
    });
    fs::create_dir_all(dir)?;
    fs::write(
        dir.join("tokenizer.json"),
        serde_json::to_string_pretty(&tokenizer)?,
    )?;
    Ok(())
}

/// A two-word SentencePiece vocabulary: `"five six"` segments as
/// `[13, 16]` under either segmentation.
///
/// Ids 0..=2 are `<unk>`, `<bos>` and `<eos>`.
pub fn sentencepiece_model(kind: SegmentationKind) -> SentencePieceModel {
    let piece = |text: &str, score: f32, kind: PieceKind| Piece {
        text: text.to_string(),
        score,
        kind,
    };
    let mut pieces = vec![
        piece("<unk>", 0.0, PieceKind::Unknown),
        piece("<bos>", 0.0, PieceKind::Control),
        piece("<eos>", 0.0, PieceKind::Control),
        piece("\u{2581}", -5.0, PieceKind::Normal),
    ];
    for c in ["f", "i", "v", "e", "s", "x"] {
        pieces.push(piece(c, -10.0, PieceKind::Normal));
    }
    for (text, score) in [
        ("\u{2581}f", -20.0),
        ("\u{2581}fi", -20.0),
        ("\u{2581}fiv", -20.0),
        ("\u{2581}five", -1.0),
        ("\u{2581}s", -20.0),
        ("\u{2581}si", -20.0),
        ("\u{2581}six", -1.0),
    ] {
        pieces.push(piece(text, score, PieceKind::Normal));
    }
    SentencePieceModel {
        pieces,
        kind,
        byte_fallback: false,
        add_dummy_prefix: true,
    }
}

/// Write [`sentencepiece_model`] as `tokenizer.model`.
pub fn write_sentencepiece_tokenizer(dir: &Path, kind: SegmentationKind) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(
        dir.join(SENTENCEPIECE_FILE),
        encode_model_proto(&sentencepiece_model(kind)),
    )?;
    Ok(())
}

fn counting_embeddings(device: &Device) -> Result<Tensor> {
    let vocab = SyntheticCheckpoint::VOCAB;
    let hidden = SyntheticCheckpoint::HIDDEN;
    let mut data = vec![0f32; vocab * hidden];
    for t in 0..vocab {
        let angle = 2.0 * PI * t as f32 / vocab as f32;
        let base = [angle.cos(), angle.sin(), -angle.cos(), -angle.sin()];
        let row = &mut data[t * hidden..(t + 1) * hidden];
        for (i, value) in row.iter_mut().enumerate() {
            *value = base[(i / 2) % base.len()];
        }
    }
    Ok(Tensor::from_vec(data, (vocab, hidden), device)?)
}

fn is_vocab_table(name: &str) -> bool {
    name == "model.embed_tokens.weight" || name == "lm_head.weight"
}

/// Every other column of `weight`, if repeating each of them twice
/// restores it exactly.
fn halve_columns(weight: &Tensor) -> Result<Option<Tensor>> {
    let (_, cols) = weight.dims2()?;
    if cols < 2 || cols % 2 != 0 {
        return Ok(None);
    }
    let even: Vec<u32> = (0..cols as u32).step_by(2).collect();
    let ids = Tensor::new(even.as_slice(), weight.device())?;
    let narrow = weight.index_select(&ids, 1)?;
    let restored = expand_columns(&narrow, cols)?;
    let lossless = restored.to_vec2::<f32>()? == weight.to_vec2::<f32>()?;
    Ok(lossless.then_some(narrow))
}

/// Deterministic bounded values `scale * sin(index + salt)`.
fn pattern(rows: usize, cols: usize, scale: f32, salt: f32) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| scale * (i as f32 * 0.7 + salt).sin())
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), &Device::Cpu)?)
}
