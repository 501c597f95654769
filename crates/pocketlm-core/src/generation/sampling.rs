//! Sampling parameters and the token sampler.

use crate::error::{PocketError, Result};
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Logit temperature. `0.0` selects greedy decoding.
    pub temperature: f32,
    /// Sample only among the `top_k` most probable tokens (0 = all).
    pub top_k: usize,
    /// Seed for the sampler's PRNG. Same seed and input give the same output.
    pub seed: u64,
    /// Maximum number of new tokens.
    pub max_new_tokens: usize,
    /// Overrides the model's configured EOS id.
    pub eos_token_id: Option<u32>,
    /// Additional ids that end generation (e.g. a chat end-of-turn token).
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            seed: 42,
            max_new_tokens: 128,
            eos_token_id: None,
            stop_token_ids: Vec::new(),
        }
    }
}

impl SamplingParams {
    /// Greedy decoding (temperature 0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the PRNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the new-token budget.
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Override the EOS id.
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Add ids that also stop generation.
    pub fn with_stop_token_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.stop_token_ids.extend(ids);
        self
    }

    /// Whether these parameters decode greedily.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Picks the next token from a logits vector.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    rng: StdRng,
}

impl Sampler {
    /// Sampler configured from `params`.
    pub fn new(params: &SamplingParams) -> Self {
        Self {
            temperature: params.temperature,
            top_k: params.top_k,
            rng: StdRng::seed_from_u64(params.seed),
        }
    }

    /// Sample from logits of shape `[vocab]` (any leading unit dims are flattened).
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        self.sample_slice(&logits)
    }

    /// Sample from a logits slice.
    pub fn sample_slice(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(PocketError::Generation("empty logits".to_string()));
        }
        if self.temperature <= 0.0 {
            return Ok(greedy(logits));
        }

        let mut ranked: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let k = match self.top_k {
            0 => ranked.len(),
            k => k.min(ranked.len()),
        };
        ranked.truncate(k);

        let max_logit = ranked[0].1;
        let weights: Vec<f32> = ranked
            .iter()
            .map(|&(_, l)| ((l - max_logit) / self.temperature).exp())
            .collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| PocketError::Generation(format!("invalid sampling weights: {}", e)))?;
        Ok(ranked[dist.sample(&mut self.rng)].0)
    }
}

/// Index of the first maximal logit.
pub fn greedy(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}
