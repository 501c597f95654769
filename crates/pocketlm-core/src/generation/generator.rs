//! Autoregressive generation loop.
//!
//! A [`Generator`] moves through three states:
//!
//! - `Priming`: prompt tokens are fed one at a time through
//!   [`CausalLm::step`], building the KV cache; only the last logits are kept
//! - `Decoding`: each call samples a token from the current logits and,
//!   unless it stops, feeds it back to refresh logits and cache
//! - `Stopped`: an EOS or stop token was sampled, or the budget is spent
//!
//! Every step depends only on the current token and the cache.

use super::{Sampler, SamplingParams};
use crate::error::{PocketError, Result};
use crate::model::{CausalLm, KvCache};
use candle_core::Tensor;
use tracing::{debug, info};

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model's (or overridden) EOS id was sampled.
    Eos,
    /// One of [`SamplingParams::stop_token_ids`] was sampled.
    StopToken(u32),
    /// `max_new_tokens` tokens were produced.
    MaxTokens,
}

/// Loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Waiting for the prompt.
    Priming,
    /// Logits for the next position are ready.
    Decoding,
    /// Finished.
    Stopped(StopReason),
}

/// Result of a finished generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Generated ids, including a terminating EOS or stop token.
    pub tokens: Vec<u32>,
    /// Prompt length.
    pub num_prompt_tokens: usize,
    /// Why decoding stopped.
    pub stop_reason: StopReason,
}

/// One generation session over a borrowed model and an owned cache.
pub struct Generator<'m> {
    model: &'m dyn CausalLm,
    cache: KvCache,
    sampler: Sampler,
    params: SamplingParams,
    eos_token_id: u32,
    state: GenerationState,
    logits: Option<Tensor>,
    generated: Vec<u32>,
    num_prompt_tokens: usize,
}

impl<'m> Generator<'m> {
    /// Start a session with a fresh cache.
    pub fn new(model: &'m dyn CausalLm, params: SamplingParams) -> Self {
        let eos_token_id = params.eos_token_id.unwrap_or(model.config().eos_token_id);
        Self {
            model,
            cache: model.new_cache(),
            sampler: Sampler::new(&params),
            params,
            eos_token_id,
            state: GenerationState::Priming,
            logits: None,
            generated: Vec::new(),
            num_prompt_tokens: 0,
        }
    }

    /// Feed the prompt through the model one token at a time.
    pub fn prime(&mut self, prompt: &[u32]) -> Result<()> {
        if self.state != GenerationState::Priming {
            return Err(PocketError::Generation("generator already primed".to_string()));
        }
        if prompt.is_empty() {
            return Err(PocketError::Generation("empty prompt".to_string()));
        }

        let mut logits = None;
        for &token in prompt {
            logits = Some(self.model.step(&[token], &mut self.cache)?);
        }
        self.logits = logits;
        self.num_prompt_tokens = prompt.len();
        self.state = if self.params.max_new_tokens == 0 {
            GenerationState::Stopped(StopReason::MaxTokens)
        } else {
            GenerationState::Decoding
        };
        debug!(prompt_tokens = prompt.len(), "primed cache");
        Ok(())
    }

    /// Sample the next token; `None` once stopped.
    ///
    /// If refreshing the logits fails, the sampled token is discarded and
    /// the cache, logits and sampler state are left as they were, so a
    /// retry draws the same token.
    pub fn next_token(&mut self) -> Result<Option<u32>> {
        match self.state {
            GenerationState::Priming => {
                return Err(PocketError::Generation(
                    "prime the generator before decoding".to_string(),
                ))
            }
            GenerationState::Stopped(_) => return Ok(None),
            GenerationState::Decoding => {}
        }

        let logits = self
            .logits
            .take()
            .ok_or_else(|| PocketError::Generation("no logits to sample from".to_string()))?;
        let sampler_before = self.sampler.clone();
        let token = self.sampler.sample(&logits)?;

        if let Some(reason) = self.stop_reason_for(token) {
            self.generated.push(token);
            self.state = GenerationState::Stopped(reason);
            return Ok(Some(token));
        }
        if self.generated.len() + 1 >= self.params.max_new_tokens {
            self.generated.push(token);
            self.state = GenerationState::Stopped(StopReason::MaxTokens);
            return Ok(Some(token));
        }

        match self.model.step(&[token], &mut self.cache) {
            Ok(next) => {
                self.logits = Some(next);
                self.generated.push(token);
                Ok(Some(token))
            }
            Err(e) => {
                self.logits = Some(logits);
                self.sampler = sampler_before;
                Err(e)
            }
        }
    }

    fn stop_reason_for(&self, token: u32) -> Option<StopReason> {
        if token == self.eos_token_id {
            Some(StopReason::Eos)
        } else if self.params.stop_token_ids.contains(&token) {
            Some(StopReason::StopToken(token))
        } else {
            None
        }
    }

    /// Current state.
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Tokens generated so far.
    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    /// The session's cache.
    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Finish the session.
    pub fn finish(self) -> Result<GenerationOutput> {
        match self.state {
            GenerationState::Stopped(stop_reason) => Ok(GenerationOutput {
                tokens: self.generated,
                num_prompt_tokens: self.num_prompt_tokens,
                stop_reason,
            }),
            state => Err(PocketError::Generation(format!(
                "generation not finished ({:?})",
                state
            ))),
        }
    }
}

impl Iterator for Generator<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

impl std::fmt::Debug for Generator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("architecture", &self.model.architecture())
            .field("state", &self.state)
            .field("generated", &self.generated.len())
            .field("cached", &self.cache.seq_len())
            .finish()
    }
}

/// Run a complete generation for `prompt`.
pub fn generate(
    model: &dyn CausalLm,
    prompt: &[u32],
    params: &SamplingParams,
) -> Result<GenerationOutput> {
    let mut generator = Generator::new(model, params.clone());
    generator.prime(prompt)?;
    while generator.next_token()?.is_some() {}
    let output = generator.finish()?;
    info!(
        generated = output.tokens.len(),
        stop_reason = ?output.stop_reason,
        "generation finished"
    );
    Ok(output)
}
