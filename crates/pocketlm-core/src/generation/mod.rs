//! Token generation.
//!
//! [`SamplingParams`] configures a run, [`Sampler`] turns logits into a
//! token and [`Generator`] drives the prime/decode loop over a
//! [`CausalLm`](crate::model::CausalLm).

mod generator;
mod sampling;

pub use generator::{generate, GenerationOutput, GenerationState, Generator, StopReason};
pub use sampling::{greedy, Sampler, SamplingParams};
