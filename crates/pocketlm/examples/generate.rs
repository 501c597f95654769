//! One-shot generation through the engine.
//!
//! ```bash
//! cargo run --release -p pocketlm --example generate -- /path/to/model "Why is the sky blue?"
//! ```
//!
//! Without a model directory a synthetic counting checkpoint is written to
//! a temporary directory and used instead.

use anyhow::Result;
use pocketlm::model::synthetic::{write_word_level_tokenizer, SyntheticCheckpoint};
use pocketlm::prelude::*;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let scratch = tempfile::tempdir()?;
    let (model_path, prompt): (PathBuf, String) = match args.as_slice() {
        [_, dir, prompt, ..] => (dir.into(), prompt.clone()),
        [_, dir] => (dir.into(), "Tell me a short story.".to_string()),
        _ => {
            SyntheticCheckpoint::counting(Architecture::Phi3Mini)?.write_to(scratch.path())?;
            write_word_level_tokenizer(scratch.path())?;
            (scratch.path().to_path_buf(), "five six".to_string())
        }
    };

    let engine = Engine::builder()
        .model_path(&model_path)
        .sampling(SamplingParams::greedy())
        .build()
        .await?;
    println!("Engine ready: {:?}", engine);

    let result = engine
        .generate(&prompt)
        .max_tokens(32)
        .temperature(0.0)
        .execute()
        .await?;

    println!("Prompt: {}", prompt);
    println!("Output: {}", result.text);
    println!(
        "{} prompt tokens, {} generated, stopped by {:?}",
        result.num_prompt_tokens, result.num_generated_tokens, result.stop_reason
    );
    if result.placeholder_tokenizer {
        println!("(placeholder tokenizer: output is not real text)");
    }

    engine.unload();
    Ok(())
}
