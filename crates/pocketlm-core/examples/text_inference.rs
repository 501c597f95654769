//! Interactive text generation against a local checkpoint.
//!
//! Run with:
//! ```bash
//! cargo run --release -p pocketlm-core --example text_inference -- /path/to/phi-3-mini
//! ```

use candle_core::Device;
use pocketlm_core::generation::{Generator, SamplingParams};
use pocketlm_core::model::{load_model, Architecture, Phi3PromptBuilder, TokenizerBridge};
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(model_dir) = args.get(1) else {
        eprintln!("Usage: text_inference <model_dir>");
        std::process::exit(2);
    };
    let model_path = Path::new(model_dir);

    let load_start = Instant::now();
    let model = load_model(model_path, &Device::Cpu)?;
    let config = model.config();
    println!(
        "{}: {} layers, {} hidden, loaded in {:.2}s",
        model.architecture(),
        config.num_hidden_layers,
        config.hidden_size,
        load_start.elapsed().as_secs_f64()
    );

    let tokenizer = TokenizerBridge::load_or_placeholder(model_path, model.embedding_rows());
    if tokenizer.is_placeholder() {
        println!("warning: no tokenizer.json or tokenizer.model found; output will not be text");
    }
    let chat = Phi3PromptBuilder::new("You are a helpful assistant.");

    println!("Enter prompts (empty line to quit):\n");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        stdin.read_line(&mut line)?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        let prompt = match model.architecture() {
            Architecture::Phi3Mini => chat.build_prompt(line),
            Architecture::GemmaSmall => line.to_string(),
        };
        let tokens = tokenizer.encode(&prompt, true)?;
        let params = SamplingParams::default()
            .with_max_new_tokens(128)
            .with_stop_token_ids(tokenizer.stop_token_ids());

        let start = Instant::now();
        let mut generator = Generator::new(model.as_ref(), params);
        generator.prime(&tokens)?;
        let mut count = 0usize;
        for token in generator.by_ref() {
            let token = token?;
            print!("{}", tokenizer.decode(&[token])?);
            stdout.flush()?;
            count += 1;
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "\n[{} tokens, {:.1} tok/s, {:?}]\n",
            count,
            count as f64 / elapsed.max(1e-9),
            generator.state()
        );
    }

    Ok(())
}
