//! Golden token validation.
//!
//! Without arguments, validates the pinned cases against the synthetic
//! counting checkpoint of every supported architecture. With a model
//! directory and a JSON file of cases, validates a real checkpoint:
//!
//! ```bash
//! cargo run -p pocketlm-core --example golden_validation
//! cargo run -p pocketlm-core --example golden_validation -- /path/to/model golden_cases.json
//! ```
//!
//! Each JSON case is `{ "name", "input_tokens", "expected_tokens", "max_tokens" }`.

use candle_core::Device;
use pocketlm_core::model::synthetic::SyntheticCheckpoint;
use pocketlm_core::model::{
    load_model, Architecture, GoldenCase, GoldenSummary, GoldenTestHarness, TokenizerBridge,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Golden case as stored in JSON.
#[derive(Debug, Deserialize)]
struct JsonGoldenCase {
    name: String,
    input_tokens: Vec<u32>,
    expected_tokens: Vec<u32>,
    max_tokens: usize,
}

impl From<JsonGoldenCase> for GoldenCase {
    fn from(json: JsonGoldenCase) -> Self {
        GoldenCase::greedy(json.name, json.input_tokens, json.expected_tokens)
            .with_max_tokens(json.max_tokens)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let all_passed = match args.as_slice() {
        [_] => validate_synthetic()?,
        [_, model_dir, cases] => validate_checkpoint(Path::new(model_dir), Path::new(cases))?,
        _ => {
            eprintln!("Usage: golden_validation [<model_dir> <golden_cases.json>]");
            std::process::exit(2);
        }
    };

    if all_passed {
        println!("All golden tests passed!");
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn validate_synthetic() -> anyhow::Result<bool> {
    let mut all_passed = true;
    for arch in Architecture::ALL {
        let dir = tempfile::tempdir()?;
        SyntheticCheckpoint::counting(arch)?.write_to(dir.path())?;
        let model = load_model(dir.path(), &Device::Cpu)?;

        let summary = GoldenTestHarness::counting_cases().run_model(model.as_ref());
        println!("{}: {}", arch, summary);
        all_passed &= summary.all_passed();
    }
    Ok(all_passed)
}

fn validate_checkpoint(model_dir: &Path, cases: &Path) -> anyhow::Result<bool> {
    let json_cases: Vec<JsonGoldenCase> = serde_json::from_str(&fs::read_to_string(cases)?)?;
    let mut harness = GoldenTestHarness::new();
    for case in json_cases {
        harness.add_case(case.into());
    }
    println!("Loaded {} test cases", harness.cases().len());

    let load_start = Instant::now();
    let model = load_model(model_dir, &Device::Cpu)?;
    println!(
        "Loaded {} in {:.2}s",
        model.architecture(),
        load_start.elapsed().as_secs_f64()
    );
    let tokenizer = TokenizerBridge::load_or_placeholder(model_dir, model.embedding_rows());

    let summary = harness.run_model(model.as_ref());
    println!("{}", summary);
    report_failures(&summary, &tokenizer);
    Ok(summary.all_passed())
}

fn report_failures(summary: &GoldenSummary, tokenizer: &TokenizerBridge) {
    for result in summary.results.values().filter(|r| !r.passed) {
        let Some(idx) = result.first_divergence else {
            continue;
        };
        let show = |token: Option<&u32>| match token {
            Some(&t) => format!("{} ({:?})", t, tokenizer.decode(&[t]).unwrap_or_default()),
            None => "EOF".to_string(),
        };
        println!("{}: position {}", result.name, idx);
        println!("  expected: {}", show(result.expected.get(idx)));
        println!("  actual:   {}", show(result.actual.get(idx)));
    }
}
