//! Golden token test harness for model validation.
//!
//! Validates generated token sequences against known-good ones, so that
//! greedy output stays fixed across code changes and checkpoint layouts.
//!
//! - [`GoldenCase`]: prompt, expected continuation and sampling settings
//! - [`GoldenTestHarness`]: a set of cases run against a generator
//! - [`GoldenResult`] / [`GoldenSummary`]: per-case and aggregate outcome
//!
//! # Determinism
//!
//! Use `temperature = 0.0` (greedy) or a fixed seed with `top_k = 1`.

use super::CausalLm;
use crate::error::Result;
use crate::generation::{generate, SamplingParams};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// A single golden test case.
#[derive(Debug, Clone)]
pub struct GoldenCase {
    /// Test case name for identification.
    pub name: String,
    /// Prompt tokens.
    pub input_tokens: Vec<u32>,
    /// Expected generated tokens.
    pub expected_tokens: Vec<u32>,
    /// Temperature (0.0 for greedy).
    pub temperature: f32,
    /// Top-k (0 for all).
    pub top_k: usize,
    /// Sampler seed.
    pub seed: u64,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Tags for filtering.
    pub tags: Vec<String>,
}

impl Default for GoldenCase {
    fn default() -> Self {
        Self {
            name: String::new(),
            input_tokens: Vec::new(),
            expected_tokens: Vec::new(),
            temperature: 0.0,
            top_k: 1,
            seed: 0,
            max_tokens: 10,
            tags: Vec::new(),
        }
    }
}

impl GoldenCase {
    /// A greedy case whose budget is the expected length.
    pub fn greedy(name: impl Into<String>, input: Vec<u32>, expected: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            max_tokens: expected.len(),
            input_tokens: input,
            expected_tokens: expected,
            ..Default::default()
        }
    }

    /// Parse space-separated decimal ids.
    pub fn parse(name: impl Into<String>, input: &str, expected: &str) -> Self {
        let parse_tokens = |s: &str| -> Vec<u32> {
            s.split_whitespace().filter_map(|t| t.parse().ok()).collect()
        };
        Self::greedy(name, parse_tokens(input), parse_tokens(expected))
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set max tokens.
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    /// Sampling parameters for this case.
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::greedy()
            .with_temperature(self.temperature)
            .with_top_k(self.top_k)
            .with_seed(self.seed)
            .with_max_new_tokens(self.max_tokens)
    }
}

/// Result of a single golden test.
#[derive(Debug, Clone)]
pub struct GoldenResult {
    /// Test case name.
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Expected tokens.
    pub expected: Vec<u32>,
    /// Actual tokens produced.
    pub actual: Vec<u32>,
    /// First divergence index (if any).
    pub first_divergence: Option<usize>,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Execution time in milliseconds.
    pub time_ms: f64,
}

impl GoldenResult {
    /// Compare `actual` with `expected` token by token.
    pub fn compare(name: String, expected: Vec<u32>, actual: Vec<u32>, time_ms: f64) -> Self {
        let len = expected.len().max(actual.len());
        let first_divergence = (0..len).find(|&i| expected.get(i) != actual.get(i));

        let error = first_divergence.map(|idx| {
            let show = |t: Option<&u32>| t.map(|t| t.to_string()).unwrap_or_else(|| "EOF".to_string());
            format!(
                "divergence at index {}: expected {}, got {}",
                idx,
                show(expected.get(idx)),
                show(actual.get(idx))
            )
        });

        Self {
            name,
            passed: first_divergence.is_none(),
            expected,
            actual,
            first_divergence,
            error,
            time_ms,
        }
    }

    /// A case whose generator failed.
    pub fn error(name: String, error: String) -> Self {
        Self {
            name,
            passed: false,
            expected: Vec::new(),
            actual: Vec::new(),
            first_divergence: None,
            error: Some(error),
            time_ms: 0.0,
        }
    }
}

impl fmt::Display for GoldenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "[{}] {} ({:.1}ms)", status, self.name, self.time_ms)?;
        if let Some(ref err) = self.error {
            write!(f, "\n  {}", err)?;
        }
        Ok(())
    }
}

/// Summary of golden test results.
#[derive(Debug, Clone, Default)]
pub struct GoldenSummary {
    /// Total number of tests.
    pub total: usize,
    /// Number of passed tests.
    pub passed: usize,
    /// Number of failed tests.
    pub failed: usize,
    /// Results by name.
    pub results: HashMap<String, GoldenResult>,
}

impl GoldenSummary {
    /// Create from results.
    pub fn from_results(results: Vec<GoldenResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total,
            passed,
            failed: total - passed,
            results: results.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Check if all tests passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for GoldenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "golden: {}/{} passed", self.passed, self.total)?;
        let mut failed: Vec<_> = self.results.values().filter(|r| !r.passed).collect();
        failed.sort_by(|a, b| a.name.cmp(&b.name));
        for result in failed {
            writeln!(f, "  {}", result)?;
        }
        Ok(())
    }
}

/// Golden test harness.
#[derive(Debug, Clone, Default)]
pub struct GoldenTestHarness {
    cases: Vec<GoldenCase>,
}

impl GoldenTestHarness {
    /// Create an empty harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a test case.
    pub fn add_case(&mut self, case: GoldenCase) {
        self.cases.push(case);
    }

    /// All test cases.
    pub fn cases(&self) -> &[GoldenCase] {
        &self.cases
    }

    /// Cases carrying `tag`.
    pub fn filter_by_tag(&self, tag: &str) -> Vec<&GoldenCase> {
        self.cases
            .iter()
            .filter(|c| c.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Run every case through `generator`.
    pub fn run_with<F>(&self, mut generator: F) -> GoldenSummary
    where
        F: FnMut(&GoldenCase) -> Result<Vec<u32>>,
    {
        let results = self
            .cases
            .iter()
            .map(|case| {
                let start = Instant::now();
                match generator(case) {
                    Ok(actual) => GoldenResult::compare(
                        case.name.clone(),
                        case.expected_tokens.clone(),
                        actual,
                        start.elapsed().as_secs_f64() * 1000.0,
                    ),
                    Err(e) => GoldenResult::error(case.name.clone(), e.to_string()),
                }
            })
            .collect();
        GoldenSummary::from_results(results)
    }

    /// Run every case through the generation loop of `model`.
    pub fn run_model(&self, model: &dyn CausalLm) -> GoldenSummary {
        self.run_with(|case| {
            generate(model, &case.input_tokens, &case.sampling()).map(|out| out.tokens)
        })
    }

    /// Pinned cases for [`SyntheticCheckpoint::counting`](super::synthetic::SyntheticCheckpoint::counting).
    pub fn counting_cases() -> Self {
        let mut harness = Self::new();
        harness.add_case(
            GoldenCase::greedy("three_token_prompt", vec![3, 7, 1], vec![2, 3, 4, 5, 6])
                .with_tag("e2e"),
        );
        harness.add_case(
            GoldenCase::greedy("wraps_to_eos", vec![12, 13], vec![14, 15, 0])
                .with_max_tokens(8)
                .with_tag("eos"),
        );
        harness.add_case(GoldenCase::parse("single_token", "9", "10 11 12"));
        harness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PocketError;
    use crate::model::synthetic::SyntheticCheckpoint;
    use crate::model::{Architecture, ModelRegistry};
    use candle_core::Device;

    #[test]
    fn compare_reports_first_divergence() {
        let result = GoldenResult::compare("t".to_string(), vec![1, 2, 3], vec![1, 9, 3], 1.0);
        assert!(!result.passed);
        assert_eq!(result.first_divergence, Some(1));
        assert!(result.error.unwrap().contains("expected 2, got 9"));

        let short = GoldenResult::compare("t".to_string(), vec![1, 2, 3], vec![1, 2], 1.0);
        assert_eq!(short.first_divergence, Some(2));
        assert!(format!("{}", short).contains("got EOF"));

        assert!(GoldenResult::compare("t".to_string(), vec![4], vec![4], 0.0).passed);
    }

    #[test]
    fn run_with_counts_failures_and_errors() {
        let mut harness = GoldenTestHarness::new();
        harness.add_case(GoldenCase::greedy("pass", vec![1], vec![10, 20]));
        harness.add_case(GoldenCase::greedy("fail", vec![2], vec![30, 40]));
        harness.add_case(GoldenCase::greedy("error", vec![], vec![1]));

        let summary = harness.run_with(|case| match case.input_tokens.first() {
            Some(&base) => Ok(vec![base * 10, base * 20]),
            None => Err(PocketError::Generation("empty prompt".to_string())),
        });
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 2);
        assert!(summary.results["error"].error.as_ref().unwrap().contains("empty prompt"));
        assert!(summary.to_string().contains("1/3 passed"));
    }

    #[test]
    fn case_sampling_and_tags() {
        let case = GoldenCase::parse("p", "1 2", "3 4 5").with_tag("x");
        assert_eq!(case.max_tokens, 3);
        assert!(case.sampling().is_greedy());
        assert_eq!(case.sampling().max_new_tokens, 3);

        let harness = GoldenTestHarness::counting_cases();
        assert_eq!(harness.filter_by_tag("e2e").len(), 1);
    }

    #[test]
    fn counting_model_matches_pinned_tokens() {
        let registry = ModelRegistry::with_defaults();
        for arch in Architecture::ALL {
            let dir = tempfile::tempdir().unwrap();
            SyntheticCheckpoint::counting(arch)
                .unwrap()
                .write_to(dir.path())
                .unwrap();
            let model = registry.load_model(dir.path(), &Device::Cpu).unwrap();

            let summary = GoldenTestHarness::counting_cases().run_model(model.as_ref());
            assert!(summary.all_passed(), "{}: {}", arch, summary);
        }
    }

    #[test]
    fn quantized_counting_model_matches_pinned_tokens() {
        for arch in Architecture::ALL {
            let dir = tempfile::tempdir().unwrap();
            let ckpt = SyntheticCheckpoint::counting(arch)
                .unwrap()
                .affine_quantized(4)
                .unwrap();
            // Vocabulary tables are stored at half width and must be expanded on load
            assert_eq!(
                ckpt.tensors["model.embed_tokens.weight"].dims()[1],
                SyntheticCheckpoint::HIDDEN / 2
            );
            ckpt.write_to(dir.path()).unwrap();

            let model = ModelRegistry::default()
                .load_model(dir.path(), &Device::Cpu)
                .unwrap();
            assert_eq!(model.architecture(), arch);
            assert_eq!(model.config().hidden_size, SyntheticCheckpoint::HIDDEN);
            let summary = GoldenTestHarness::counting_cases().run_model(model.as_ref());
            assert!(summary.all_passed(), "{}: {}", arch, summary);
        }
    }
}
