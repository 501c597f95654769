//! Decode-step latency as the KV cache grows.
//!
//! Each iteration runs one single-token step against a cache already
//! holding `context` positions, so the measured cost is the attention
//! over the cached prefix plus the fixed per-token projections.

use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pocketlm_core::model::synthetic::SyntheticCheckpoint;
use pocketlm_core::model::{Architecture, KvCache, Transformer};

fn load(arch: Architecture) -> Transformer {
    let checkpoint = SyntheticCheckpoint::random(arch, 0).unwrap();
    let config = checkpoint.config().unwrap();
    Transformer::load(
        &checkpoint.table(),
        &config,
        arch,
        checkpoint.options(),
        &Device::Cpu,
    )
    .unwrap()
}

/// Cache primed with `context` tokens.
fn primed(model: &Transformer, context: usize) -> KvCache {
    let mut cache = model.new_cache();
    let prompt: Vec<u32> = (0..context)
        .map(|i| (i % SyntheticCheckpoint::VOCAB) as u32)
        .collect();
    model.forward(&prompt, &mut cache).unwrap();
    cache
}

fn bench_decode_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_step");
    group.throughput(Throughput::Elements(1));

    for arch in Architecture::ALL {
        let model = load(arch);
        for context in [1usize, 16, 48] {
            let cache = primed(&model, context);
            group.bench_with_input(
                BenchmarkId::new(arch.display_name(), context),
                &context,
                |b, _| {
                    b.iter(|| {
                        let mut cache = cache.clone();
                        black_box(model.step(black_box(&[3u32][..]), &mut cache).unwrap())
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_prefill(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefill");
    let model = load(Architecture::Phi3Mini);

    for len in [4usize, 16, 32] {
        let prompt: Vec<u32> = (0..len).map(|i| (i % 16) as u32).collect();
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &prompt, |b, prompt| {
            b.iter(|| {
                let mut cache = model.new_cache();
                black_box(model.forward(prompt, &mut cache).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode_step, bench_prefill);
criterion_main!(benches);
