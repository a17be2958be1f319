//! Block scheduler benchmarks
//!
//! One block through a 48000-sample filter, uniform vs two-stream.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use graal_core::{ConvolutionMode, DEFAULT_ACCUM_LOOPS};
use graal_dsp::{BlockScheduler, FhtPlan, FilterBank, PartitionLayout, SchedulerConfig};

const KERNEL_LENGTH: usize = 48_000;

fn build(block: usize, mode: ConvolutionMode, ratio: usize) -> BlockScheduler {
    let config = SchedulerConfig {
        layout: PartitionLayout::new(block, KERNEL_LENGTH, mode, ratio).unwrap(),
        accum_loops: DEFAULT_ACCUM_LOOPS,
        fade_length: block,
        mad_cycle_offset: 1,
    };
    let layout = config.layout;
    let fine = Arc::new(FhtPlan::new(block * 2).unwrap());
    let coarse = layout
        .has_stream2()
        .then(|| Arc::new(FhtPlan::new(layout.coarse_block_size() * 2).unwrap()));
    let mut scheduler =
        BlockScheduler::new(config, Arc::clone(&fine), coarse.clone(), 1).unwrap();

    let ir: Vec<f32> = (0..KERNEL_LENGTH)
        .map(|i| (i as f32 * 0.37).sin() * (-(i as f32) / 12_000.0).exp())
        .collect();
    let bank = FilterBank::prepare(&layout, &fine, coarse.as_deref(), &ir).unwrap();
    scheduler.request_update([(0, Arc::new(bank))]).unwrap();
    scheduler
}

fn bench_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_block");

    for (name, mode, ratio) in [
        ("uniform", ConvolutionMode::Uniform, 1),
        ("two_stream_x8", ConvolutionMode::NonUniform, 8),
    ] {
        for block in [128, 256] {
            let mut scheduler = build(block, mode, ratio);
            let input: Vec<f32> = (0..block).map(|i| (i as f32 * 0.05).sin()).collect();
            let mut output = vec![0.0; block];

            group.throughput(Throughput::Elements(block as u64));
            group.bench_with_input(BenchmarkId::new(name, block), &block, |b, _| {
                b.iter(|| {
                    scheduler
                        .process_block(&[Some(black_box(&input[..]))], &mut [&mut output[..]])
                        .unwrap();
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_block);
criterion_main!(benches);
