use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use batchgate_core::{JobInstanceId, WorkChunkStatus};
use batchgate_engine::fixture::{definition_for, seed, FixtureLine};
use batchgate_engine::gate::{GatePolicy, StepTally};
use batchgate_engine::{ChunkStore, EngineConfig, InMemoryEngine, RetryPolicy};

/// Two gated steps: `done` finished chunks in step 1 and as many waiting in step 2.
fn gated_layout(done: usize) -> Vec<FixtureLine> {
    let first = (0..done).map(|_| FixtureLine {
        step: 1,
        status: WorkChunkStatus::Completed,
    });
    let second = (0..done).map(|_| FixtureLine {
        step: 2,
        status: WorkChunkStatus::GateWaiting,
    });
    first.chain(second).collect()
}

fn setup(lines: &[FixtureLine]) -> (InMemoryEngine, JobInstanceId) {
    let engine =
        InMemoryEngine::in_memory(EngineConfig::default().with_retry(RetryPolicy::no_retry()));
    let definition = engine
        .register_definition(definition_for("bench", lines, true).unwrap())
        .unwrap();
    let instance = engine.start_instance(definition.key()).unwrap();
    seed(engine.store(), &definition, instance.id, lines).unwrap();
    (engine, instance.id)
}

fn bench_gate_opening_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate_opening_pass");

    for size in [100usize, 1_000, 10_000] {
        let lines = gated_layout(size);
        group.throughput(Throughput::Elements((size * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &lines, |b, lines| {
            b.iter_batched(
                || setup(lines),
                |(engine, instance)| black_box(engine.run_maintenance_pass(instance).unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_steady_state_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("steady_state_pass");

    for size in [100usize, 1_000, 10_000] {
        let (engine, instance) = setup(&gated_layout(size));
        engine.run_maintenance_pass(instance).unwrap();
        group.throughput(Throughput::Elements((size * 2) as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| black_box(engine.run_maintenance_pass(instance).unwrap()));
        });
    }

    group.finish();
}

fn bench_chunk_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_scan");
    let size = 10_000;
    let (engine, instance) = setup(&gated_layout(size / 2));
    group.throughput(Throughput::Elements(size as u64));

    group.bench_function("iterator_without_data", |b| {
        b.iter(|| {
            let tally: StepTally = engine
                .store()
                .fetch_all_chunks_iterator(instance, false)
                .map(|c| c.unwrap().status)
                .collect();
            black_box(GatePolicy::default().evaluate(&tally, true))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_gate_opening_pass,
    bench_steady_state_pass,
    bench_chunk_scan
);
criterion_main!(benches);
