//! Properties of maintenance passes over arbitrary chunk layouts.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use serde_json::json;

use batchgate_core::{JobInstanceId, WorkChunk, WorkChunkStatus};
use batchgate_engine::fixture::{definition_for, render_snapshot, seed, FixtureLine};
use batchgate_engine::{ChunkStore, EngineConfig, InMemoryEngine, RetryPolicy};

fn any_status() -> impl Strategy<Value = WorkChunkStatus> {
    prop::sample::select(WorkChunkStatus::ALL.to_vec())
}

fn any_layout() -> impl Strategy<Value = Vec<FixtureLine>> {
    prop::collection::vec(
        (1u32..=3, any_status()).prop_map(|(step, status)| FixtureLine { step, status }),
        1..24,
    )
}

fn seeded(lines: &[FixtureLine], gated: bool) -> (InMemoryEngine, JobInstanceId) {
    let engine =
        InMemoryEngine::in_memory(EngineConfig::default().with_retry(RetryPolicy::no_retry()));
    let definition = engine
        .register_definition(definition_for("layout", lines, gated).unwrap())
        .unwrap();
    let instance = engine.start_instance(definition.key()).unwrap();
    seed(engine.store(), &definition, instance.id, lines).unwrap();
    (engine, instance.id)
}

fn chunks(engine: &InMemoryEngine, instance: JobInstanceId) -> Vec<WorkChunk> {
    engine
        .store()
        .fetch_all_chunks_iterator(instance, false)
        .collect::<Result<_, _>>()
        .unwrap()
}

fn step_done(lines: &[FixtureLine], step: u32) -> bool {
    lines
        .iter()
        .filter(|l| l.step == step)
        .all(|l| l.status.counts_as_done())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    /// Property: a second pass over an unchanged instance moves nothing.
    #[test]
    fn maintenance_is_idempotent(lines in any_layout(), gated in any::<bool>()) {
        let (engine, instance) = seeded(&lines, gated);

        engine.run_maintenance_pass(instance).unwrap();
        let first = render_snapshot(&chunks(&engine, instance));
        let report = engine.run_maintenance_pass(instance).unwrap();

        prop_assert!(!report.changed_chunks());
        prop_assert_eq!(render_snapshot(&chunks(&engine, instance)), first);
    }

    /// Property: a waiting chunk past the first step leaves GATE_WAITING
    /// exactly when every chunk of the step before it is done.
    #[test]
    fn gate_opens_only_behind_finished_steps(lines in any_layout()) {
        let (engine, instance) = seeded(&lines, true);
        engine.run_maintenance_pass(instance).unwrap();

        for (line, chunk) in lines.iter().zip(chunks_in_seed_order(&engine, instance, &lines)) {
            if line.status != WorkChunkStatus::GateWaiting || line.step == 1 {
                continue;
            }
            let opened = chunk.status != WorkChunkStatus::GateWaiting;
            prop_assert_eq!(opened, step_done(&lines, line.step - 1), "chunk {}", line);
        }
    }

    /// Property: only chunks that were READY or promoted get queued, and no
    /// other status is touched.
    #[test]
    fn pass_only_moves_waiting_and_ready_chunks(lines in any_layout(), gated in any::<bool>()) {
        let (engine, instance) = seeded(&lines, gated);
        engine.run_maintenance_pass(instance).unwrap();

        for (line, chunk) in lines.iter().zip(chunks_in_seed_order(&engine, instance, &lines)) {
            match line.status {
                WorkChunkStatus::Ready => prop_assert_eq!(chunk.status, WorkChunkStatus::Queued),
                WorkChunkStatus::GateWaiting => prop_assert!(matches!(
                    chunk.status,
                    WorkChunkStatus::GateWaiting | WorkChunkStatus::Queued
                )),
                other => prop_assert_eq!(chunk.status, other),
            }
        }
    }
}

/// Chunks ordered the way `seed` wrote them, so they line up with `lines`.
fn chunks_in_seed_order(
    engine: &InMemoryEngine,
    instance: JobInstanceId,
    lines: &[FixtureLine],
) -> Vec<WorkChunk> {
    let all = chunks(engine, instance);
    let mut seen = vec![0u32; 4];
    lines
        .iter()
        .map(|line| {
            let ordinal = line.step - 1;
            let sequence = seen[ordinal as usize];
            seen[ordinal as usize] += 1;
            all.iter()
                .find(|c| c.step_ordinal == ordinal && c.sequence == sequence)
                .cloned()
                .unwrap()
        })
        .collect()
}

#[test]
fn concurrent_dequeue_claims_a_chunk_once() {
    let engine = Arc::new(InMemoryEngine::in_memory(EngineConfig::default()));
    let lines = vec![FixtureLine { step: 1, status: WorkChunkStatus::Ready }];
    let definition = engine
        .register_definition(definition_for("race", &lines, true).unwrap())
        .unwrap();
    let instance = engine.start_instance(definition.key()).unwrap();
    let id = engine
        .create_first_chunk(&definition, instance.id, json!({"n": 1}))
        .unwrap();
    engine.run_maintenance_pass(instance.id).unwrap();

    let claims: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                scope.spawn(move || engine.on_work_chunk_dequeue(id).unwrap().is_some())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum()
    });

    assert_eq!(claims, 1);
    assert_eq!(
        engine.fetch_chunk(id, false).unwrap().status,
        WorkChunkStatus::InProgress
    );
}
