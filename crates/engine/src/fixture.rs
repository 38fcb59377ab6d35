//! Text fixtures of chunk states: one `<stepOrdinal>|<STATUS>` line per chunk.
//!
//! Step ordinals in fixtures are 1-based (`1` is the first step). Blank lines
//! and lines starting with `#` are ignored. This is a test and simulation
//! format, not a wire protocol.

use serde_json::json;

use batchgate_core::{
    ChunkId, DomainError, DomainResult, JobInstanceId, NewWorkChunk, WorkChunk, WorkChunkStatus,
};

use crate::definition::JobDefinition;
use crate::error::EngineResult;
use crate::store::ChunkStore;

/// Highest step ordinal a fixture may name.
pub const MAX_FIXTURE_STEPS: u32 = 64;

/// One parsed fixture line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureLine {
    /// 1-based step ordinal.
    pub step: u32,
    pub status: WorkChunkStatus,
}

impl core::fmt::Display for FixtureLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}|{}", self.step, self.status)
    }
}

pub fn parse_fixture(text: &str) -> DomainResult<Vec<FixtureLine>> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (step, status) = line.split_once('|').ok_or_else(|| {
            DomainError::validation(format!("line {}: expected <step>|<STATUS>, got {line:?}", idx + 1))
        })?;
        let step: u32 = step
            .trim()
            .parse()
            .map_err(|e| DomainError::validation(format!("line {}: bad step ordinal: {e}", idx + 1)))?;
        if step == 0 {
            return Err(DomainError::validation(format!(
                "line {}: step ordinals start at 1",
                idx + 1
            )));
        }
        if step > MAX_FIXTURE_STEPS {
            return Err(DomainError::validation(format!(
                "line {}: step ordinal {step} exceeds the limit of {MAX_FIXTURE_STEPS}",
                idx + 1
            )));
        }
        lines.push(FixtureLine {
            step,
            status: status.parse()?,
        });
    }
    Ok(lines)
}

/// Render chunks in canonical order, one fixture line each.
pub fn render_snapshot<'a>(chunks: impl IntoIterator<Item = &'a WorkChunk>) -> String {
    let mut lines: Vec<_> = chunks
        .into_iter()
        .map(|c| {
            (
                (c.step_ordinal, c.sequence, c.id),
                FixtureLine {
                    step: c.step_ordinal + 1,
                    status: c.status,
                },
            )
        })
        .collect();
    lines.sort_by_key(|(key, _)| *key);
    lines
        .into_iter()
        .map(|(_, line)| format!("{line}\n"))
        .collect()
}

/// Definition with one step per ordinal used in `lines`, named `step1`,
/// `step2`, ...
///
/// Lines built by hand bypass [`parse_fixture`], so the ordinal limit is
/// checked again here before any step is allocated.
pub fn definition_for(name: &str, lines: &[FixtureLine], gated: bool) -> DomainResult<JobDefinition> {
    let steps = lines.iter().map(|l| l.step).max().unwrap_or(1);
    if steps > MAX_FIXTURE_STEPS {
        return Err(DomainError::validation(format!(
            "fixture step ordinal {steps} exceeds the limit of {MAX_FIXTURE_STEPS}"
        )));
    }
    let mut builder = JobDefinition::builder(name, 1).gated(gated);
    for step in 1..=steps {
        builder = builder.step(format!("step{step}"));
    }
    builder.build()
}

/// Write fixture chunks verbatim into `instance` and seal every step.
///
/// Statuses are stored as given, without going through the state machine.
pub fn seed<S: ChunkStore>(
    store: &S,
    definition: &JobDefinition,
    instance: JobInstanceId,
    lines: &[FixtureLine],
) -> EngineResult<Vec<ChunkId>> {
    let mut sequences = vec![0u32; definition.step_count()];
    let mut ids = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        let ordinal = line.step - 1;
        let step = definition.step_at(ordinal).ok_or_else(|| {
            DomainError::unknown_step(format!("fixture step {} (job {})", line.step, definition.key()))
        })?;
        let slot = &mut sequences[ordinal as usize];
        let id = store.create_chunk(NewWorkChunk {
            id: ChunkId::new(),
            job_instance_id: instance,
            target_step_id: step.id.clone(),
            step_ordinal: ordinal,
            sequence: *slot,
            parent_chunk_id: None,
            data: json!({ "fixture_line": n + 1 }),
            initial_status: line.status,
        })?;
        *slot += 1;
        ids.push(id);
    }
    for step in definition.steps() {
        store.seal_step(instance, &step.id)?;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::JobInstance;
    use crate::store::InMemoryChunkStore;

    #[test]
    fn parses_lines_and_skips_comments() {
        let lines = parse_fixture("# header\n1|COMPLETED\n\n2|gate_waiting\n").unwrap();
        assert_eq!(
            lines,
            vec![
                FixtureLine { step: 1, status: WorkChunkStatus::Completed },
                FixtureLine { step: 2, status: WorkChunkStatus::GateWaiting },
            ]
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_fixture("1 COMPLETED").is_err());
        assert!(parse_fixture("0|READY").is_err());
        assert!(parse_fixture("x|READY").is_err());
        assert!(parse_fixture("1|DONE").is_err());
    }

    #[test]
    fn huge_step_ordinals_are_rejected() {
        let err = parse_fixture("1|COMPLETED\n4000000000|READY\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse_fixture(&format!("{MAX_FIXTURE_STEPS}|READY")).is_ok());
        assert!(parse_fixture(&format!("{}|READY", MAX_FIXTURE_STEPS + 1)).is_err());

        let hand_built = [FixtureLine { step: u32::MAX, status: WorkChunkStatus::Ready }];
        assert!(definition_for("fixture", &hand_built, true).is_err());
    }

    #[test]
    fn seed_then_render_reproduces_the_fixture() {
        let text = "1|COMPLETED\n2|READY\n2|QUEUED\n2|FAILED\n";
        let lines = parse_fixture(text).unwrap();
        let definition = definition_for("fixture", &lines, true).unwrap();
        let store = InMemoryChunkStore::new();
        let instance = store
            .create_instance(JobInstance::new(definition.key().clone()))
            .unwrap();

        seed(&store, &definition, instance, &lines).unwrap();
        let chunks: Vec<_> = store
            .fetch_all_chunks_iterator(instance, false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(render_snapshot(&chunks), text);
        assert!(store.fetch_instance(instance).unwrap().unwrap().sealed_steps.len() == 2);
    }

    #[test]
    fn seed_rejects_steps_beyond_the_definition() {
        let definition = definition_for("fixture", &parse_fixture("1|READY").unwrap(), true).unwrap();
        let store = InMemoryChunkStore::new();
        let instance = store
            .create_instance(JobInstance::new(definition.key().clone()))
            .unwrap();
        let err = seed(&store, &definition, instance, &parse_fixture("3|READY").unwrap()).unwrap_err();
        assert!(err.is_structural());
    }
}
