//! Chunk creation: instance start, first chunks, chunks emitted by steps.
//!
//! Every chunk gets its initial status from the job definition's gating
//! policy at creation time and a per-step sequence one past the highest in
//! use. Sequence allocation is optimistic: two producers racing on the same
//! step collide on the store's uniqueness check and the loser retries.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use batchgate_core::{
    ChunkId, DomainError, JobInstanceId, NewWorkChunk, StepId, WorkChunkStatus,
};

use crate::definition::{JobDefinition, JobDefinitionKey, JobDefinitionRegistry};
use crate::error::{EngineError, EngineResult};
use crate::hierarchy::ChunkBatch;
use crate::instance::{JobInstance, JobInstanceStatus};
use crate::store::{ChunkStore, ChunkStoreError};

const MAX_SEQUENCE_ATTEMPTS: usize = 8;

/// Creates instances and chunks against a store.
pub struct ChunkCreator<S> {
    store: S,
    registry: Arc<JobDefinitionRegistry>,
}

impl<S> ChunkCreator<S>
where
    S: ChunkStore,
{
    pub fn new(store: S, registry: Arc<JobDefinitionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Create a job instance of a registered definition.
    pub fn start_instance(&self, key: &JobDefinitionKey) -> EngineResult<JobInstance> {
        let definition = self.registry.require(key)?;
        let instance = JobInstance::new(definition.key().clone());
        self.store.create_instance(instance.clone())?;
        info!(
            job_instance_id = %instance.id,
            definition = %definition.key(),
            gated = definition.is_gated(),
            steps = definition.step_count(),
            "job instance created"
        );
        Ok(instance)
    }

    /// Create a chunk for the first step of `definition`. Always `READY`.
    pub fn create_first_chunk(
        &self,
        definition: &JobDefinition,
        instance_id: JobInstanceId,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        let instance = self.open_instance(instance_id)?;
        if instance.definition != *definition.key() {
            return Err(DomainError::invariant(format!(
                "job instance {instance_id} runs {}, not {}",
                instance.definition,
                definition.key()
            ))
            .into());
        }
        let first = definition.first_step().id.clone();
        self.insert(definition, instance_id, &first, None, data)
    }

    /// Create a chunk in `step`, declaring the gating the caller expects.
    ///
    /// `gated` must agree with the instance's definition; a mismatch means the
    /// caller is working from a different definition than the one running.
    pub fn create_chunk_in_step(
        &self,
        instance_id: JobInstanceId,
        step: &StepId,
        gated: bool,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        let instance = self.open_instance(instance_id)?;
        let definition = self.registry.require(&instance.definition)?;
        if definition.is_gated() != gated {
            return Err(DomainError::invariant(format!(
                "chunk for step {step} declared gated={gated} but {} is gated={}",
                definition.key(),
                definition.is_gated()
            ))
            .into());
        }
        self.insert(&definition, instance_id, step, None, data)
    }

    /// Create a chunk emitted while processing `parent`.
    pub fn emit_chunk(
        &self,
        instance_id: JobInstanceId,
        step: &StepId,
        parent: Option<ChunkId>,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        let instance = self.open_instance(instance_id)?;
        let definition = self.registry.require(&instance.definition)?;
        self.insert(&definition, instance_id, step, parent, data)
    }

    /// Write a whole batch, parents first. Nothing is written if the batch
    /// is malformed or names an unknown step.
    pub fn create_batch(
        &self,
        instance_id: JobInstanceId,
        batch: ChunkBatch,
    ) -> EngineResult<Vec<ChunkId>> {
        let instance = self.open_instance(instance_id)?;
        let definition = self.registry.require(&instance.definition)?;
        let order = batch.plan()?;
        for node in batch.nodes() {
            definition.require_step(&node.step)?;
        }

        let mut ids = vec![None; batch.len()];
        let mut by_key = std::collections::HashMap::with_capacity(batch.len());
        for idx in order {
            let node = &batch.nodes()[idx];
            let parent = match &node.parent {
                Some(key) => by_key.get(key.as_str()).copied(),
                None => batch.origin,
            };
            let id = self.insert(
                &definition,
                instance_id,
                &node.step,
                parent,
                node.data.clone(),
            )?;
            by_key.insert(node.key.as_str(), id);
            ids[idx] = Some(id);
        }

        debug!(job_instance_id = %instance_id, chunks = ids.len(), "chunk batch created");
        Ok(ids.into_iter().flatten().collect())
    }

    /// Declare that `step` will receive no more chunks.
    pub fn seal_step(&self, instance_id: JobInstanceId, step: &StepId) -> EngineResult<bool> {
        let instance = self
            .store
            .fetch_instance(instance_id)?
            .ok_or(EngineError::JobInstanceNotFound(instance_id))?;
        let definition = self.registry.require(&instance.definition)?;
        definition.require_step(step)?;
        let sealed = self.store.seal_step(instance_id, step)?;
        if sealed {
            debug!(job_instance_id = %instance_id, step_id = %step, "step sealed");
        }
        Ok(sealed)
    }

    fn open_instance(&self, instance_id: JobInstanceId) -> EngineResult<JobInstance> {
        let instance = self
            .store
            .fetch_instance(instance_id)?
            .ok_or(EngineError::JobInstanceNotFound(instance_id))?;
        if instance.status == JobInstanceStatus::Completed {
            return Err(DomainError::invariant(format!(
                "job instance {instance_id} is completed and accepts no new chunks"
            ))
            .into());
        }
        Ok(instance)
    }

    fn insert(
        &self,
        definition: &JobDefinition,
        instance_id: JobInstanceId,
        step: &StepId,
        parent: Option<ChunkId>,
        data: JsonValue,
    ) -> EngineResult<ChunkId> {
        let descriptor = definition.require_step(step)?;
        let initial_status =
            WorkChunkStatus::initial(descriptor.ordinal == 0, definition.is_gated());

        let mut last_conflict = None;
        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let sequence = match self.store.max_sequence(instance_id, step)? {
                Some(max) => max
                    .checked_add(1)
                    .ok_or_else(|| DomainError::invariant(format!("step {step} sequence overflow")))?,
                None => 0,
            };
            let new = NewWorkChunk {
                id: ChunkId::new(),
                job_instance_id: instance_id,
                target_step_id: step.clone(),
                step_ordinal: descriptor.ordinal,
                sequence,
                parent_chunk_id: parent,
                data: data.clone(),
                initial_status,
            };
            match self.store.create_chunk(new) {
                Ok(id) => {
                    debug!(
                        job_instance_id = %instance_id,
                        chunk_id = %id,
                        step_id = %step,
                        sequence,
                        status = initial_status.as_label(),
                        "work chunk created"
                    );
                    return Ok(id);
                }
                Err(err @ ChunkStoreError::DuplicateSequence { .. }) => {
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(last_conflict
            .unwrap_or_else(|| ChunkStoreError::storage("sequence allocation failed"))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChunkStore;
    use serde_json::json;

    fn setup(gated: bool) -> (ChunkCreator<Arc<InMemoryChunkStore>>, Arc<InMemoryChunkStore>, Arc<JobDefinition>) {
        let registry = Arc::new(JobDefinitionRegistry::new());
        let definition = registry
            .register(
                JobDefinition::builder("import", 1)
                    .gated(gated)
                    .step("extract")
                    .step("load")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let store = InMemoryChunkStore::arc();
        (ChunkCreator::new(store.clone(), registry), store, definition)
    }

    fn step(id: &str) -> StepId {
        StepId::parse(id).unwrap()
    }

    #[test]
    fn first_chunk_is_ready_for_gated_and_ungated_jobs() {
        for gated in [true, false] {
            let (creator, store, definition) = setup(gated);
            let instance = creator.start_instance(definition.key()).unwrap();
            let id = creator
                .create_first_chunk(&definition, instance.id, json!({"file": "a.csv"}))
                .unwrap();
            let chunk = store.fetch_chunk(id, true).unwrap().unwrap();
            assert_eq!(chunk.status, WorkChunkStatus::Ready);
            assert_eq!(chunk.data, Some(json!({"file": "a.csv"})));
        }
    }

    #[test]
    fn later_step_initial_status_follows_gating() {
        let (creator, store, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let gated = creator
            .create_chunk_in_step(instance.id, &step("load"), true, json!(null))
            .unwrap();
        assert_eq!(
            store.fetch_chunk(gated, false).unwrap().unwrap().status,
            WorkChunkStatus::GateWaiting
        );

        let (creator, store, definition) = setup(false);
        let instance = creator.start_instance(definition.key()).unwrap();
        let ungated = creator
            .create_chunk_in_step(instance.id, &step("load"), false, json!(null))
            .unwrap();
        assert_eq!(
            store.fetch_chunk(ungated, false).unwrap().unwrap().status,
            WorkChunkStatus::Ready
        );
    }

    #[test]
    fn sequences_are_dense_per_step() {
        let (creator, store, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let ids: Vec<_> = (0..3)
            .map(|i| {
                creator
                    .create_chunk_in_step(instance.id, &step("load"), true, json!(i))
                    .unwrap()
            })
            .collect();
        let sequences: Vec<_> = ids
            .iter()
            .map(|id| store.fetch_chunk(*id, false).unwrap().unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn unknown_step_is_structural() {
        let (creator, _, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let err = creator
            .create_chunk_in_step(instance.id, &step("publish"), true, json!(null))
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::UnknownStep(_))));
        assert!(err.is_structural());
    }

    #[test]
    fn gating_mismatch_is_rejected() {
        let (creator, _, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let err = creator
            .create_chunk_in_step(instance.id, &step("load"), false, json!(null))
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn batch_links_children_to_parents() {
        let (creator, store, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let origin = creator
            .create_first_chunk(&definition, instance.id, json!(null))
            .unwrap();

        let batch = ChunkBatch::from_origin(origin)
            .root("parent", step("load"), json!("p"))
            .child("kid", "parent", step("load"), json!("k"));
        let ids = creator.create_batch(instance.id, batch).unwrap();
        assert_eq!(ids.len(), 2);

        let parent = store.fetch_chunk(ids[0], false).unwrap().unwrap();
        let kid = store.fetch_chunk(ids[1], false).unwrap().unwrap();
        assert_eq!(parent.parent_chunk_id, Some(origin));
        assert_eq!(kid.parent_chunk_id, Some(parent.id));
        assert_eq!(kid.status, WorkChunkStatus::GateWaiting);
    }

    #[test]
    fn cyclic_batch_writes_nothing() {
        let (creator, store, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        let batch = ChunkBatch::new()
            .child("a", "b", step("load"), json!(null))
            .child("b", "a", step("load"), json!(null));
        let err = creator.create_batch(instance.id, batch).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::CyclicHierarchy(_))));
        assert_eq!(store.max_sequence(instance.id, &step("load")).unwrap(), None);
    }

    #[test]
    fn sealing_requires_a_known_step() {
        let (creator, _, definition) = setup(true);
        let instance = creator.start_instance(definition.key()).unwrap();
        assert!(creator.seal_step(instance.id, &step("extract")).unwrap());
        assert!(!creator.seal_step(instance.id, &step("extract")).unwrap());
        assert!(creator.seal_step(instance.id, &step("nope")).is_err());
    }
}
